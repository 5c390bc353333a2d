use serde::{Deserialize, Serialize};

pub mod device;
pub mod error;
pub mod params;
pub mod preamble;
pub mod scpi;
pub mod tables;

pub use crate::device::DeviceModel;
pub use crate::error::{Error, FramingError, TransportError};
pub use crate::params::{Advance, AcquisitionPlan, WaveformParameters};
pub use crate::preamble::{FieldValue, Preamble, PREAMBLE_LENGTH};
pub use crate::tables::parse_channel_list;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duration {
    pub micros: u32,
    pub seconds: u32,
}

impl Duration {
    pub const fn from_millis(millis: u32) -> Self {
        Duration {
            seconds: millis / 1000,
            micros: (millis % 1000) * 1000,
        }
    }

    pub const fn from_secs(seconds: u32) -> Self {
        Duration { seconds, micros: 0 }
    }
}

impl From<Duration> for std::time::Duration {
    fn from(x: Duration) -> Self {
        std::time::Duration::from_micros(x.micros as u64) + std::time::Duration::from_secs(x.seconds as u64)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(x: std::time::Duration) -> Self {
        let seconds = x.as_secs();
        let micros = x.subsec_micros();
        Duration {
            micros,
            seconds: seconds as u32,
        }
    }
}
