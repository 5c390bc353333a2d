//! Driver for Siglent SDS oscilloscopes over the raw socket SCPI port.
//!
//! All traffic to an instrument is serialized through a single [`Dispatcher`]. Commands can be
//! queued with callbacks, awaited, or sent blocking through the [`Scope`] facade.

pub mod acquisition;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod framing;
pub mod scope;
pub mod store;

#[cfg(test)]
mod sim;

pub use sds_protocol::scpi::Value;
pub use sds_protocol::{
    parse_channel_list, DeviceModel, Error, FramingError, TransportError, WaveformParameters,
};

pub use crate::acquisition::Waveforms;
pub use crate::config::{ScopeConfig, Timeouts};
pub use crate::dispatcher::{Command, Completion, Dispatcher};
pub use crate::scope::Scope;

pub type Result<T> = std::result::Result<T, Error>;
