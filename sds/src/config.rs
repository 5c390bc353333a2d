use std::path::Path;

use serde::{Deserialize, Serialize};

use sds_protocol::{DeviceModel, Duration};

use crate::Error;

/// Upper bound for bytes buffered while searching a reply delimiter.
pub const DEFAULT_BUFFER_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Reading a delimited text reply.
    pub text: Duration,
    /// Each step of reading a binary block header.
    pub block_header: Duration,
    /// Reading the payload of a binary block.
    pub block_payload: Duration,
    /// Silence that ends a resynchronizing drain after a failed command.
    pub drain: Duration,
    /// Base budget of a blocking call, in addition to any post-wait of the command.
    pub command: Duration,
    /// Budget of a blocking multi-chunk acquisition.
    pub acquisition: Duration,
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            text: Duration::from_secs(2),
            block_header: Duration::from_secs(1),
            block_payload: Duration::from_secs(1),
            drain: Duration::from_millis(100),
            command: Duration::from_secs(5),
            acquisition: Duration::from_secs(60),
            connect: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub model: DeviceModel,
    pub timeouts: Timeouts,
    pub buffer_limit: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        ScopeConfig {
            model: DeviceModel::default(),
            timeouts: Timeouts::default(),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

impl ScopeConfig {
    pub fn from_json(data: &str) -> crate::Result<Self> {
        serde_json::from_str(data).map_err(Error::argument)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(Error::transport)?;
        Self::from_json(&data)
    }
}
