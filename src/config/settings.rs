use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use super::{ConfigError, Result};
use crate::serial::{framing::DEFAULT_BUFFER_CAP, interface::BAUD_RATE};

/// Discovery and session tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Period between port enumeration passes
    pub scan_interval_ms: u64,
    /// How long a freshly opened port may stay silent before it is nudged
    pub identify_timeout_ms: u64,
    /// Extra wait after the nudge before the port is released
    pub identify_grace_ms: u64,
    pub buffer_cap: usize,
    pub baud_rate: u32,
    /// Written once to a port that has not identified by the deadline
    pub nudge: String,
    pub read_chunk: usize,
    /// Only probe USB serial ports
    pub usb_only: bool,
    /// Upper bound on how long `stop_discovery` waits for sessions to wind down
    pub shutdown_grace_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5000,
            identify_timeout_ms: 10_000,
            identify_grace_ms: 2000,
            buffer_cap: DEFAULT_BUFFER_CAP,
            baud_rate: BAUD_RATE,
            nudge: "?\n".to_string(),
            read_chunk: 512,
            usb_only: true,
            shutdown_grace_ms: 3000,
        }
    }
}

impl DiscoverySettings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let settings: Self = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid("scan_interval_ms must be greater than zero".into()));
        }
        if self.buffer_cap == 0 || self.read_chunk == 0 {
            return Err(ConfigError::Invalid("buffer_cap and read_chunk must be greater than zero".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn identify_grace(&self) -> Duration {
        Duration::from_millis(self.identify_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
