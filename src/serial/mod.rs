pub mod framing;
pub mod interface;
pub mod telemetry;

pub use framing::{FrameError, FrameExtractor, Frames, DEFAULT_BUFFER_CAP};
pub use interface::{PortProvider, SerialInterface, SerialPortIO, SystemPorts};
pub use telemetry::{Orientation, TelemetryError, TelemetryRecord};

use serde::{Deserialize, Serialize};

/// A serial port seen during enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    /// Port with no USB metadata attached
    pub fn bare(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    pub fn is_usb(&self) -> bool {
        self.vid.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Connection closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Transient errors are retried on the next delivery instead of closing the session
    pub fn is_transient(&self) -> bool {
        match self {
            SerialError::Timeout => true,
            SerialError::IoError(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
