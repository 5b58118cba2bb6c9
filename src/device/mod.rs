pub mod display;
pub mod manager;
pub mod mapping;
pub mod models;
pub mod registry;
pub mod session;

pub use display::{DisplayActuator, DisplayTarget, OrientationApplier, VirtualDisplay};
pub use manager::DeviceManager;
pub use mapping::{MappingChange, MappingTable};
pub use models::*;
pub use registry::{ScanClaim, ScanRegistry, SessionRegistry};


#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Discovery is already running")]
    AlreadyRunning,

    #[error("Discovery is not running")]
    NotRunning,

    #[error("Port {0} is already claimed by a live session")]
    PortClaimed(String),

    #[error("Address {address} is already connected on {port}")]
    DuplicateAddress { address: String, port: String },

    #[error("Target index {index} out of range ({count} targets available)")]
    TargetOutOfRange { index: usize, count: usize },

    #[error("Display error: {0}")]
    Display(String),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
