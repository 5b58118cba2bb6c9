//! Discovery, identification and framing for USB-serial orientation sensors.
//!
//! Ports are enumerated on a fixed interval and every unclaimed port is probed
//! by its own [`device::session::DeviceSession`]. Sessions reassemble JSON
//! frames from the raw byte stream, learn the device address from the first
//! valid frame, and push orientation changes to the mapped display target.

pub mod serial;
pub mod device;
pub mod config;

pub use config::{ConfigStore, DiscoverySettings, JsonConfigStore, MemoryConfigStore, PersistedConfig};
pub use device::{
    ConnectedDevice, DeviceError, DeviceEvent, DeviceManager, DisplayActuator, DisplayTarget,
    Orientation, VirtualDisplay,
};
pub use serial::{PortProvider, SerialDeviceInfo, SerialPortIO, SystemPorts};
