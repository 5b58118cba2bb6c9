use std::time::Duration;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Result, SerialError, SerialDeviceInfo};

pub const BAUD_RATE: u32 = 115200;

/// Byte-level connection owned by a single device session.
///
/// `read_chunk` resolves when bytes arrive; `Ok(0)` means the peer went away.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

/// Source of candidate ports and connections to them
#[async_trait::async_trait]
pub trait PortProvider: Send + Sync {
    /// Enumerate the ports currently present on the host
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>>;

    /// Open a port for exclusive use by one session
    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>>;
}

/// Open serial port backed by tokio-serial
pub struct SerialInterface {
    port_name: String,
    stream: SerialStream,
}

impl SerialInterface {
    pub fn connect(port_name: &str, baud_rate: u32) -> Result<Self> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::debug!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(Self {
            port_name: port_name.to_string(),
            stream,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait::async_trait]
impl SerialPortIO for SerialInterface {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(SerialError::Timeout),
            Err(e) => Err(SerialError::IoError(e)),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        log::debug!("Releasing serial port {}", self.port_name);
    }
}

/// Host serial ports as reported by the OS
pub struct SystemPorts {
    usb_only: bool,
}

impl SystemPorts {
    pub fn new(usb_only: bool) -> Self {
        Self { usb_only }
    }

    fn describe(port: serialport::SerialPortInfo) -> SerialDeviceInfo {
        match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo::bare(port.port_name),
        }
    }
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait::async_trait]
impl PortProvider for SystemPorts {
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let usb_only = self.usb_only;
        // Enumeration can touch sysfs/registry, keep it off the async workers
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| SerialError::ConnectionFailed(format!("Port enumeration task failed: {}", e)))??;

        Ok(ports
            .into_iter()
            .map(Self::describe)
            .filter(|info| !usb_only || info.is_usb())
            .collect())
    }

    async fn open(&self, port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        let interface = SerialInterface::connect(port_name, baud_rate)?;
        Ok(Box::new(interface))
    }
}
