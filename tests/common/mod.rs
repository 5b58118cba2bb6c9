#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use tiltlink_lib::config::{DiscoverySettings, MemoryConfigStore, PersistedConfig};
use tiltlink_lib::device::{DeviceEvent, DeviceManager, VirtualDisplay};
use tiltlink_lib::serial::{PortProvider, Result, SerialDeviceInfo, SerialError, SerialPortIO};

/// What the next read on a fake line delivers
enum Delivery {
    Bytes(Vec<u8>),
    Timeout,
    Broken,
}

/// Sender side of a fake serial line
pub struct MockLine {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl MockLine {
    pub fn send(&self, data: &str) {
        let _ = self.tx.send(Delivery::Bytes(data.as_bytes().to_vec()));
    }

    /// Next read fails with a transient timeout
    pub fn time_out(&self) {
        let _ = self.tx.send(Delivery::Timeout);
    }

    /// Next read fails with a hard I/O error
    pub fn break_line(&self) {
        let _ = self.tx.send(Delivery::Broken);
    }
}

struct PortState {
    pending: Option<mpsc::UnboundedReceiver<Delivery>>,
    /// Keeps re-opened silent lines from hitting end-of-stream
    idle: Vec<mpsc::UnboundedSender<Delivery>>,
    opens: usize,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// In-memory port provider; ports appear when plugged
pub struct MockPorts {
    present: Mutex<Vec<String>>,
    ports: Mutex<HashMap<String, PortState>>,
    open_delay: Duration,
}

impl MockPorts {
    pub fn new() -> Arc<Self> {
        Self::with_open_delay(Duration::ZERO)
    }

    pub fn with_open_delay(open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            present: Mutex::new(Vec::new()),
            ports: Mutex::new(HashMap::new()),
            open_delay,
        })
    }

    /// Make a port enumerable; bytes sent on the returned line reach the next session that opens it
    pub fn plug(&self, port: &str) -> MockLine {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut present = self.present.lock().unwrap();
            if !present.iter().any(|p| p == port) {
                present.push(port.to_string());
            }
        }
        let mut ports = self.ports.lock().unwrap();
        let state = ports.entry(port.to_string()).or_insert_with(|| PortState {
            pending: None,
            idle: Vec::new(),
            opens: 0,
            writes: Arc::new(Mutex::new(Vec::new())),
        });
        state.pending = Some(rx);
        MockLine { tx }
    }

    pub fn unplug(&self, port: &str) {
        self.present.lock().unwrap().retain(|p| p != port);
    }

    pub fn open_count(&self, port: &str) -> usize {
        self.ports.lock().unwrap().get(port).map_or(0, |state| state.opens)
    }

    pub fn writes(&self, port: &str) -> Vec<Vec<u8>> {
        self.ports
            .lock()
            .unwrap()
            .get(port)
            .map(|state| state.writes.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PortProvider for MockPorts {
    async fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        Ok(self
            .present
            .lock()
            .unwrap()
            .iter()
            .map(|port| SerialDeviceInfo::bare(port.clone()))
            .collect())
    }

    async fn open(&self, port_name: &str, _baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if !self.present.lock().unwrap().iter().any(|p| p == port_name) {
            return Err(SerialError::PortNotFound(port_name.to_string()));
        }

        let mut ports = self.ports.lock().unwrap();
        let state = ports
            .get_mut(port_name)
            .ok_or_else(|| SerialError::PortNotFound(port_name.to_string()))?;
        state.opens += 1;
        let rx = match state.pending.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.idle.push(tx);
                rx
            }
        };
        Ok(Box::new(MockIo {
            rx,
            leftover: Vec::new(),
            writes: state.writes.clone(),
        }))
    }
}

struct MockIo {
    rx: mpsc::UnboundedReceiver<Delivery>,
    leftover: Vec<u8>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl SerialPortIO for MockIo {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv().await {
                Some(Delivery::Bytes(bytes)) => self.leftover = bytes,
                Some(Delivery::Timeout) => return Err(SerialError::Timeout),
                Some(Delivery::Broken) => {
                    return Err(SerialError::IoError(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "line broken",
                    )))
                }
                None => return Ok(0),
            }
        }
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

/// Settings where only the initial scan tick fires on its own
pub fn test_settings() -> DiscoverySettings {
    DiscoverySettings {
        scan_interval_ms: 3_600_000,
        identify_timeout_ms: 5_000,
        identify_grace_ms: 500,
        shutdown_grace_ms: 2_000,
        usb_only: false,
        ..Default::default()
    }
}

pub struct Rig {
    pub manager: DeviceManager,
    pub ports: Arc<MockPorts>,
    pub display: Arc<VirtualDisplay>,
    pub store: Arc<MemoryConfigStore>,
    pub events: broadcast::Receiver<DeviceEvent>,
}

pub fn rig(settings: DiscoverySettings, ports: Arc<MockPorts>, config: PersistedConfig) -> Rig {
    let display = Arc::new(VirtualDisplay::new(3));
    let store = Arc::new(MemoryConfigStore::new(config));
    let manager = DeviceManager::new(settings, ports.clone(), display.clone(), store.clone());
    let events = manager.subscribe();
    Rig { manager, ports, display, store, events }
}

pub async fn next_event(events: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for device event")
        .expect("event channel closed")
}

/// Skip events until one matches
pub async fn wait_for<F>(events: &mut broadcast::Receiver<DeviceEvent>, mut predicate: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// Poll until `check` holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
