use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::config::{ConfigStore, DiscoverySettings, PersistedConfig};
use crate::serial::{PortProvider, SerialDeviceInfo};
use super::session::{DeviceSession, SessionLinks};
use super::{
    CloseReason, ConnectedDevice, DeviceError, DeviceEvent, DisplayActuator, DisplayTarget,
    MappingTable, OrientationApplier, Result, ScanClaim, ScanRegistry, SessionEvent, SessionRegistry,
};

/// State shared by the scan loop, probes and the event pump
struct Discovery {
    settings: Arc<DiscoverySettings>,
    provider: Arc<dyn PortProvider>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<SessionRegistry>,
    scans: Arc<ScanRegistry>,
    mapping: Arc<MappingTable>,
    applier: OrientationApplier,
    /// device address -> port it last identified on
    known_ports: RwLock<HashMap<String, String>>,
    /// Held from snapshot to save so an older snapshot never lands last
    persist_lock: Mutex<()>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

impl Discovery {
    fn publish(&self, event: DeviceEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let config = PersistedConfig {
            mappings: self.mapping.snapshot(),
            last_ports: self.known_ports.read().await.clone(),
        };
        if let Err(e) = self.store.save(&config).await {
            log::warn!("Failed to persist device config: {}", e);
        }
    }
}

/// Channels a running discovery hands to probes
#[derive(Clone)]
struct SessionWiring {
    shutdown: watch::Receiver<bool>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
}

struct DiscoveryRuntime {
    shutdown_tx: watch::Sender<bool>,
    wiring: SessionWiring,
    sessions: Arc<Mutex<JoinSet<()>>>,
    scan_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

/// Discovery scheduler.
/// Enumerates ports, probes unclaimed ones, reconciles live sessions and owns
/// the mapping table.
pub struct DeviceManager {
    shared: Arc<Discovery>,
    runtime: Mutex<Option<DiscoveryRuntime>>,
}

impl DeviceManager {
    pub fn new(
        settings: DiscoverySettings,
        provider: Arc<dyn PortProvider>,
        display: Arc<dyn DisplayActuator>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Discovery {
                settings: Arc::new(settings),
                provider,
                store,
                registry: Arc::new(SessionRegistry::new()),
                scans: ScanRegistry::new(),
                mapping: Arc::new(MappingTable::new()),
                applier: OrientationApplier::new(display),
                known_ports: RwLock::new(HashMap::new()),
                persist_lock: Mutex::new(()),
                events_tx,
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.shared.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    pub fn scans(&self) -> &ScanRegistry {
        &self.shared.scans
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Load persisted mappings and start the periodic scan loop
    pub async fn start_discovery(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(DeviceError::AlreadyRunning);
        }

        let config = self.shared.store.load().await?;
        log::info!(
            "Loaded {} mappings and {} known devices",
            config.mappings.len(),
            config.last_ports.len()
        );
        self.shared.mapping.replace_all(config.mappings);
        *self.shared.known_ports.write().await = config.last_ports;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (session_events, session_events_rx) = mpsc::unbounded_channel();
        let wiring = SessionWiring {
            shutdown: shutdown_rx,
            session_events,
        };
        let sessions = Arc::new(Mutex::new(JoinSet::new()));

        let pump_task = tokio::spawn(pump_events(self.shared.clone(), session_events_rx));
        let scan_task = tokio::spawn(scan_loop(self.shared.clone(), wiring.clone(), sessions.clone()));

        *runtime = Some(DiscoveryRuntime {
            shutdown_tx,
            wiring,
            sessions,
            scan_task,
            pump_task,
        });
        log::info!("Device discovery started (scan every {:?})", self.shared.settings.scan_interval());
        Ok(())
    }

    /// Stop scanning and close every session, waiting at most the shutdown grace period
    pub async fn stop_discovery(&self) -> Result<()> {
        let runtime = self.runtime.lock().await.take().ok_or(DeviceError::NotRunning)?;
        let grace = self.shared.settings.shutdown_grace();
        log::info!("Stopping device discovery");

        let _ = runtime.shutdown_tx.send(true);
        self.shared.registry.shutdown_all().await;

        let mut scan_task = runtime.scan_task;
        if timeout(grace, &mut scan_task).await.is_err() {
            log::warn!("Scan loop did not stop within {:?}, aborting it", grace);
            scan_task.abort();
        }

        let mut sessions = std::mem::take(&mut *runtime.sessions.lock().await);
        let drained = timeout(grace, async {
            while let Some(result) = sessions.join_next().await {
                log_task_result(result);
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("{} sessions still running after {:?}, aborting them", sessions.len(), grace);
            sessions.shutdown().await;
        }

        // Last senders go away here so the pump drains and exits
        drop(runtime.wiring);
        let mut pump_task = runtime.pump_task;
        if timeout(grace, &mut pump_task).await.is_err() {
            log::warn!("Event pump did not drain within {:?}, aborting it", grace);
            pump_task.abort();
        }

        for pruned in self.shared.registry.prune_dead().await {
            if let Some(address) = pruned.address {
                self.shared.publish(DeviceEvent::DeviceDisconnected { address });
            }
        }
        log::info!("Device discovery stopped");
        Ok(())
    }

    /// Run one enumeration and reconcile pass now
    pub async fn rescan(&self) -> Result<()> {
        let (wiring, sessions) = {
            let runtime = self.runtime.lock().await;
            let runtime = runtime.as_ref().ok_or(DeviceError::NotRunning)?;
            (runtime.wiring.clone(), runtime.sessions.clone())
        };
        scan_pass(&self.shared, &wiring, &sessions).await;
        Ok(())
    }

    pub async fn list_connected_devices(&self) -> Vec<ConnectedDevice> {
        self.shared.registry.connected().await
    }

    /// Map a device to a display target, validating the index first
    pub async fn map_device(&self, address: &str, target_index: usize) -> Result<()> {
        self.shared.applier.validate_target(target_index).await?;
        let previous = self.shared.mapping.set(address, target_index);
        if previous != Some(target_index) {
            log::info!("Mapped {} to target {}", address, target_index);
            self.shared.persist().await;
        }
        Ok(())
    }

    /// Remove a device's mapping; returns whether one existed
    pub async fn unmap_device(&self, address: &str) -> bool {
        match self.shared.mapping.clear(address) {
            Some(previous) => {
                log::info!("Unmapped {} from target {}", address, previous);
                self.shared.persist().await;
                true
            }
            None => false,
        }
    }

    pub fn mappings(&self) -> HashMap<String, usize> {
        self.shared.mapping.snapshot()
    }

    pub async fn known_ports(&self) -> HashMap<String, String> {
        self.shared.known_ports.read().await.clone()
    }

    pub async fn list_targets(&self) -> Result<Vec<DisplayTarget>> {
        self.shared.applier.display().list_targets().await
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.runtime.try_lock() {
            if let Some(runtime) = runtime.take() {
                let _ = runtime.shutdown_tx.send(true);
            }
        }
    }
}

async fn scan_loop(shared: Arc<Discovery>, wiring: SessionWiring, sessions: Arc<Mutex<JoinSet<()>>>) {
    let mut interval = tokio::time::interval(shared.settings.scan_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = wiring.shutdown.clone();

    loop {
        tokio::select! {
            _ = interval.tick() => scan_pass(&shared, &wiring, &sessions).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    log::debug!("Scan loop exited");
}

async fn scan_pass(shared: &Arc<Discovery>, wiring: &SessionWiring, sessions: &Arc<Mutex<JoinSet<()>>>) {
    {
        let mut sessions = sessions.lock().await;
        while let Some(result) = sessions.try_join_next() {
            log_task_result(result);
        }
    }

    let ports = match shared.provider.available_ports().await {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            return;
        }
    };
    let present: HashSet<String> = ports.iter().map(|info| info.port_name.clone()).collect();

    for port in shared.registry.close_vanished(&present).await {
        log::info!("Port {} disappeared, closing its session", port);
    }
    for pruned in shared.registry.prune_dead().await {
        log::warn!("Removed orphaned session {} on {}", pruned.session_id, pruned.port);
        if let Some(address) = pruned.address {
            shared.publish(DeviceEvent::DeviceDisconnected { address });
        }
    }

    if *wiring.shutdown.borrow() {
        return;
    }

    let owned = shared.registry.owned_ports().await;
    let connected: HashSet<String> = shared
        .registry
        .connected()
        .await
        .into_iter()
        .map(|device| device.address)
        .collect();
    let candidates = {
        let known = shared.known_ports.read().await;
        order_candidates(ports, &known, &connected)
    };

    for (port, expected) in candidates {
        if owned.contains(&port) {
            continue;
        }
        let Some(claim) = shared.scans.try_claim(&port) else {
            continue;
        };
        // A probe may have identified and dropped its claim since `owned` was taken
        if shared.registry.owns_port(&port).await {
            continue;
        }
        match &expected {
            Some(address) => log::debug!("Probing {} (expecting {})", port, address),
            None => log::debug!("Probing {}", port),
        }
        sessions
            .lock()
            .await
            .spawn(probe(shared.clone(), claim, expected, wiring.clone()));
    }
}

/// Candidate ports with the address expected on each, previously known devices first
fn order_candidates(
    ports: Vec<SerialDeviceInfo>,
    known: &HashMap<String, String>,
    connected: &HashSet<String>,
) -> Vec<(String, Option<String>)> {
    let expected_by_port: HashMap<&str, &str> = known
        .iter()
        .filter(|(address, _)| !connected.contains(*address))
        .map(|(address, port)| (port.as_str(), address.as_str()))
        .collect();

    let mut candidates: Vec<(String, Option<String>)> = ports
        .into_iter()
        .map(|info| {
            let expected = expected_by_port.get(info.port_name.as_str()).map(|a| a.to_string());
            (info.port_name, expected)
        })
        .collect();
    // Stable: known ports keep enumeration order among themselves
    candidates.sort_by_key(|(_, expected)| expected.is_none());
    candidates
}

async fn probe(shared: Arc<Discovery>, claim: ScanClaim, expected: Option<String>, wiring: SessionWiring) {
    let port = claim.port().to_string();
    let session_id = Uuid::new_v4();
    let (commands_tx, commands_rx) = mpsc::channel(8);
    // Registered as Connecting before the open so a port is never opened twice
    if let Err(e) = shared.registry.claim_port(&port, session_id, commands_tx).await {
        log::debug!("Skipping probe of {}: {}", port, e);
        return;
    }

    let io = match shared.provider.open(&port, shared.settings.baud_rate).await {
        Ok(io) => io,
        Err(e) => {
            shared.registry.release(&port, session_id).await;
            drop(claim);
            let _ = wiring.session_events.send(SessionEvent::Closed {
                session_id,
                port,
                address: None,
                reason: CloseReason::OpenFailed(e.to_string()),
            });
            return;
        }
    };

    let links = SessionLinks {
        settings: shared.settings.clone(),
        registry: shared.registry.clone(),
        mapping: shared.mapping.clone(),
        applier: shared.applier.clone(),
        events: wiring.session_events,
    };
    DeviceSession::new(session_id, port, expected, Some(claim), links)
        .run(io, commands_rx, wiring.shutdown)
        .await;
}

/// Turn session lifecycle messages into collaborator events
async fn pump_events(shared: Arc<Discovery>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Identified { address, port, .. } => {
                shared.publish(DeviceEvent::DeviceDiscovered { address: address.clone() });
                shared.publish(DeviceEvent::DeviceConnected {
                    address: address.clone(),
                    port: port.clone(),
                });

                let moved = {
                    let mut known = shared.known_ports.write().await;
                    known.insert(address, port.clone()).as_deref() != Some(port.as_str())
                };
                if moved {
                    shared.persist().await;
                }
            }
            SessionEvent::OrientationChanged { address, target_index, orientation } => {
                shared.publish(DeviceEvent::OrientationChanged {
                    address,
                    target_index,
                    orientation,
                });
            }
            SessionEvent::Closed { address: Some(address), port, reason, .. } => {
                log::info!("Device {} disconnected from {} ({:?})", address, port, reason);
                shared.publish(DeviceEvent::DeviceDisconnected { address });
            }
            SessionEvent::Closed { address: None, port, reason: CloseReason::OpenFailed(e), .. } => {
                log::debug!("Could not open {}: {}", port, e);
            }
            SessionEvent::Closed { address: None, .. } => {}
        }
    }
    log::debug!("Session event pump drained");
}

fn log_task_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            log::error!("Device session task panicked: {}", e);
        }
    }
}
