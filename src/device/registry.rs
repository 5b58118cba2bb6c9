//! Shared ownership registries.
//!
//! `SessionRegistry` is the single source of truth for which ports are held by
//! a live session. Sessions start out keyed by port and are moved under their
//! address in one write-locked step, so a session is always visible under
//! exactly one key. `ScanRegistry` tracks probes in flight so a port is never
//! probed twice at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::{CloseReason, ConnectedDevice, DeviceError, Orientation, Result, SessionCommand, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    Port(String),
    Address(String),
}

#[derive(Debug, Clone)]
struct SessionEntry {
    session_id: Uuid,
    port: String,
    address: Option<String>,
    state: SessionState,
    orientation: Orientation,
    target_index: Option<usize>,
    connected_at: DateTime<Utc>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionEntry {
    fn to_connected(&self) -> Option<ConnectedDevice> {
        let address = self.address.clone()?;
        Some(ConnectedDevice {
            session_id: self.session_id,
            address,
            port: self.port.clone(),
            orientation: self.orientation,
            target_index: self.target_index,
            connected_at: self.connected_at,
        })
    }
}

/// Orphaned session removed by `prune_dead`
#[derive(Debug, Clone)]
pub struct PrunedSession {
    pub session_id: Uuid,
    pub port: String,
    pub address: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionKey, SessionEntry>,
    ports: HashMap<String, SessionKey>,
}

impl RegistryInner {
    fn entry_for_port(&mut self, port: &str, session_id: Uuid) -> Option<&mut SessionEntry> {
        let key = self.ports.get(port)?;
        self.sessions
            .get_mut(key)
            .filter(|entry| entry.session_id == session_id)
    }
}

/// Live device sessions, by port and by address
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim a port for a new session, before the port is opened
    pub(crate) async fn claim_port(
        &self,
        port: &str,
        session_id: Uuid,
        commands: mpsc::Sender<SessionCommand>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.ports.contains_key(port) {
            return Err(DeviceError::PortClaimed(port.to_string()));
        }

        let key = SessionKey::Port(port.to_string());
        inner.sessions.insert(key.clone(), SessionEntry {
            session_id,
            port: port.to_string(),
            address: None,
            state: SessionState::Connecting,
            orientation: Orientation::default(),
            target_index: None,
            connected_at: Utc::now(),
            commands,
        });
        inner.ports.insert(port.to_string(), key);
        Ok(())
    }

    /// Move a probing session from its port key to its address key
    pub(crate) async fn promote(
        &self,
        port: &str,
        session_id: Uuid,
        address: &str,
        target_index: Option<usize>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let address_key = SessionKey::Address(address.to_string());
        if let Some(existing) = inner.sessions.get(&address_key) {
            return Err(DeviceError::DuplicateAddress {
                address: address.to_string(),
                port: existing.port.clone(),
            });
        }

        let port_key = SessionKey::Port(port.to_string());
        let matches = inner
            .sessions
            .get(&port_key)
            .map_or(false, |entry| entry.session_id == session_id);
        if !matches {
            return Err(DeviceError::NotFound(port.to_string()));
        }

        if let Some(mut entry) = inner.sessions.remove(&port_key) {
            entry.address = Some(address.to_string());
            entry.state = SessionState::Identified { mapped: target_index.is_some() };
            entry.target_index = target_index;
            inner.sessions.insert(address_key.clone(), entry);
            inner.ports.insert(port.to_string(), address_key);
        }
        Ok(())
    }

    pub(crate) async fn set_state(&self, port: &str, session_id: Uuid, state: SessionState) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entry_for_port(port, session_id) {
            entry.state = state;
        }
    }

    pub(crate) async fn set_orientation(&self, port: &str, session_id: Uuid, orientation: Orientation) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entry_for_port(port, session_id) {
            entry.orientation = orientation;
        }
    }

    pub(crate) async fn set_target(&self, port: &str, session_id: Uuid, target_index: Option<usize>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entry_for_port(port, session_id) {
            entry.target_index = target_index;
            if entry.address.is_some() {
                entry.state = SessionState::Identified { mapped: target_index.is_some() };
            }
        }
    }

    /// Drop a session's registration. Only the session that claimed the port can release it.
    pub(crate) async fn release(&self, port: &str, session_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let Some(key) = inner.ports.get(port).cloned() else {
            return false;
        };
        let owned = inner
            .sessions
            .get(&key)
            .map_or(false, |entry| entry.session_id == session_id);
        if owned {
            inner.sessions.remove(&key);
            inner.ports.remove(port);
        }
        owned
    }

    pub async fn owns_port(&self, port: &str) -> bool {
        self.inner.read().await.ports.contains_key(port)
    }

    pub async fn owned_ports(&self) -> HashSet<String> {
        self.inner.read().await.ports.keys().cloned().collect()
    }

    pub async fn state_of_port(&self, port: &str) -> Option<SessionState> {
        let inner = self.inner.read().await;
        let key = inner.ports.get(port)?;
        inner.sessions.get(key).map(|entry| entry.state)
    }

    pub async fn lookup_address(&self, address: &str) -> Option<ConnectedDevice> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(&SessionKey::Address(address.to_string()))
            .and_then(SessionEntry::to_connected)
    }

    /// Identified sessions only
    pub async fn connected(&self) -> Vec<ConnectedDevice> {
        let inner = self.inner.read().await;
        let mut devices: Vec<ConnectedDevice> = inner
            .sessions
            .values()
            .filter_map(SessionEntry::to_connected)
            .collect();
        devices.sort_by(|a, b| a.port.cmp(&b.port));
        devices
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ask every session on a port missing from `present` to close
    pub(crate) async fn close_vanished(&self, present: &HashSet<String>) -> Vec<String> {
        let targets: Vec<(String, mpsc::Sender<SessionCommand>)> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|entry| !present.contains(&entry.port))
                .map(|entry| (entry.port.clone(), entry.commands.clone()))
                .collect()
        };

        let mut vanished = Vec::with_capacity(targets.len());
        for (port, commands) in targets {
            if commands.try_send(SessionCommand::Shutdown(CloseReason::PortVanished)).is_err() {
                log::debug!("Session on {} did not accept shutdown request", port);
            }
            vanished.push(port);
        }
        vanished
    }

    /// Remove entries whose session task is gone without unregistering
    pub(crate) async fn prune_dead(&self) -> Vec<PrunedSession> {
        let mut inner = self.inner.write().await;
        let dead: Vec<SessionKey> = inner
            .sessions
            .iter()
            .filter(|(_, entry)| entry.commands.is_closed())
            .map(|(key, _)| key.clone())
            .collect();

        let mut pruned = Vec::with_capacity(dead.len());
        for key in dead {
            if let Some(entry) = inner.sessions.remove(&key) {
                inner.ports.remove(&entry.port);
                pruned.push(PrunedSession {
                    session_id: entry.session_id,
                    port: entry.port,
                    address: entry.address,
                });
            }
        }
        pruned
    }

    pub(crate) async fn shutdown_all(&self) {
        let inner = self.inner.read().await;
        for entry in inner.sessions.values() {
            let _ = entry.commands.try_send(SessionCommand::Shutdown(CloseReason::Shutdown));
        }
    }
}

/// Ports currently being probed, with the time each probe started
#[derive(Default)]
pub struct ScanRegistry {
    probes: DashMap<String, Instant>,
}

impl ScanRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a port for probing; `None` if a probe is already in flight
    pub fn try_claim(self: &Arc<Self>, port: &str) -> Option<ScanClaim> {
        match self.probes.entry(port.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(ScanClaim {
                    registry: Arc::clone(self),
                    port: port.to_string(),
                })
            }
        }
    }

    pub fn contains(&self, port: &str) -> bool {
        self.probes.contains_key(port)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Probes in flight and how long each has been running
    pub fn in_flight(&self) -> Vec<(String, Duration)> {
        self.probes
            .iter()
            .map(|probe| (probe.key().clone(), probe.value().elapsed()))
            .collect()
    }
}

/// Scan registry entry, released when dropped
#[derive(Debug)]
pub struct ScanClaim {
    registry: Arc<ScanRegistry>,
    port: String,
}

impl ScanClaim {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for ScanClaim {
    fn drop(&mut self) {
        self.registry.probes.remove(&self.port);
    }
}

impl std::fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRegistry").field("in_flight", &self.probes.len()).finish()
    }
}
