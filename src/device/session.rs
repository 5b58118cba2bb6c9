//! One open serial connection and everything derived from its byte stream.
//!
//! A session is `Connecting` while its port opens and `Probing` once it is open. The first frame that
//! decodes with an address promotes it to `Identified`, after which the address
//! is fixed for the session's lifetime. A session that stays silent past the
//! identification deadline is nudged once, given a grace period, and then
//! closed so the port can be probed again.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::DiscoverySettings;
use crate::serial::{FrameExtractor, SerialPortIO, TelemetryRecord};
use super::{
    CloseReason, MappingChange, MappingTable, Orientation, OrientationApplier, ScanClaim,
    SessionCommand, SessionEvent, SessionRegistry, SessionState,
};

/// Shared handles a session needs from the scheduler
#[derive(Clone)]
pub(crate) struct SessionLinks {
    pub settings: Arc<DiscoverySettings>,
    pub registry: Arc<SessionRegistry>,
    pub mapping: Arc<MappingTable>,
    pub applier: OrientationApplier,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

pub struct DeviceSession {
    id: Uuid,
    port: String,
    extractor: FrameExtractor,
    state: SessionState,
    address: Option<String>,
    /// Address last seen on this port, if the device was known
    expected_address: Option<String>,
    orientation: Orientation,
    target_index: Option<usize>,
    claim: Option<ScanClaim>,
    links: SessionLinks,
}

impl DeviceSession {
    pub(crate) fn new(
        id: Uuid,
        port: String,
        expected_address: Option<String>,
        claim: Option<ScanClaim>,
        links: SessionLinks,
    ) -> Self {
        Self {
            id,
            port,
            extractor: FrameExtractor::with_cap(links.settings.buffer_cap),
            state: SessionState::Connecting,
            address: None,
            expected_address,
            orientation: Orientation::default(),
            target_index: None,
            claim,
            links,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn is_identified(&self) -> bool {
        self.address.is_some()
    }

    /// Drive the session until it closes.
    ///
    /// The caller must already have claimed the port in the registry.
    pub(crate) async fn run(
        mut self,
        mut io: Box<dyn SerialPortIO>,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut mapping_rx = self.links.mapping.subscribe();
        let mut mapping_open = true;
        let mut buf = vec![0u8; self.links.settings.read_chunk];
        let mut deadline = Instant::now() + self.links.settings.identify_timeout();
        let mut nudged = false;

        self.state = SessionState::Probing;
        self.links.registry.set_state(&self.port, self.id, self.state).await;
        log::debug!("Probing {} (session {})", self.port, self.id);

        let reason = loop {
            if *shutdown.borrow() {
                break CloseReason::Shutdown;
            }

            // Control, mapping changes and the deadline are checked before pending reads
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown(reason)) => break reason,
                    None => break CloseReason::Shutdown,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break CloseReason::Shutdown;
                    }
                },
                change = mapping_rx.recv(), if mapping_open => match change {
                    Ok(change) => self.handle_mapping_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Session on {} missed {} mapping changes, resyncing", self.port, skipped);
                        self.resync_mapping().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => mapping_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if !self.is_identified() => {
                    if nudged {
                        break CloseReason::IdentificationTimeout;
                    }
                    nudged = true;
                    log::debug!("No frame from {} yet, nudging", self.port);
                    if let Err(e) = io.write_all(self.links.settings.nudge.as_bytes()).await {
                        if !e.is_transient() {
                            break CloseReason::IoError(e.to_string());
                        }
                    }
                    deadline = Instant::now() + self.links.settings.identify_grace();
                },
                read = io.read_chunk(&mut buf) => match read {
                    Ok(0) => break CloseReason::EndOfStream,
                    Ok(n) => {
                        if let Some(reason) = self.handle_bytes(&buf[..n]).await {
                            break reason;
                        }
                    }
                    Err(e) if e.is_transient() => continue,
                    Err(e) => break CloseReason::IoError(e.to_string()),
                },
            }
        };

        // Release the OS handle before the port becomes claimable again
        drop(io);
        self.close(reason).await;
    }

    /// Feed freshly delivered bytes; returns a close reason if the session must end
    pub(crate) async fn handle_bytes(&mut self, bytes: &[u8]) -> Option<CloseReason> {
        if let Err(e) = self.extractor.push(bytes) {
            log::warn!("{} on {}, continuing", e, self.port);
            return None;
        }

        while let Some(frame) = self.extractor.next_frame() {
            if let Some(reason) = self.handle_frame(&frame).await {
                return Some(reason);
            }
        }
        None
    }

    async fn handle_frame(&mut self, frame: &str) -> Option<CloseReason> {
        let record = match TelemetryRecord::from_frame(frame) {
            Ok(record) => record,
            Err(e) => {
                log::debug!("Dropping frame from {}: {} ({})", self.port, e, frame);
                return None;
            }
        };

        match self.address.as_deref() {
            None => {
                if let Err(reason) = self.identify(&record.address).await {
                    return Some(reason);
                }
            }
            Some(address) if address != record.address => {
                log::warn!(
                    "Address mismatch on {}: session belongs to {}, frame reported {}",
                    self.port, address, record.address
                );
                return None;
            }
            Some(_) => {}
        }

        if let Some(orientation) = record.orientation {
            self.apply_orientation(orientation).await;
        }
        None
    }

    async fn identify(&mut self, address: &str) -> Result<(), CloseReason> {
        match self.expected_address.as_deref() {
            Some(expected) if expected == address => {
                log::debug!("Known device {} confirmed on {}", address, self.port)
            }
            Some(expected) => log::info!(
                "{} previously hosted {}, now reports {}",
                self.port, expected, address
            ),
            None => {}
        }

        let target_index = self.links.mapping.lookup(address);
        if let Err(e) = self
            .links
            .registry
            .promote(&self.port, self.id, address, target_index)
            .await
        {
            log::warn!("Rejecting identification on {}: {}", self.port, e);
            return Err(CloseReason::DuplicateAddress);
        }

        self.address = Some(address.to_string());
        self.target_index = target_index;
        self.state = SessionState::Identified { mapped: target_index.is_some() };
        // Address-keyed registration now holds the port, the probe is over
        self.claim.take();

        log::info!("Device {} identified on {} (target {:?})", address, self.port, target_index);
        self.emit(SessionEvent::Identified {
            session_id: self.id,
            address: address.to_string(),
            port: self.port.clone(),
        });
        Ok(())
    }

    async fn apply_orientation(&mut self, orientation: Orientation) {
        if orientation == self.orientation {
            return;
        }
        let Some(address) = self.address.clone() else {
            return;
        };

        log::info!("{} orientation {} -> {}", address, self.orientation, orientation);
        self.orientation = orientation;
        self.links.registry.set_orientation(&self.port, self.id, orientation).await;
        // The mapping table wins over a change notification still in flight
        let current = self.links.mapping.lookup(&address);
        self.adopt_target(&address, current).await;

        if let Some(target_index) = self.target_index {
            self.push(&address, target_index).await;
        }
        self.emit(SessionEvent::OrientationChanged {
            address,
            target_index: self.target_index,
            orientation,
        });
    }

    async fn handle_mapping_change(&mut self, change: MappingChange) {
        match self.address.clone() {
            Some(address) if address == change.address => self.resync_mapping().await,
            _ => {}
        }
    }

    async fn resync_mapping(&mut self) {
        let Some(address) = self.address.clone() else {
            return;
        };
        let current = self.links.mapping.lookup(&address);
        if self.adopt_target(&address, current).await {
            if let Some(target_index) = current {
                self.push(&address, target_index).await;
            }
        }
    }

    /// Record the device's target; returns whether it changed
    async fn adopt_target(&mut self, address: &str, target_index: Option<usize>) -> bool {
        if target_index == self.target_index {
            return false;
        }
        self.target_index = target_index;
        self.state = SessionState::Identified { mapped: target_index.is_some() };
        self.links.registry.set_target(&self.port, self.id, target_index).await;
        match target_index {
            Some(target_index) => log::info!("{} mapped to target {}", address, target_index),
            None => log::info!("{} unmapped", address),
        }
        true
    }

    async fn push(&self, address: &str, target_index: usize) {
        if let Err(e) = self.links.applier.apply(address, target_index, self.orientation).await {
            log::warn!("Skipped orientation push for {}: {}", address, e);
        }
    }

    /// Unregister and report; later calls are no-ops
    async fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        self.links.registry.release(&self.port, self.id).await;
        self.claim.take();

        match (&self.address, &reason) {
            (None, CloseReason::IdentificationTimeout) => {
                log::info!("No device identified on {}, releasing port", self.port)
            }
            (Some(address), _) => log::info!("Device {} on {} closed: {:?}", address, self.port, reason),
            (None, _) => log::debug!("Probe of {} ended: {:?}", self.port, reason),
        }

        self.emit(SessionEvent::Closed {
            session_id: self.id,
            port: self.port.clone(),
            address: self.address.clone(),
            reason,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.links.events.send(event).is_err() {
            log::debug!("Scheduler gone, dropping session event from {}", self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DisplayActuator, VirtualDisplay};

    struct Harness {
        session: DeviceSession,
        registry: Arc<SessionRegistry>,
        mapping: Arc<MappingTable>,
        display: Arc<VirtualDisplay>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _commands: mpsc::Receiver<SessionCommand>,
    }

    async fn harness(buffer_cap: usize) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let mapping = Arc::new(MappingTable::new());
        let display = Arc::new(VirtualDisplay::new(3));
        let (events_tx, events) = mpsc::unbounded_channel();
        let settings = DiscoverySettings { buffer_cap, ..Default::default() };
        let links = SessionLinks {
            settings: Arc::new(settings),
            registry: registry.clone(),
            mapping: mapping.clone(),
            applier: OrientationApplier::new(display.clone() as Arc<dyn DisplayActuator>),
            events: events_tx,
        };
        let id = Uuid::new_v4();
        let (commands_tx, commands) = mpsc::channel(4);
        registry.claim_port("COM3", id, commands_tx).await.unwrap();
        let session = DeviceSession::new(id, "COM3".into(), None, None, links);
        Harness { session, registry, mapping, display, events, _commands: commands }
    }

    #[tokio::test]
    async fn first_address_wins() {
        let mut h = harness(8192).await;
        h.mapping.set("A", 0);
        assert!(h.session.handle_bytes(br#"{"mac":"A","orientation":1}"#).await.is_none());
        assert!(matches!(h.events.try_recv(), Ok(SessionEvent::Identified { .. })));
        assert!(matches!(h.events.try_recv(), Ok(SessionEvent::OrientationChanged { .. })));

        assert!(h.session.handle_bytes(br#"{"mac":"B","orientation":2}"#).await.is_none());

        assert_eq!(h.session.address(), Some("A"));
        assert_eq!(h.session.orientation(), Orientation::Portrait);
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.display.calls().await, vec![(0, Orientation::Portrait)]);
        assert_eq!(h.registry.lookup_address("A").await.unwrap().orientation, Orientation::Portrait);
        assert!(h.registry.lookup_address("B").await.is_none());
    }

    #[tokio::test]
    async fn cleared_mapping_stops_pushes_before_notification_arrives() {
        let mut h = harness(8192).await;
        h.mapping.set("A", 2);
        h.session.handle_bytes(br#"{"mac":"A","orientation":1}"#).await;
        assert_eq!(h.display.calls().await, vec![(2, Orientation::Portrait)]);
        while h.events.try_recv().is_ok() {}

        // The session has not seen the change notification yet
        h.mapping.clear("A");
        h.session.handle_bytes(br#"{"mac":"A","orientation":3}"#).await;

        assert!(matches!(
            h.events.try_recv(),
            Ok(SessionEvent::OrientationChanged { target_index: None, orientation: Orientation::PortraitFlipped, .. })
        ));
        assert_eq!(h.display.calls().await.len(), 1);
        assert_eq!(h.registry.lookup_address("A").await.unwrap().target_index, None);
        assert_eq!(h.session.state(), SessionState::Identified { mapped: false });
    }

    #[tokio::test]
    async fn late_notification_after_remap_does_not_push_twice() {
        let mut h = harness(8192).await;
        h.session.handle_bytes(br#"{"mac":"A","orientation":1}"#).await;
        assert!(h.display.calls().await.is_empty());

        h.mapping.set("A", 1);
        h.session.handle_bytes(br#"{"mac":"A","orientation":2}"#).await;
        h.session
            .handle_mapping_change(MappingChange { address: "A".into(), target_index: Some(1) })
            .await;

        assert_eq!(h.display.calls().await, vec![(1, Orientation::LandscapeFlipped)]);
    }

    #[tokio::test]
    async fn repeated_orientation_is_idempotent() {
        let mut h = harness(8192).await;
        h.mapping.set("A", 1);
        h.session.handle_bytes(br#"{"mac":"A","orientation":0}"#).await;
        h.session.handle_bytes(br#"{"mac":"A","orientation":2}{"mac":"A","orientation":2}"#).await;

        assert!(matches!(h.events.try_recv(), Ok(SessionEvent::Identified { .. })));
        assert!(matches!(
            h.events.try_recv(),
            Ok(SessionEvent::OrientationChanged { target_index: Some(1), orientation: Orientation::LandscapeFlipped, .. })
        ));
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.display.calls().await, vec![(1, Orientation::LandscapeFlipped)]);
    }

    #[tokio::test]
    async fn malformed_frames_leave_state_untouched() {
        let mut h = harness(8192).await;
        h.session.handle_bytes(br#"{"orientation":1}{"mac":""}{oops}"#).await;
        assert!(!h.session.is_identified());
        assert_eq!(h.session.state(), SessionState::Connecting);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_is_survivable() {
        let mut h = harness(32).await;
        assert!(h.session.handle_bytes(&[b'{'; 40]).await.is_none());
        h.session.handle_bytes(br#"{"mac":"A"}"#).await;
        assert_eq!(h.session.address(), Some("A"));
    }

    #[tokio::test]
    async fn out_of_range_target_skips_push() {
        let mut h = harness(8192).await;
        h.mapping.set("A", 9);
        h.session.handle_bytes(br#"{"mac":"A","orientation":3}"#).await;
        assert_eq!(h.session.orientation(), Orientation::PortraitFlipped);
        assert!(h.display.calls().await.is_empty());
    }
}
