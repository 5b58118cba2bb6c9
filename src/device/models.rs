use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

pub use crate::serial::Orientation;

/// Device session lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    /// Port open, no valid frame seen yet
    Probing,
    Identified { mapped: bool },
    Closed,
}

impl SessionState {
    pub fn is_identified(&self) -> bool {
        matches!(self, SessionState::Identified { .. })
    }
}

/// Why a session ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    OpenFailed(String),
    IoError(String),
    /// Peer closed the stream
    EndOfStream,
    IdentificationTimeout,
    DuplicateAddress,
    PortVanished,
    Shutdown,
}

/// Operator-facing view of an identified device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedDevice {
    pub session_id: Uuid,
    pub address: String,
    pub port: String,
    pub orientation: Orientation,
    pub target_index: Option<usize>,
    pub connected_at: DateTime<Utc>,
}

/// Lifecycle notifications surfaced to collaborators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    DeviceDiscovered {
        address: String,
    },
    DeviceConnected {
        address: String,
        port: String,
    },
    DeviceDisconnected {
        address: String,
    },
    OrientationChanged {
        address: String,
        target_index: Option<usize>,
        orientation: Orientation,
    },
}

/// Typed messages from a session to the scheduler
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Identified {
        session_id: Uuid,
        address: String,
        port: String,
    },
    OrientationChanged {
        address: String,
        target_index: Option<usize>,
        orientation: Orientation,
    },
    Closed {
        session_id: Uuid,
        port: String,
        address: Option<String>,
        reason: CloseReason,
    },
}

/// Requests delivered to a running session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Shutdown(CloseReason),
}
