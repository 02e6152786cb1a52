//! Server events for observability
//!
//! Components emit these on notable state changes. A subscriber (tests,
//! a status printer) receives them on an unbounded channel; when nobody
//! subscribed, sending is a no-op.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// Server Events
// ============================================================================

/// Events emitted by the command server during its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The managed command was started
    ChildStarted {
        /// Process id of the new child, if the launcher reports one
        pid: Option<u32>,
    },

    /// The previous child was terminated before a respawn
    ChildTerminated {
        pid: Option<u32>,
        /// Whether the grace period ran out and the child was killed
        forced: bool,
    },

    /// The directory registration was written
    Published {
        directory: PathBuf,
        endpoint: PathBuf,
    },

    /// An invocation request was taken off the queue
    InvocationReceived {
        /// Sequence number, starting at 1
        sequence: u64,
    },

    /// A client-triggered respawn finished
    RespawnCompleted { sequence: u64, pid: Option<u32> },

    /// A client-triggered respawn failed; the server stays up
    RespawnFailed { sequence: u64, reason: String },

    /// An invocation was rejected because the queue was full
    InvocationRejected,

    /// The directory registration was removed
    Withdrawn { directory: PathBuf },
}

// ============================================================================
// Event Channel
// ============================================================================

/// Receiver for server events
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Create a new event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender::new(tx), rx)
}

/// Optional event sink handed to components at construction
#[derive(Clone, Default)]
pub struct EventSender {
    sender: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl EventSender {
    pub fn new(sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Create a no-op sender (events are discarded)
    pub fn none() -> Self {
        Self { sender: None }
    }

    pub fn is_active(&self) -> bool {
        self.sender.is_some()
    }

    /// Send an event (silently dropped if no sender or receiver is gone)
    pub fn send(&self, event: ServerEvent) {
        if let Some(ref sender) = self.sender {
            let _ = sender.send(event);
        }
    }
}
