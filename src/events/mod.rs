//! Process-wide publish/subscribe bus
//!
//! Carries fire-and-forget notifications between the session engine and the host
//! application: microphone ownership transitions, wake word re-arm requests, session
//! state changes and UI-level signals emitted by tools. Publishing never fails;
//! events published with no subscribers are dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::SessionState;

/// Channel capacity for bus events
const CHANNEL_CAPACITY: usize = 128;

/// A typed bus event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum BusEvent {
    /// Microphone ownership changed
    MicLock { state: bool },
    /// The wake word detector may restart
    WakeWordRearm,
    /// The session controller changed state
    SessionState {
        state: SessionState,
        session_id: Option<Uuid>,
    },
    /// The agent asked the host to navigate somewhere
    NavStart { destination: String },
    /// The agent unlocked a badge
    BadgeUnlock { badge: String },
    /// The agent logged the user out
    Logout,
    /// The agent handed the conversation to another surface
    Handoff,
}

impl BusEvent {
    /// Topic name as used on the wire
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::MicLock { .. } => "mic-lock",
            Self::WakeWordRearm => "wake-word-rearm",
            Self::SessionState { .. } => "session-state",
            Self::NavStart { .. } => "nav-start",
            Self::BadgeUnlock { .. } => "badge-unlock",
            Self::Logout => "logout",
            Self::Handoff => "handoff",
        }
    }
}

/// Broadcast bus shared by every component in the process
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new bus
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: BusEvent) {
        tracing::trace!(topic = event.topic(), "bus event");
        // Ignore errors when nobody is subscribed
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
