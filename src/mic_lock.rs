//! Process-wide microphone ownership
//!
//! A single flag recording who currently owns the microphone. Transitions are
//! published on a watch channel (for components that await changes) and on the
//! [`EventBus`] as `mic-lock` events. Every release schedules a delayed
//! `wake-word-rearm` signal so the passive detector can resume.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::events::{BusEvent, EventBus};

/// Who holds the microphone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum MicHolder {
    /// The live conversation session
    Session,
    /// Another consumer in the host application (e.g. push-to-talk)
    External(String),
}

/// Observable lock state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MicLockState {
    pub held: bool,
    pub holder: Option<MicHolder>,
}

/// Shared microphone lock
#[derive(Debug, Clone)]
pub struct MicLock {
    state: Arc<watch::Sender<MicLockState>>,
    bus: EventBus,
    rearm_delay: Duration,
}

impl MicLock {
    /// Create a lock publishing on `bus`; re-arm signals fire `rearm_delay` after release
    #[must_use]
    pub fn new(bus: EventBus, rearm_delay: Duration) -> Self {
        let (tx, _) = watch::channel(MicLockState::default());
        Self {
            state: Arc::new(tx),
            bus,
            rearm_delay,
        }
    }

    /// Acquire the lock for `holder`
    ///
    /// Returns `true` if `holder` owns the lock afterwards (including when it already
    /// did), `false` if someone else holds it.
    pub fn acquire(&self, holder: MicHolder) -> bool {
        let mut owned = false;
        let changed = self.state.send_if_modified(|state| match &state.holder {
            Some(current) => {
                owned = *current == holder;
                false
            }
            None => {
                state.held = true;
                state.holder = Some(holder.clone());
                owned = true;
                true
            }
        });

        if changed {
            tracing::debug!(?holder, "mic lock acquired");
            self.bus.publish(BusEvent::MicLock { state: true });
        } else if !owned {
            tracing::debug!(?holder, holder_now = ?self.holder(), "mic lock busy");
        }

        owned
    }

    /// Release the lock if `holder` owns it
    ///
    /// Returns `true` if the lock was released by this call. A delayed re-arm signal
    /// is scheduled regardless.
    pub fn release(&self, holder: &MicHolder) -> bool {
        let released = self.state.send_if_modified(|state| {
            if state.holder.as_ref() == Some(holder) {
                state.held = false;
                state.holder = None;
                true
            } else {
                false
            }
        });

        if released {
            tracing::debug!(?holder, "mic lock released");
            self.bus.publish(BusEvent::MicLock { state: false });
        }

        self.schedule_rearm();
        released
    }

    /// Whether anyone holds the lock
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.borrow().held
    }

    /// Current holder, if any
    #[must_use]
    pub fn holder(&self) -> Option<MicHolder> {
        self.state.borrow().holder.clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> MicLockState {
        self.state.borrow().clone()
    }

    /// Observe lock transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MicLockState> {
        self.state.subscribe()
    }

    fn schedule_rearm(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime there is no supervisor to wake
            self.bus.publish(BusEvent::WakeWordRearm);
            return;
        };

        let bus = self.bus.clone();
        let delay = self.rearm_delay;
        drop(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            bus.publish(BusEvent::WakeWordRearm);
        }));
    }
}
