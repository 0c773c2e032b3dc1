//! Supervised wake word loop
//!
//! Keeps a [`PhraseDetector`] running while nobody else needs the microphone.
//! Detector lifetimes that end without a trigger are restarted after a fixed delay;
//! a trigger stops the loop and asks the session to start.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::wake_word::PhraseDetector;
use crate::Result;
use crate::events::{BusEvent, EventBus};
use crate::mic_lock::MicLock;

/// What the supervisor needs from the session layer
#[async_trait]
pub trait SessionStarter: Send + Sync {
    /// Whether a session currently exists
    fn is_active(&self) -> bool;

    /// Start a session with optional extra context
    ///
    /// # Errors
    ///
    /// Returns error if the session could not start
    async fn start_session(&self, context: Option<String>) -> Result<()>;
}

struct Inner {
    detector: Arc<dyn PhraseDetector>,
    session: Arc<dyn SessionStarter>,
    mic_lock: MicLock,
    restart_delay: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Restarts the phrase detector unless the microphone is busy
#[derive(Clone)]
pub struct WakeWordSupervisor {
    inner: Arc<Inner>,
}

impl WakeWordSupervisor {
    #[must_use]
    pub fn new(
        detector: Arc<dyn PhraseDetector>,
        session: Arc<dyn SessionStarter>,
        mic_lock: MicLock,
        restart_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                detector,
                session,
                mic_lock,
                restart_delay,
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the detector loop
    ///
    /// Returns `false` when the microphone is locked or a session is active.
    pub fn arm(&self) -> bool {
        if self.blocked() {
            tracing::debug!("wake word arm refused, microphone in use");
            return false;
        }

        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return true;
        }

        let supervisor = self.clone();
        *task = Some(tokio::spawn(async move { supervisor.run().await }));
        tracing::info!("wake word armed");
        true
    }

    /// Stop the detector loop; no-op if it is not running
    pub fn disarm(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if !task.is_finished() {
                tracing::info!("wake word disarmed");
            }
            task.abort();
        }
    }

    /// Whether the detector loop is running
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Follow bus events: disarm when the microphone is taken, arm on re-arm signals
    #[must_use]
    pub fn watch(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::MicLock { state: true }) => supervisor.disarm(),
                    Ok(BusEvent::WakeWordRearm) => {
                        supervisor.arm();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "wake word supervisor lagged behind bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn blocked(&self) -> bool {
        self.inner.mic_lock.is_held() || self.inner.session.is_active()
    }

    async fn run(self) {
        loop {
            if self.blocked() {
                tracing::debug!("wake word loop exiting, microphone in use");
                return;
            }

            match self.inner.detector.listen().await {
                Ok(Some(trigger)) => {
                    let context = trigger.context();
                    tracing::info!(?trigger, "wake word triggered session");
                    // The start runs outside this task so disarming cannot cancel it
                    let supervisor = self.clone();
                    drop(tokio::spawn(async move {
                        supervisor.launch(context).await;
                    }));
                    return;
                }
                Ok(None) => tracing::trace!("wake word detector ended, restarting"),
                Err(e) => tracing::warn!(error = %e, "wake word detector failed"),
            }

            tokio::time::sleep(self.inner.restart_delay).await;
        }
    }

    async fn launch(self, context: Option<String>) {
        if let Err(e) = self.inner.session.start_session(context).await {
            // No mic lock was released, so no re-arm signal will come
            tracing::warn!(error = %e, "wake word session start failed");
            tokio::time::sleep(self.inner.restart_delay).await;
            self.arm();
        }
    }
}
