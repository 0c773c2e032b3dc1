//! Daemon - the voxlink service
//!
//! Wires the session controller, wake word supervisor and control API together
//! and runs until Ctrl-C.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::api::{ApiServer, ApiState};
use crate::channel::{ConversationTransport, LiveTransport};
use crate::events::{BusEvent, EventBus};
use crate::mic_lock::MicLock;
use crate::session::{SessionController, SessionDeps, SessionHandle};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::voice::{
    AudioSink, CpalMicrophone, CpalSpeaker, EnergyPhraseDetector, Microphone, NullSink,
    TriggerMatcher, WakeWordSupervisor, WhisperTranscriber,
};
use crate::{Config, Result};

/// Running components shared by the daemon and one-shot commands
pub struct Engine {
    pub bus: EventBus,
    pub mic_lock: MicLock,
    pub session: SessionHandle,
    pub tools: Arc<ToolRegistry>,
    /// `None` when wake word detection is disabled or unconfigured
    pub wake_word: Option<WakeWordSupervisor>,
}

impl Engine {
    /// Build every component on the host's default audio devices
    ///
    /// Must be called inside a tokio runtime; the session controller task is
    /// spawned here.
    ///
    /// # Errors
    ///
    /// Returns error if the live endpoint or transcription settings are invalid
    pub fn build(config: &Config) -> Result<Self> {
        let bus = EventBus::new();
        let mic_lock = MicLock::new(bus.clone(), config.session.rearm_cooldown);
        let microphone: Arc<dyn Microphone> = Arc::new(CpalMicrophone::new());
        let tools = Arc::new(ToolRegistry::with_builtins(&bus));

        if config.live.api_key.is_none() {
            tracing::warn!("no live API key configured (set GEMINI_API_KEY)");
        }
        let transport: Arc<dyn ConversationTransport> = Arc::new(LiveTransport::new(&config.live)?);

        let sink = output_sink(config.audio.output_enabled);
        let executor: Arc<dyn ToolExecutor> = tools.clone();

        let session = SessionController::spawn(SessionDeps {
            microphone: Arc::clone(&microphone),
            transport,
            sink,
            tools: executor,
            mic_lock: mic_lock.clone(),
            bus: bus.clone(),
            settings: config.session_settings(),
        });

        let wake_word = build_supervisor(config, microphone, &session, &mic_lock)?;

        tracing::info!(
            tools = tools.len(),
            wake_word = wake_word.is_some(),
            voice = %config.live.voice,
            "engine ready"
        );

        Ok(Self {
            bus,
            mic_lock,
            session,
            tools,
            wake_word,
        })
    }

    /// Stop the session and the detector
    pub async fn shutdown(&self) {
        if let Some(supervisor) = &self.wake_word {
            supervisor.disarm();
        }
        if let Err(e) = self.session.stop().await {
            tracing::debug!(error = %e, "session stop during shutdown");
        }
        self.session.shutdown();
    }
}

fn output_sink(enabled: bool) -> Arc<dyn AudioSink> {
    if !enabled {
        tracing::info!("audio output disabled");
        return Arc::new(NullSink);
    }
    match CpalSpeaker::new() {
        Ok(speaker) => Arc::new(speaker),
        Err(e) => {
            tracing::warn!(error = %e, "no output device, synthesized audio will be dropped");
            Arc::new(NullSink)
        }
    }
}

fn build_supervisor(
    config: &Config,
    microphone: Arc<dyn Microphone>,
    session: &SessionHandle,
    mic_lock: &MicLock,
) -> Result<Option<WakeWordSupervisor>> {
    let wake = &config.wake_word;
    if !wake.enabled {
        return Ok(None);
    }
    let Some(key) = &wake.transcription_api_key else {
        tracing::warn!("wake word disabled: OPENAI_API_KEY not set");
        return Ok(None);
    };
    if wake.phrases.is_empty() && wake.secret_phrase.is_none() {
        tracing::warn!("wake word disabled: no phrases configured");
        return Ok(None);
    }

    let transcriber = WhisperTranscriber::new(
        &wake.transcription_url,
        key.expose_secret(),
        &wake.transcription_model,
    )?;
    let matcher = TriggerMatcher::new(
        &wake.phrases,
        wake.secret_phrase
            .as_deref()
            .map(|phrase| (phrase, wake.secret_reply.as_str())),
    );
    tracing::info!(phrases = ?matcher.phrases(), "wake word configured");

    let detector = EnergyPhraseDetector::new(
        microphone,
        Arc::new(transcriber),
        matcher,
        wake.listen_window,
        wake.energy_threshold,
    );

    Ok(Some(WakeWordSupervisor::new(
        Arc::new(detector),
        Arc::new(session.clone()),
        mic_lock.clone(),
        wake.restart_delay,
    )))
}

/// The voxlink daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built
    pub async fn run(self) -> Result<()> {
        let engine = Engine::build(&self.config)?;

        let log_task = tokio::spawn(log_bus_events(engine.bus.clone()));

        let watch_task = engine.wake_word.as_ref().map(|supervisor| {
            let task = supervisor.watch(&engine.bus);
            if !supervisor.arm() {
                tracing::info!("wake word not armed, microphone busy");
            }
            task
        });

        let state = ApiState::new(engine.session.clone(), engine.mic_lock.clone())
            .with_api_key(
                self.config
                    .server
                    .api_key
                    .as_ref()
                    .map(|key| SecretString::from(key.expose_secret().to_owned())),
            );
        let state = match &engine.wake_word {
            Some(supervisor) => state.with_wake_word(supervisor.clone()),
            None => state,
        };
        let api = ApiServer::new(state, self.config.server.host.clone(), self.config.server.port)
            .spawn();

        tracing::info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            "daemon running"
        );

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("shutting down");
            }
            result = api => {
                match result {
                    Ok(Err(e)) => tracing::error!(error = %e, "API server stopped"),
                    Err(e) => tracing::error!(error = %e, "API server task failed"),
                    Ok(Ok(())) => {}
                }
            }
        }

        engine.shutdown().await;
        if let Some(task) = watch_task {
            task.abort();
        }
        log_task.abort();

        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Trace every bus event for observability
async fn log_bus_events(bus: EventBus) {
    let mut rx = bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(BusEvent::SessionState { state, session_id }) => {
                tracing::info!(%state, ?session_id, "session state");
            }
            Ok(event) => tracing::debug!(topic = event.topic(), ?event, "bus event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "bus logger lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
