//! Session controller actor
//!
//! One tokio task owns every piece of mutable session state: the session record,
//! capture stream, channel, playback scheduler and transcripts. Everything else
//! talks to it through [`Command`]s on its mailbox. Work that suspends (permission
//! checks, microphone acquisition, channel open, tool calls, timers) runs in
//! spawned tasks that post their results back, tagged with the generation they
//! were started for. `stop()` bumps the generation, so late results from an old
//! attempt are ignored and dropped, which releases whatever they carry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::state::{Session, SessionSnapshot, SessionState, TranscriptBuffers};
use crate::channel::{
    ChannelEvent, ConversationChannel, ConversationTransport, EventSink, FunctionResponse,
    LiveSetup,
};
use crate::events::{BusEvent, EventBus};
use crate::mic_lock::{MicHolder, MicLock};
use crate::tools::{self, ControlSignal, ToolExecutor, ToolInvocation, ToolOutcome};
use crate::voice::{
    AudioCaptureStream, AudioFrame, AudioSink, Microphone, Permission, PlaybackScheduler,
    SessionStarter,
};
use crate::{Error, Result};

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Prebuilt voice used for synthesized speech
    pub voice: String,
    /// System instruction; caller context is appended verbatim
    pub base_instruction: String,
    /// Delay between entering `Error` and the automatic stop
    pub auto_stop_delay: Duration,
    /// Microphone open attempts before giving up
    pub mic_retry_attempts: u32,
    pub mic_retry_backoff: Duration,
    /// Upper bound on a single tool call
    pub tool_timeout: Duration,
    /// How long to wait for the remote setup acknowledgment
    pub open_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            voice: "Puck".to_string(),
            base_instruction: "You are a friendly voice assistant. Keep answers short and \
                               conversational."
                .to_string(),
            auto_stop_delay: Duration::from_secs(3),
            mic_retry_attempts: 3,
            mic_retry_backoff: Duration::from_millis(500),
            tool_timeout: tools::DEFAULT_TOOL_TIMEOUT,
            open_timeout: Duration::from_secs(15),
        }
    }
}

/// Collaborators the controller drives
pub struct SessionDeps {
    pub microphone: Arc<dyn Microphone>,
    pub transport: Arc<dyn ConversationTransport>,
    pub sink: Arc<dyn AudioSink>,
    pub tools: Arc<dyn ToolExecutor>,
    pub mic_lock: MicLock,
    pub bus: EventBus,
    pub settings: SessionSettings,
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session reached `Listening`
    Started(Uuid),
    /// A session already exists or is starting
    AlreadyActive,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        context: Option<String>,
        reply: Reply<Result<StartOutcome>>,
    },
    Stop {
        reply: Option<Reply<()>>,
    },
    Shutdown,
    Authorized {
        generation: u64,
    },
    PermissionRefused {
        generation: u64,
    },
    Connected {
        generation: u64,
        capture: AudioCaptureStream,
        channel: Box<dyn ConversationChannel>,
    },
    StartFailed {
        generation: u64,
        error: Error,
    },
    Channel {
        generation: u64,
        event: ChannelEvent,
    },
    Frame {
        generation: u64,
        frame: AudioFrame,
    },
    PlaybackEnded {
        generation: u64,
        id: u64,
    },
    ToolReply {
        generation: u64,
        response: FunctionResponse,
    },
    ToolControl {
        generation: u64,
        signal: ControlSignal,
    },
    AutoStop {
        generation: u64,
    },
    OpenTimeout {
        generation: u64,
    },
}

impl Command {
    /// Generation tag for internally produced commands
    const fn generation(&self) -> Option<u64> {
        match self {
            Self::Start { .. } | Self::Stop { .. } | Self::Shutdown => None,
            Self::Authorized { generation }
            | Self::PermissionRefused { generation }
            | Self::Connected { generation, .. }
            | Self::StartFailed { generation, .. }
            | Self::Channel { generation, .. }
            | Self::Frame { generation, .. }
            | Self::PlaybackEnded { generation, .. }
            | Self::ToolReply { generation, .. }
            | Self::ToolControl { generation, .. }
            | Self::AutoStop { generation }
            | Self::OpenTimeout { generation } => Some(*generation),
        }
    }
}

/// A start request waiting for the channel to open
struct PendingStart {
    context: Option<String>,
    reply: Reply<Result<StartOutcome>>,
}

/// Owns all session state; runs inside its own task
pub struct SessionController {
    deps: SessionDeps,
    tx: mpsc::UnboundedSender<Command>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    generation: u64,
    state: SessionState,
    session: Option<Session>,
    last_error: Option<String>,
    handoff_requested: bool,
    transcript: TranscriptBuffers,

    pending: Option<PendingStart>,
    capture: Option<AudioCaptureStream>,
    channel: Option<Box<dyn ConversationChannel>>,
    /// Setup acknowledgment arrived before the channel handle
    opened: bool,
    /// Tool results produced before the channel handle arrived
    unsent_responses: Vec<FunctionResponse>,
    scheduler: Option<PlaybackScheduler>,
    tool_queue: Option<mpsc::UnboundedSender<Vec<ToolInvocation>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionController {
    /// Start the controller task and return a handle to it
    #[must_use]
    pub fn spawn(deps: SessionDeps) -> SessionHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let mut controller = Self {
            deps,
            tx: tx.clone(),
            snapshot_tx,
            generation: 0,
            state: SessionState::Idle,
            session: None,
            last_error: None,
            handoff_requested: false,
            transcript: TranscriptBuffers::default(),
            pending: None,
            capture: None,
            channel: None,
            opened: false,
            unsent_responses: Vec::new(),
            scheduler: None,
            tool_queue: None,
            tasks: Vec::new(),
        };

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if matches!(command, Command::Shutdown) {
                    controller.stop();
                    break;
                }
                controller.handle(command);
            }
            tracing::debug!("session controller stopped");
        });

        SessionHandle {
            tx,
            snapshot: snapshot_rx,
        }
    }

    fn handle(&mut self, command: Command) {
        if let Some(generation) = command.generation() {
            if generation != self.generation {
                tracing::trace!(generation, current = self.generation, "dropping stale command");
                return;
            }
        }

        match command {
            Command::Start { context, reply } => self.start(context, reply),
            Command::Stop { reply } => {
                self.stop();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Shutdown => self.stop(),
            Command::Authorized { .. } => self.authorized(),
            Command::PermissionRefused { .. } => {
                self.reject_start(Error::PermissionDenied(
                    "microphone permission was not granted".to_string(),
                ));
            }
            Command::Connected {
                capture, channel, ..
            } => self.connected(capture, channel),
            Command::StartFailed { error, .. } => self.fail(error),
            Command::Channel { event, .. } => self.channel_event(event),
            Command::Frame { frame, .. } => self.forward_frame(&frame),
            Command::PlaybackEnded { id, .. } => self.playback_ended(id),
            Command::ToolReply { response, .. } => self.send_tool_response(response),
            Command::ToolControl { signal, .. } => self.control(signal),
            Command::AutoStop { .. } => {
                tracing::debug!("auto-stop after error");
                self.stop();
            }
            Command::OpenTimeout { .. } => {
                if self.state == SessionState::Connecting {
                    self.fail(Error::ChannelOpen(
                        "timed out waiting for setup acknowledgment".to_string(),
                    ));
                }
            }
        }
    }

    // Start sequence

    fn start(&mut self, context: Option<String>, reply: Reply<Result<StartOutcome>>) {
        if self.state != SessionState::Idle || self.pending.is_some() {
            tracing::debug!(state = %self.state, "start ignored, session already active");
            let _ = reply.send(Ok(StartOutcome::AlreadyActive));
            return;
        }

        self.generation += 1;
        self.pending = Some(PendingStart { context, reply });
        self.publish();

        let microphone = Arc::clone(&self.deps.microphone);
        let tx = self.tx.clone();
        let generation = self.generation;
        self.tasks.push(tokio::spawn(async move {
            let granted = match microphone.permission().await {
                Permission::Granted => true,
                Permission::Denied => false,
                Permission::Prompt => microphone.request_permission().await == Permission::Granted,
            };
            let _ = tx.send(if granted {
                Command::Authorized { generation }
            } else {
                Command::PermissionRefused { generation }
            });
        }));
    }

    /// Fail a start before any session resources exist
    fn reject_start(&mut self, error: Error) {
        tracing::warn!(error = %error, "session start rejected");
        self.last_error = Some(error.to_string());
        self.abort_tasks();
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(error));
        }
        self.publish();
    }

    fn authorized(&mut self) {
        if !self.deps.mic_lock.acquire(MicHolder::Session) {
            let holder = self
                .deps
                .mic_lock
                .holder()
                .map_or_else(|| "unknown".to_string(), |h| format!("{h:?}"));
            self.reject_start(Error::DeviceBusy(format!("microphone held by {holder}")));
            return;
        }

        let session = Session::new();
        tracing::info!(session_id = %session.id, "session starting");
        self.session = Some(session);
        self.last_error = None;
        self.handoff_requested = false;
        self.transcript = TranscriptBuffers::default();
        self.opened = false;

        let generation = self.generation;
        let tx = self.tx.clone();
        self.scheduler = Some(PlaybackScheduler::new(
            Arc::clone(&self.deps.sink),
            Arc::new(move |id| {
                let _ = tx.send(Command::PlaybackEnded { generation, id });
            }),
        ));
        self.spawn_tool_worker();
        self.set_state(SessionState::Connecting);

        let context = self.pending.as_ref().and_then(|p| p.context.clone());
        let setup = LiveSetup::new(
            &self.deps.settings.voice,
            &self.deps.settings.base_instruction,
            context.as_deref(),
            self.deps.tools.declarations(),
        );
        let microphone = Arc::clone(&self.deps.microphone);
        let transport = Arc::clone(&self.deps.transport);
        let settings = self.deps.settings.clone();
        let tx = self.tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let capture = match open_capture(&*microphone, &tx, generation, &settings).await {
                Ok(capture) => capture,
                Err(error) => {
                    let _ = tx.send(Command::StartFailed { generation, error });
                    return;
                }
            };

            let events_tx = tx.clone();
            let events: EventSink = Arc::new(move |event| {
                let _ = events_tx.send(Command::Channel { generation, event });
            });

            let connect = transport.connect(setup, events);
            let command = match tokio::time::timeout(settings.open_timeout, connect).await {
                Ok(Ok(channel)) => Command::Connected {
                    generation,
                    capture,
                    channel,
                },
                Ok(Err(e)) => {
                    drop(capture);
                    let error = match e {
                        Error::ChannelOpen(_) => e,
                        other => Error::ChannelOpen(other.to_string()),
                    };
                    Command::StartFailed { generation, error }
                }
                Err(_) => {
                    drop(capture);
                    let error = Error::ChannelOpen(format!(
                        "connect did not complete within {}ms",
                        settings.open_timeout.as_millis()
                    ));
                    Command::StartFailed { generation, error }
                }
            };
            let _ = tx.send(command);
        }));
    }

    fn connected(&mut self, capture: AudioCaptureStream, channel: Box<dyn ConversationChannel>) {
        if self.state != SessionState::Connecting {
            // Failed or stopped meanwhile; dropping releases both
            return;
        }

        for response in self.unsent_responses.drain(..) {
            tracing::debug!(call_id = %response.id, "sending deferred tool response");
            if !channel.send_tool_response(response) {
                tracing::warn!("tool response dropped, channel closed");
            }
        }
        self.capture = Some(capture);
        self.channel = Some(channel);

        if self.opened {
            self.go_listening();
        } else {
            let tx = self.tx.clone();
            let generation = self.generation;
            let timeout = self.deps.settings.open_timeout;
            self.tasks.push(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Command::OpenTimeout { generation });
            }));
        }
    }

    fn go_listening(&mut self) {
        let id = self.session.as_ref().map(|s| s.id);
        tracing::info!(session_id = ?id, "session listening");
        let pending = self.pending.take();
        // Greeting audio may already be playing
        let speaking = self
            .scheduler
            .as_ref()
            .is_some_and(|scheduler| !scheduler.is_idle());
        self.set_state(if speaking {
            SessionState::Speaking
        } else {
            SessionState::Listening
        });
        if let (Some(pending), Some(id)) = (pending, id) {
            let _ = pending.reply.send(Ok(StartOutcome::Started(id)));
        }
    }

    // Inbound traffic

    fn channel_event(&mut self, event: ChannelEvent) {
        if !self.state.accepts_channel_events() {
            tracing::trace!(state = %self.state, ?event, "dropping channel event");
            return;
        }

        match event {
            ChannelEvent::Open => {
                if self.channel.is_some() {
                    if self.state == SessionState::Connecting {
                        self.go_listening();
                    }
                } else {
                    self.opened = true;
                }
            }
            ChannelEvent::ToolCall(batch) => {
                tracing::debug!(calls = batch.len(), "tool call batch");
                if let Some(queue) = &self.tool_queue {
                    let _ = queue.send(batch);
                }
            }
            ChannelEvent::Audio(pcm) => {
                let scheduled = self
                    .scheduler
                    .as_mut()
                    .and_then(|scheduler| scheduler.enqueue(pcm));
                if scheduled.is_some() && self.state == SessionState::Listening {
                    self.set_state(SessionState::Speaking);
                }
            }
            ChannelEvent::Transcript(fragment) => {
                self.transcript.apply(fragment);
                self.publish();
            }
            ChannelEvent::TurnComplete => {
                self.transcript.complete_turn();
                self.publish();
            }
            ChannelEvent::Interrupted => {
                tracing::debug!("agent interrupted");
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.flush();
                }
                if self.state == SessionState::Speaking {
                    self.set_state(SessionState::Listening);
                }
            }
            ChannelEvent::Error(message) => self.fail(Error::ChannelRuntime(message)),
            ChannelEvent::Closed => {
                if self.state == SessionState::Connecting {
                    self.fail(Error::ChannelOpen(
                        "channel closed before setup completed".to_string(),
                    ));
                } else {
                    tracing::info!("channel closed by remote");
                    self.stop();
                }
            }
        }
    }

    fn forward_frame(&self, frame: &AudioFrame) {
        if !self.state.is_streaming() {
            return;
        }
        if let Some(channel) = &self.channel {
            if !channel.send_audio(frame.to_media_chunk()) {
                tracing::trace!(sequence = frame.sequence, "channel gone, frame dropped");
            }
        }
    }

    fn playback_ended(&mut self, id: u64) {
        let drained = self
            .scheduler
            .as_mut()
            .is_some_and(|scheduler| scheduler.complete(id));
        if drained && self.state == SessionState::Speaking {
            self.set_state(SessionState::Listening);
        }
    }

    // Tools

    fn spawn_tool_worker(&mut self) {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Vec<ToolInvocation>>();
        let executor = Arc::clone(&self.deps.tools);
        let timeout = self.deps.settings.tool_timeout;
        let tx = self.tx.clone();
        let generation = self.generation;

        self.tool_queue = Some(queue_tx);
        self.tasks.push(tokio::spawn(async move {
            while let Some(batch) = queue_rx.recv().await {
                for invocation in batch {
                    match tools::dispatch(&*executor, &invocation, timeout).await {
                        ToolOutcome::Text(result) => {
                            let response =
                                FunctionResponse::new(invocation.id, invocation.name, result);
                            let _ = tx.send(Command::ToolReply {
                                generation,
                                response,
                            });
                        }
                        ToolOutcome::Control(signal) => {
                            tracing::info!(tool = %invocation.name, ?signal, "tool raised control signal");
                            let _ = tx.send(Command::ToolControl { generation, signal });
                            // The session is ending; later calls would go nowhere
                            return;
                        }
                    }
                }
            }
        }));
    }

    fn send_tool_response(&mut self, response: FunctionResponse) {
        if !self.state.accepts_channel_events() {
            return;
        }
        match &self.channel {
            Some(channel) => {
                if !channel.send_tool_response(response) {
                    tracing::warn!("tool response dropped, channel closed");
                }
            }
            None => {
                tracing::debug!(call_id = %response.id, "holding tool response until channel is ready");
                self.unsent_responses.push(response);
            }
        }
    }

    fn control(&mut self, signal: ControlSignal) {
        match signal {
            ControlSignal::Terminate => self.stop(),
            ControlSignal::Logout => {
                self.stop();
                self.deps.bus.publish(BusEvent::Logout);
            }
            ControlSignal::Handoff => {
                self.stop();
                self.handoff_requested = true;
                self.publish();
                self.deps.bus.publish(BusEvent::Handoff);
            }
        }
    }

    // Failure and teardown

    fn fail(&mut self, error: Error) {
        if self.state == SessionState::Idle || self.state == SessionState::Error {
            tracing::debug!(error = %error, state = %self.state, "ignoring failure");
            return;
        }

        tracing::error!(error = %error, code = error.code(), "session failed");
        let message = error.to_string();
        self.last_error = Some(message.clone());
        if let Some(session) = self.session.as_mut() {
            session.last_error = Some(message);
        }
        self.unsent_responses.clear();
        let pending = self.pending.take();
        self.set_state(SessionState::Error);
        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(error));
        }

        let tx = self.tx.clone();
        let generation = self.generation;
        let delay = self.deps.settings.auto_stop_delay;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::AutoStop { generation });
        }));
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Tear everything down; safe in any state
    fn stop(&mut self) {
        let holds_mic = self.deps.mic_lock.holder() == Some(MicHolder::Session);
        if self.state == SessionState::Idle
            && self.session.is_none()
            && self.pending.is_none()
            && !holds_mic
        {
            return;
        }

        let session_id = self.session.as_ref().map(|s| s.id);
        tracing::info!(session_id = ?session_id, state = %self.state, "stopping session");

        self.generation += 1;
        self.abort_tasks();
        self.tool_queue = None;

        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.flush();
        }
        self.deps.mic_lock.release(&MicHolder::Session);

        self.opened = false;
        self.unsent_responses.clear();
        self.session = None;
        if let Some(pending) = self.pending.take() {
            let _ = pending
                .reply
                .send(Err(Error::Cancelled("session stopped while starting".to_string())));
        }
        self.set_state(SessionState::Idle);
    }

    // Observation

    fn set_state(&mut self, state: SessionState) {
        let changed = self.state != state;
        self.state = state;
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
        if changed {
            tracing::debug!(state = %state, "session state");
            self.deps.bus.publish(BusEvent::SessionState {
                state,
                session_id: self.session.as_ref().map(|s| s.id),
            });
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state,
            session: self.session.clone(),
            last_error: self.last_error.clone(),
            handoff_requested: self.handoff_requested,
            starting: self.pending.is_some(),
            transcript: self.transcript.clone(),
        });
    }
}

/// Open the microphone, retrying with a fixed backoff
async fn open_capture(
    microphone: &dyn Microphone,
    tx: &mpsc::UnboundedSender<Command>,
    generation: u64,
    settings: &SessionSettings,
) -> Result<AudioCaptureStream> {
    let attempts = settings.mic_retry_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let frames = tx.clone();
        let on_frame = Box::new(move |frame: AudioFrame| {
            let _ = frames.send(Command::Frame { generation, frame });
        });

        match AudioCaptureStream::open(microphone, on_frame).await {
            Ok(capture) => return Ok(capture),
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "microphone open failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(settings.mic_retry_backoff).await;
                }
            }
        }
    }

    Err(Error::DeviceBusy(format!(
        "microphone unavailable after {attempts} attempts: {last_error}"
    )))
}

/// Cheap, cloneable access to the controller
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start a session
    ///
    /// Resolves once the channel is open, or with the reason it could not start.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `DeviceBusy`, `ChannelOpen`, or `Cancelled` if
    /// the session was stopped while starting
    pub async fn start(&self, context: Option<String>) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start { context, reply })
            .map_err(|_| Error::ControllerGone)?;
        rx.await.map_err(|_| Error::ControllerGone)?
    }

    /// Stop the session; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if the controller task has exited
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stop { reply: Some(reply) })
            .map_err(|_| Error::ControllerGone)?;
        rx.await.map_err(|_| Error::ControllerGone)
    }

    /// Stop any session and end the controller task
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Observe every published snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the controller reports `state`
    ///
    /// # Errors
    ///
    /// Returns error if the controller task has exited
    pub async fn wait_for(&self, state: SessionState) -> Result<SessionSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.state == state)
            .await
            .map_err(|_| Error::ControllerGone)?;
        Ok(snapshot.clone())
    }
}

#[async_trait]
impl SessionStarter for SessionHandle {
    fn is_active(&self) -> bool {
        let snapshot = self.snapshot.borrow();
        snapshot.is_active() || snapshot.state != SessionState::Idle
    }

    async fn start_session(&self, context: Option<String>) -> Result<()> {
        self.start(context).await.map(|_| ())
    }
}
