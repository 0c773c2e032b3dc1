//! Shared test utilities: in-memory fakes for the microphone, the remote channel,
//! the output device and tools.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use voxlink::channel::{
    ChannelEvent, ConversationChannel, ConversationTransport, EventSink, FunctionDeclaration,
    FunctionResponse, LiveSetup, MediaChunk,
};
use voxlink::session::{SessionController, SessionDeps, SessionHandle, SessionSettings};
use voxlink::tools::{ControlSignal, Tool, ToolInvocation, ToolOutcome, ToolRegistry};
use voxlink::voice::{AudioSink, MicHandle, Microphone, Permission, SAMPLE_RATE, SampleSink};
use voxlink::{Error, EventBus, MicLock, Result};

/// Delay between a mic lock release and the re-arm signal in tests
pub const REARM_DELAY: Duration = Duration::from_millis(100);

/// Await `future`, failing the test after a few seconds
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(3), future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Silent 24kHz PCM16 lasting `millis`
pub fn pcm(millis: usize) -> Vec<u8> {
    vec![0; millis * 24 * 2]
}

type SinkSlot = Arc<Mutex<Option<SampleSink>>>;

/// Microphone with scripted permission and open failures
pub struct FakeMicrophone {
    permission: Mutex<Permission>,
    prompt_answer: Permission,
    permission_delay: Duration,
    failures_left: AtomicU32,
    open_calls: AtomicU32,
    open_handles: Arc<AtomicUsize>,
    sink: SinkSlot,
}

impl Default for FakeMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::with_permission(Permission::Granted, Permission::Granted)
    }

    /// `permission` is reported first; `prompt_answer` is what a request returns
    pub fn with_permission(permission: Permission, prompt_answer: Permission) -> Self {
        Self {
            permission: Mutex::new(permission),
            prompt_answer,
            permission_delay: Duration::ZERO,
            failures_left: AtomicU32::new(0),
            open_calls: AtomicU32::new(0),
            open_handles: Arc::new(AtomicUsize::new(0)),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Fail the first `times` opens with `DeviceBusy`
    pub fn failing(times: u32) -> Self {
        let mic = Self::new();
        mic.failures_left.store(times, Ordering::SeqCst);
        mic
    }

    /// Take `delay` to answer the permission query, like a pending OS prompt
    pub fn slow_permission(delay: Duration) -> Self {
        let mut mic = Self::new();
        mic.permission_delay = delay;
        mic
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Deliver samples as if captured at 16kHz; `false` if nothing is listening
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut slot = self.sink.lock().unwrap();
        match slot.as_mut() {
            Some(sink) => {
                sink(samples, SAMPLE_RATE);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn permission(&self) -> Permission {
        if !self.permission_delay.is_zero() {
            tokio::time::sleep(self.permission_delay).await;
        }
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self) -> Permission {
        *self.permission.lock().unwrap() = self.prompt_answer;
        self.prompt_answer
    }

    async fn open(&self, sink: SampleSink) -> Result<Box<dyn MicHandle>> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::DeviceBusy("fake device busy".to_string()));
        }

        *self.sink.lock().unwrap() = Some(sink);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicHandle {
            open_handles: Arc::clone(&self.open_handles),
            sink: Arc::clone(&self.sink),
            closed: false,
        }))
    }
}

struct FakeMicHandle {
    open_handles: Arc<AtomicUsize>,
    sink: SinkSlot,
    closed: bool,
}

impl MicHandle for FakeMicHandle {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sink.lock().unwrap().take();
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeMicHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// What the engine sent over fake channels
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    pub audio: Vec<MediaChunk>,
    pub tool_responses: Vec<FunctionResponse>,
    pub closes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    /// Acknowledge the setup before `connect` returns
    AutoOpen,
    /// Wait for the test to emit `Open`
    Manual,
    /// Refuse the connection
    Refuse,
    /// Never finish connecting
    Stall,
}

/// Transport whose channels record outbound traffic and whose events the test drives
pub struct FakeTransport {
    mode: ConnectMode,
    connects: AtomicU32,
    setups: Mutex<Vec<LiveSetup>>,
    events: Mutex<Option<EventSink>>,
    log: Arc<Mutex<ChannelLog>>,
    /// Delivered inside `connect`, after any automatic `Open`
    early: Vec<ChannelEvent>,
    /// Held before `connect` returns the channel
    connect_delay: Duration,
}

impl FakeTransport {
    fn with_mode(mode: ConnectMode) -> Self {
        Self {
            mode,
            connects: AtomicU32::new(0),
            setups: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            log: Arc::new(Mutex::new(ChannelLog::default())),
            early: Vec::new(),
            connect_delay: Duration::ZERO,
        }
    }

    pub fn auto_open() -> Self {
        Self::with_mode(ConnectMode::AutoOpen)
    }

    pub fn manual() -> Self {
        Self::with_mode(ConnectMode::Manual)
    }

    pub fn refusing() -> Self {
        Self::with_mode(ConnectMode::Refuse)
    }

    pub fn stalled() -> Self {
        Self::with_mode(ConnectMode::Stall)
    }

    /// Remote traffic that arrives before the channel handle is returned
    pub fn with_early_events(mut self, events: Vec<ChannelEvent>, delay: Duration) -> Self {
        self.early = events;
        self.connect_delay = delay;
        self
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> Vec<LiveSetup> {
        self.setups.lock().unwrap().clone()
    }

    pub fn log(&self) -> ChannelLog {
        self.log.lock().unwrap().clone()
    }

    /// Deliver an inbound event through the most recent channel
    pub fn emit(&self, event: ChannelEvent) {
        let sink = self.events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

#[async_trait]
impl ConversationTransport for FakeTransport {
    async fn connect(
        &self,
        setup: LiveSetup,
        events: EventSink,
    ) -> Result<Box<dyn ConversationChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().unwrap().push(setup);

        match self.mode {
            ConnectMode::Refuse => {
                return Err(Error::ChannelOpen("connection refused".to_string()));
            }
            ConnectMode::Stall => std::future::pending::<()>().await,
            ConnectMode::AutoOpen | ConnectMode::Manual => {}
        }

        *self.events.lock().unwrap() = Some(Arc::clone(&events));
        if self.mode == ConnectMode::AutoOpen {
            events(ChannelEvent::Open);
        }
        for event in &self.early {
            events(event.clone());
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        Ok(Box::new(FakeChannel {
            log: Arc::clone(&self.log),
            closed: false,
        }))
    }
}

struct FakeChannel {
    log: Arc<Mutex<ChannelLog>>,
    closed: bool,
}

impl ConversationChannel for FakeChannel {
    fn send_audio(&self, chunk: MediaChunk) -> bool {
        if self.closed {
            return false;
        }
        self.log.lock().unwrap().audio.push(chunk);
        true
    }

    fn send_tool_response(&self, response: FunctionResponse) -> bool {
        if self.closed {
            return false;
        }
        self.log.lock().unwrap().tool_responses.push(response);
        true
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closes += 1;
        }
    }
}

/// Records what the scheduler asked the device to play
#[derive(Default)]
pub struct RecordingSink {
    scheduled: Mutex<Vec<(u64, usize, Instant)>>,
    cancels: AtomicUsize,
}

impl RecordingSink {
    /// `(id, sample count, start)` in scheduling order
    pub fn scheduled(&self) -> Vec<(u64, usize, Instant)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingSink {
    fn schedule(&self, id: u64, samples: Arc<[f32]>, start: Instant) {
        self.scheduled.lock().unwrap().push((id, samples.len(), start));
    }

    fn cancel_all(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// What a scripted tool does when called
#[derive(Debug, Clone)]
pub enum Script {
    Reply(String),
    Control(ControlSignal),
    Fail,
    /// Reply after a delay
    Slow(Duration, String),
}

/// Tool that follows a script and logs every call
pub struct ScriptedTool {
    name: String,
    script: Script,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTool {
    pub fn new(name: &str, script: Script, calls: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            script,
            calls: Arc::clone(calls),
        }
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name.clone(),
            description: format!("scripted {}", self.name),
            parameters: None,
        }
    }

    async fn call(&self, _args: &Value) -> Result<ToolOutcome> {
        self.calls.lock().unwrap().push(self.name.clone());
        match &self.script {
            Script::Reply(text) => Ok(ToolOutcome::text(text.clone())),
            Script::Control(signal) => Ok(ToolOutcome::Control(*signal)),
            Script::Fail => Err(Error::Tool(format!("{} exploded", self.name))),
            Script::Slow(delay, text) => {
                tokio::time::sleep(*delay).await;
                Ok(ToolOutcome::text(text.clone()))
            }
        }
    }
}

pub fn invocation(id: &str, name: &str) -> ToolInvocation {
    ToolInvocation {
        id: id.to_string(),
        name: name.to_string(),
        args: Value::Object(serde_json::Map::new()),
    }
}

/// Short timings so scenarios finish quickly
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        auto_stop_delay: Duration::from_millis(200),
        mic_retry_attempts: 3,
        mic_retry_backoff: Duration::from_millis(10),
        tool_timeout: Duration::from_millis(300),
        open_timeout: Duration::from_secs(2),
        ..SessionSettings::default()
    }
}

/// A controller wired to fakes
pub struct Harness {
    pub session: SessionHandle,
    pub bus: EventBus,
    pub mic_lock: MicLock,
    pub microphone: Arc<FakeMicrophone>,
    pub transport: Arc<FakeTransport>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(microphone: FakeMicrophone, transport: FakeTransport, tools: ToolRegistry) -> Self {
        Self::with_settings(microphone, transport, tools, test_settings())
    }

    pub fn with_settings(
        microphone: FakeMicrophone,
        transport: FakeTransport,
        tools: ToolRegistry,
        settings: SessionSettings,
    ) -> Self {
        Self::assemble(EventBus::new(), microphone, transport, tools, settings)
    }

    fn assemble(
        bus: EventBus,
        microphone: FakeMicrophone,
        transport: FakeTransport,
        tools: ToolRegistry,
        settings: SessionSettings,
    ) -> Self {
        let mic_lock = MicLock::new(bus.clone(), REARM_DELAY);
        let microphone = Arc::new(microphone);
        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::default());

        let session = SessionController::spawn(SessionDeps {
            microphone: Arc::clone(&microphone) as Arc<dyn Microphone>,
            transport: Arc::clone(&transport) as Arc<dyn ConversationTransport>,
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
            tools: Arc::new(tools),
            mic_lock: mic_lock.clone(),
            bus: bus.clone(),
            settings,
        });

        Self {
            session,
            bus,
            mic_lock,
            microphone,
            transport,
            sink,
        }
    }

    /// Controller with a granted microphone, auto-opening channel and builtin tools
    pub fn ready() -> Self {
        Self::with_builtins(FakeMicrophone::new(), FakeTransport::auto_open())
    }

    /// Builtin tools publishing on the harness bus
    pub fn with_builtins(microphone: FakeMicrophone, transport: FakeTransport) -> Self {
        let bus = EventBus::new();
        let tools = ToolRegistry::with_builtins(&bus);
        Self::assemble(bus, microphone, transport, tools, test_settings())
    }
}
