//! Session controller integration tests
//!
//! Drive the controller through fake devices and a fake remote channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::broadcast;
use tokio::time::Instant;

use voxlink::channel::ChannelEvent;
use voxlink::session::{Speaker, TranscriptFragment};
use voxlink::tools::{ControlSignal, TOOL_FAILURE_RESULT, ToolRegistry};
use voxlink::session::SessionSettings;
use voxlink::voice::{FRAME_SAMPLES, Permission, SessionStarter, WakeWordSupervisor};
use voxlink::{BusEvent, Error, MicHolder, SessionState, StartOutcome};

mod common;
use common::{
    FakeMicrophone, FakeTransport, Harness, Script, ScriptedTool, eventually, invocation, pcm,
    test_settings, within,
};

/// Drain session-state transitions seen on the bus so far
fn states_seen(rx: &mut broadcast::Receiver<BusEvent>) -> Vec<SessionState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let BusEvent::SessionState { state, .. } = event {
            states.push(state);
        }
    }
    states
}

async fn started(harness: &Harness) -> uuid::Uuid {
    match within(harness.session.start(None)).await.unwrap() {
        StartOutcome::Started(id) => id,
        StartOutcome::AlreadyActive => panic!("session already active"),
    }
}

#[tokio::test]
async fn start_goes_connecting_then_listening() {
    let harness = Harness::ready();
    let mut rx = harness.bus.subscribe();

    let id = started(&harness).await;

    assert_eq!(
        states_seen(&mut rx),
        vec![SessionState::Connecting, SessionState::Listening]
    );
    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.state, SessionState::Listening);
    assert_eq!(snapshot.session.unwrap().id, id);
    assert_eq!(harness.mic_lock.holder(), Some(MicHolder::Session));
    assert_eq!(harness.microphone.open_handles(), 1);
}

#[tokio::test]
async fn open_acknowledged_after_connect_returns() {
    let harness = Harness::with_builtins(FakeMicrophone::new(), FakeTransport::manual());

    let session = harness.session.clone();
    let start = tokio::spawn(async move { session.start(None).await });

    eventually(|| harness.transport.connects() == 1).await;
    assert_eq!(harness.session.state(), SessionState::Connecting);

    harness.transport.emit(ChannelEvent::Open);
    let outcome = within(start).await.unwrap().unwrap();
    assert!(matches!(outcome, StartOutcome::Started(_)));
    assert_eq!(harness.session.state(), SessionState::Listening);
}

#[tokio::test]
async fn tool_call_before_connect_returns_is_answered() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::new(
        "greet",
        Script::Reply("hello there".to_string()),
        &calls,
    ));
    let transport = FakeTransport::auto_open().with_early_events(
        vec![ChannelEvent::ToolCall(vec![invocation("early", "greet")])],
        Duration::from_millis(150),
    );
    let harness = Harness::new(FakeMicrophone::new(), transport, tools);

    started(&harness).await;

    eventually(|| harness.transport.log().tool_responses.len() == 1).await;
    let response = &harness.transport.log().tool_responses[0];
    assert_eq!(response.id, "early");
    assert_eq!(response.response.result, "hello there");
    assert_eq!(*calls.lock().unwrap(), ["greet"]);
}

#[tokio::test]
async fn greeting_audio_before_connect_returns_is_played() {
    let transport = FakeTransport::auto_open()
        .with_early_events(vec![ChannelEvent::Audio(pcm(400))], Duration::from_millis(50));
    let harness = Harness::with_builtins(FakeMicrophone::new(), transport);
    let mut rx = harness.bus.subscribe();

    started(&harness).await;

    assert_eq!(harness.sink.scheduled().len(), 1);
    within(harness.session.wait_for(SessionState::Listening))
        .await
        .unwrap();
    assert_eq!(
        states_seen(&mut rx),
        vec![
            SessionState::Connecting,
            SessionState::Speaking,
            SessionState::Listening
        ]
    );
}

#[tokio::test]
async fn stalled_connect_times_out() {
    let settings = SessionSettings {
        open_timeout: Duration::from_millis(200),
        ..test_settings()
    };
    let harness = Harness::with_settings(
        FakeMicrophone::new(),
        FakeTransport::stalled(),
        ToolRegistry::new(),
        settings,
    );

    let err = within(harness.session.start(None)).await.unwrap_err();
    assert!(matches!(err, Error::ChannelOpen(_)));
    assert_eq!(harness.session.state(), SessionState::Error);

    within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert!(!harness.mic_lock.is_held());
    assert_eq!(harness.microphone.open_handles(), 0);
}

#[tokio::test]
async fn session_is_active_while_permission_is_pending() {
    let harness = Harness::with_builtins(
        FakeMicrophone::slow_permission(Duration::from_millis(300)),
        FakeTransport::auto_open(),
    );

    let session = harness.session.clone();
    let start = tokio::spawn(async move { session.start(None).await });

    eventually(|| harness.session.snapshot().starting).await;
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert!(harness.session.is_active());
    assert!(!harness.mic_lock.is_held());

    within(start).await.unwrap().unwrap();
    let snapshot = harness.session.snapshot();
    assert!(!snapshot.starting);
    assert_eq!(snapshot.state, SessionState::Listening);

    within(harness.session.stop()).await.unwrap();
    assert!(!harness.session.is_active());
}

#[tokio::test]
async fn context_is_appended_to_instruction() {
    let harness = Harness::ready();
    within(harness.session.start(Some("The user is vegetarian.".to_string())))
        .await
        .unwrap();

    let setups = harness.transport.setups();
    assert_eq!(setups.len(), 1);
    let setup = &setups[0];
    assert!(setup.system_instruction.ends_with("The user is vegetarian."));
    assert!(
        setup
            .tools
            .iter()
            .any(|tool| tool.name == "terminate_voice_session")
    );
}

#[tokio::test]
async fn second_start_is_a_no_op() {
    let harness = Harness::ready();
    started(&harness).await;

    let outcome = within(harness.session.start(None)).await.unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyActive);
    assert_eq!(harness.transport.connects(), 1);
}

#[tokio::test]
async fn gapless_playback_then_back_to_listening() {
    let harness = Harness::ready();
    started(&harness).await;

    harness.transport.emit(ChannelEvent::Audio(pcm(200)));
    harness.transport.emit(ChannelEvent::Audio(pcm(150)));
    harness.transport.emit(ChannelEvent::Audio(pcm(300)));

    within(harness.session.wait_for(SessionState::Speaking))
        .await
        .unwrap();
    eventually(|| harness.sink.scheduled().len() == 3).await;

    let scheduled = harness.sink.scheduled();
    let t0 = scheduled[0].2;
    assert_eq!(scheduled[1].2, t0 + Duration::from_millis(200));
    assert_eq!(scheduled[2].2, t0 + Duration::from_millis(350));
    assert_eq!(scheduled[0].1, 200 * 24);

    within(harness.session.wait_for(SessionState::Listening))
        .await
        .unwrap();
    assert!(Instant::now() >= t0 + Duration::from_millis(650));
}

#[tokio::test]
async fn interruption_flushes_immediately() {
    let harness = Harness::ready();
    started(&harness).await;

    harness.transport.emit(ChannelEvent::Audio(pcm(2000)));
    within(harness.session.wait_for(SessionState::Speaking))
        .await
        .unwrap();

    let interrupted_at = Instant::now();
    harness.transport.emit(ChannelEvent::Interrupted);
    within(harness.session.wait_for(SessionState::Listening))
        .await
        .unwrap();

    assert!(interrupted_at.elapsed() < Duration::from_millis(500));
    assert!(harness.sink.cancels() >= 1);

    // Audio after the flush starts now, not after the cancelled buffer
    harness.transport.emit(ChannelEvent::Audio(pcm(100)));
    eventually(|| harness.sink.scheduled().len() == 2).await;
    let second = harness.sink.scheduled()[1].2;
    assert!(second < interrupted_at + Duration::from_millis(500));
}

#[tokio::test]
async fn terminate_tool_stops_and_rearms_wake_word() {
    struct Never;

    #[async_trait::async_trait]
    impl voxlink::voice::PhraseDetector for Never {
        async fn listen(&self) -> voxlink::Result<Option<voxlink::voice::Trigger>> {
            std::future::pending().await
        }
    }

    let harness = Harness::ready();
    let supervisor = WakeWordSupervisor::new(
        Arc::new(Never),
        Arc::new(harness.session.clone()),
        harness.mic_lock.clone(),
        Duration::from_millis(20),
    );
    let _watch = supervisor.watch(&harness.bus);
    assert!(supervisor.arm());

    started(&harness).await;
    eventually(|| !supervisor.is_armed()).await;

    let mut rx = harness.bus.subscribe();
    harness.transport.emit(ChannelEvent::ToolCall(vec![invocation(
        "1",
        "terminate_voice_session",
    )]));

    let snapshot = within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert!(snapshot.session.is_none());
    assert!(!harness.mic_lock.is_held());
    assert!(harness.transport.log().tool_responses.is_empty());
    assert_eq!(harness.transport.log().closes, 1);
    assert_eq!(harness.microphone.open_handles(), 0);

    // Released first, re-armed after the cooldown
    let mut released = false;
    within(async {
        loop {
            match rx.recv().await.unwrap() {
                BusEvent::MicLock { state: false } => released = true,
                BusEvent::WakeWordRearm => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(released);
    eventually(|| supervisor.is_armed()).await;
    supervisor.disarm();
}

#[tokio::test]
async fn microphone_busy_after_three_attempts() {
    let harness = Harness::with_builtins(FakeMicrophone::failing(3), FakeTransport::auto_open());

    let err = within(harness.session.start(None)).await.unwrap_err();
    assert!(matches!(err, Error::DeviceBusy(_)), "got {err:?}");
    assert_eq!(harness.microphone.open_calls(), 3);
    assert_eq!(harness.transport.connects(), 0);

    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(snapshot.last_error.unwrap().contains("3 attempts"));

    let snapshot = within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert!(snapshot.last_error.is_some());
    assert!(!harness.mic_lock.is_held());
}

#[tokio::test]
async fn microphone_recovers_within_retry_budget() {
    let harness = Harness::with_builtins(FakeMicrophone::failing(2), FakeTransport::auto_open());
    started(&harness).await;
    assert_eq!(harness.microphone.open_calls(), 3);
}

#[tokio::test]
async fn denied_permission_never_takes_the_lock() {
    let harness = Harness::with_builtins(
        FakeMicrophone::with_permission(Permission::Denied, Permission::Denied),
        FakeTransport::auto_open(),
    );
    let mut rx = harness.bus.subscribe();

    let err = within(harness.session.start(None)).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(harness.microphone.open_calls(), 0);

    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, BusEvent::MicLock { state: true }));
    }
}

#[tokio::test]
async fn prompt_is_asked_once() {
    let harness = Harness::with_builtins(
        FakeMicrophone::with_permission(Permission::Prompt, Permission::Granted),
        FakeTransport::auto_open(),
    );
    started(&harness).await;
    assert_eq!(harness.session.state(), SessionState::Listening);
}

#[tokio::test]
async fn start_refused_while_mic_held_elsewhere() {
    let harness = Harness::ready();
    assert!(
        harness
            .mic_lock
            .acquire(MicHolder::External("push-to-talk".to_string()))
    );

    let err = within(harness.session.start(None)).await.unwrap_err();
    assert!(matches!(err, Error::DeviceBusy(_)));
    assert_eq!(harness.microphone.open_calls(), 0);
    assert_eq!(
        harness.mic_lock.holder(),
        Some(MicHolder::External("push-to-talk".to_string()))
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let harness = Harness::ready();
    within(harness.session.stop()).await.unwrap();

    started(&harness).await;
    within(harness.session.stop()).await.unwrap();
    within(harness.session.stop()).await.unwrap();

    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(harness.transport.log().closes, 1);
    assert_eq!(harness.microphone.open_handles(), 0);
    assert!(!harness.mic_lock.is_held());
}

#[tokio::test]
async fn stop_while_connecting_cancels_start() {
    let harness = Harness::with_builtins(FakeMicrophone::new(), FakeTransport::manual());

    let session = harness.session.clone();
    let start = tokio::spawn(async move { session.start(None).await });
    eventually(|| harness.transport.connects() == 1).await;

    within(harness.session.stop()).await.unwrap();

    let err = within(start).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert!(!harness.mic_lock.is_held());
    eventually(|| harness.microphone.open_handles() == 0).await;

    // A late acknowledgment from the abandoned channel changes nothing
    harness.transport.emit(ChannelEvent::Open);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn channel_open_failure_is_not_retried() {
    let harness = Harness::with_builtins(FakeMicrophone::new(), FakeTransport::refusing());

    let err = within(harness.session.start(None)).await.unwrap_err();
    assert!(matches!(err, Error::ChannelOpen(_)));
    assert_eq!(harness.transport.connects(), 1);
    assert_eq!(harness.session.state(), SessionState::Error);

    within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert_eq!(harness.microphone.open_handles(), 0);
    assert!(!harness.mic_lock.is_held());
}

#[tokio::test]
async fn runtime_error_drains_to_idle() {
    let harness = Harness::ready();
    started(&harness).await;

    harness
        .transport
        .emit(ChannelEvent::Error("socket reset".to_string()));
    let snapshot = within(harness.session.wait_for(SessionState::Error))
        .await
        .unwrap();
    assert!(snapshot.last_error.unwrap().contains("socket reset"));

    // Events during Error are dropped
    harness.transport.emit(ChannelEvent::Audio(pcm(100)));

    within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert!(harness.sink.scheduled().is_empty());
    assert!(!harness.mic_lock.is_held());
    assert_eq!(harness.transport.log().closes, 1);
}

#[tokio::test]
async fn remote_close_stops_session() {
    let harness = Harness::ready();
    started(&harness).await;

    harness.transport.emit(ChannelEvent::Closed);
    within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    assert!(!harness.mic_lock.is_held());
    assert_eq!(harness.microphone.open_handles(), 0);
}

#[tokio::test]
async fn tool_batch_is_resolved_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::new(
        "slow",
        Script::Slow(Duration::from_millis(50), "slow done".to_string()),
        &calls,
    ));
    tools.register(ScriptedTool::new(
        "fast",
        Script::Reply("fast done".to_string()),
        &calls,
    ));
    tools.register(ScriptedTool::new("broken", Script::Fail, &calls));

    let harness = Harness::new(FakeMicrophone::new(), FakeTransport::auto_open(), tools);
    started(&harness).await;

    harness.transport.emit(ChannelEvent::ToolCall(vec![
        invocation("a", "slow"),
        invocation("b", "fast"),
        invocation("c", "broken"),
        invocation("d", "missing"),
    ]));

    eventually(|| harness.transport.log().tool_responses.len() == 4).await;
    let responses = harness.transport.log().tool_responses;

    let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c", "d"]);
    assert_eq!(responses[0].response.result, "slow done");
    assert_eq!(responses[1].response.result, "fast done");
    assert_eq!(responses[2].response.result, TOOL_FAILURE_RESULT);
    assert_eq!(responses[3].response.result, TOOL_FAILURE_RESULT);
    assert_eq!(responses[3].name, "missing");

    assert_eq!(*calls.lock().unwrap(), ["slow", "fast", "broken"]);
    assert_eq!(harness.session.state(), SessionState::Listening);
}

#[tokio::test]
async fn hung_tool_times_out() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::new(
        "hang",
        Script::Slow(Duration::from_secs(30), "never".to_string()),
        &calls,
    ));

    let harness = Harness::new(FakeMicrophone::new(), FakeTransport::auto_open(), tools);
    started(&harness).await;

    harness
        .transport
        .emit(ChannelEvent::ToolCall(vec![invocation("h", "hang")]));

    eventually(|| harness.transport.log().tool_responses.len() == 1).await;
    let response = &harness.transport.log().tool_responses[0];
    assert_eq!(response.id, "h");
    assert_eq!(response.response.result, TOOL_FAILURE_RESULT);
}

#[tokio::test]
async fn calls_after_a_control_signal_are_skipped() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(ScriptedTool::new(
        "first",
        Script::Reply("ok".to_string()),
        &calls,
    ));
    tools.register(ScriptedTool::new(
        "bye",
        Script::Control(ControlSignal::Terminate),
        &calls,
    ));
    tools.register(ScriptedTool::new(
        "after",
        Script::Reply("late".to_string()),
        &calls,
    ));

    let harness = Harness::new(FakeMicrophone::new(), FakeTransport::auto_open(), tools);
    started(&harness).await;

    harness.transport.emit(ChannelEvent::ToolCall(vec![
        invocation("1", "first"),
        invocation("2", "bye"),
        invocation("3", "after"),
    ]));

    within(harness.session.wait_for(SessionState::Idle))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*calls.lock().unwrap(), ["first", "bye"]);
    let responses = harness.transport.log().tool_responses;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, "1");
}

#[tokio::test]
async fn logout_stops_then_publishes() {
    let harness = Harness::ready();
    started(&harness).await;
    let mut rx = harness.bus.subscribe();

    harness
        .transport
        .emit(ChannelEvent::ToolCall(vec![invocation("1", "logout")]));

    let mut saw_idle = false;
    within(async {
        loop {
            match rx.recv().await.unwrap() {
                BusEvent::SessionState {
                    state: SessionState::Idle,
                    ..
                } => saw_idle = true,
                BusEvent::Logout => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(saw_idle, "logout published before the session stopped");
}

#[tokio::test]
async fn handoff_sets_flag() {
    let harness = Harness::ready();
    started(&harness).await;
    let mut rx = harness.bus.subscribe();

    harness
        .transport
        .emit(ChannelEvent::ToolCall(vec![invocation("1", "handoff_to_chat")]));

    within(async {
        while rx.recv().await.unwrap() != BusEvent::Handoff {}
    })
    .await;

    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.handoff_requested);
}

#[tokio::test]
async fn navigate_tool_publishes_and_replies() {
    let harness = Harness::ready();
    started(&harness).await;
    let mut rx = harness.bus.subscribe();

    let mut call = invocation("n1", "navigate");
    call.args = serde_json::json!({"destination": "recipes"});
    harness.transport.emit(ChannelEvent::ToolCall(vec![call]));

    within(async {
        loop {
            if let BusEvent::NavStart { destination } = rx.recv().await.unwrap() {
                assert_eq!(destination, "recipes");
                break;
            }
        }
    })
    .await;

    eventually(|| harness.transport.log().tool_responses.len() == 1).await;
    assert_eq!(harness.session.state(), SessionState::Listening);
}

#[tokio::test]
async fn captured_frames_are_streamed() {
    let harness = Harness::ready();
    started(&harness).await;

    let window = vec![0.25_f32; FRAME_SAMPLES + 100];
    assert!(harness.microphone.feed(&window));

    eventually(|| harness.transport.log().audio.len() == 1).await;
    let chunk = &harness.transport.log().audio[0];
    assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    let bytes = BASE64.decode(&chunk.data).unwrap();
    assert_eq!(bytes.len(), FRAME_SAMPLES * 2);
}

#[tokio::test]
async fn transcripts_accumulate_per_turn() {
    let harness = Harness::ready();
    started(&harness).await;

    let fragment = |speaker, text: &str, is_final| {
        ChannelEvent::Transcript(TranscriptFragment {
            speaker,
            text: text.to_string(),
            is_final,
        })
    };
    harness.transport.emit(fragment(Speaker::User, "what's", false));
    harness
        .transport
        .emit(fragment(Speaker::User, "what's for dinner", false));
    harness.transport.emit(fragment(Speaker::Agent, "How about ", false));
    harness.transport.emit(fragment(Speaker::Agent, "pasta?", false));
    harness.transport.emit(ChannelEvent::TurnComplete);

    eventually(|| harness.session.snapshot().transcript.log.len() == 2).await;
    let transcript = harness.session.snapshot().transcript;
    assert_eq!(transcript.log[0].speaker, Speaker::User);
    assert_eq!(transcript.log[0].text, "what's for dinner");
    assert_eq!(transcript.log[1].text, "How about pasta?");
    assert!(transcript.user.is_empty());
    assert_eq!(harness.session.state(), SessionState::Listening);
}
