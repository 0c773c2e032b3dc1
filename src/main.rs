use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voxlink::channel::protocol::OUTPUT_SAMPLE_RATE;
use voxlink::session::Speaker;
use voxlink::tools::ToolExecutor;
use voxlink::voice::{
    self, AudioCaptureStream, AudioFrame, CpalMicrophone, CpalSpeaker, PlaybackScheduler,
};
use voxlink::{Config, Daemon, Engine, EventBus, SessionState, StartOutcome, ToolRegistry};

/// voxlink - real-time voice-agent session engine
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Control API port
    #[arg(long, env = "VOXLINK_API_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run without passive wake word detection
    #[arg(long, env = "VOXLINK_DISABLE_WAKE_WORD")]
    disable_wake_word: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session immediately and print the transcript
    Talk {
        /// Extra instruction appended for this session
        #[arg(short, long)]
        context: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// List the tools offered to the model
    Tools,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voxlink=info",
        1 => "info,voxlink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.disable_wake_word {
        config.wake_word.enabled = false;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Talk { context } => {
                config.wake_word.enabled = false;
                talk(&config, context).await
            }
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Tools => {
                list_tools();
                Ok(())
            }
        };
    }

    tracing::info!(
        port = config.server.port,
        wake_word = config.wake_word.enabled,
        "starting voxlink"
    );

    Daemon::new(config).run().await?;
    Ok(())
}

/// Run one session in the foreground
async fn talk(config: &Config, context: Option<String>) -> anyhow::Result<()> {
    let engine = Engine::build(config)?;
    let mut snapshots = engine.session.subscribe();

    match engine.session.start(context).await? {
        StartOutcome::Started(id) => println!("Session {id} listening. Press Ctrl-C to end.\n"),
        StartOutcome::AlreadyActive => anyhow::bail!("a session is already active"),
    }

    let mut printed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for line in snapshot.transcript.log.iter().skip(printed) {
                    let who = match line.speaker {
                        Speaker::User => "you",
                        Speaker::Agent => "agent",
                    };
                    println!("{who}: {}", line.text);
                }
                printed = printed.max(snapshot.transcript.log.len());

                if snapshot.state == SessionState::Idle {
                    if let Some(error) = snapshot.last_error {
                        println!("\nSession ended with error: {error}");
                    } else {
                        println!("\nSession ended.");
                    }
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
    let mut capture = AudioCaptureStream::open(
        &CpalMicrophone::new(),
        Box::new(move |frame: AudioFrame| {
            let _ = tx.send(frame);
        }),
    )
    .await?;

    println!("Frames of {} samples at 16000 Hz", voice::FRAME_SAMPLES);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            samples.extend(frame.samples.iter().map(|s| f32::from(*s) / 32768.0));
        }
        let energy = voice::rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
    }

    capture.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with three back-to-back tones through the scheduler
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three tones with no gaps between them\n");

    let speaker = Arc::new(CpalSpeaker::new()?);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::new(
        speaker,
        Arc::new(move |id: u64| {
            let _ = done_tx.send(id);
        }),
    );

    for frequency in [440.0_f32, 554.37, 659.25] {
        if let Some(entry) = scheduler.enqueue(tone(frequency, Duration::from_millis(600))) {
            println!("tone {} Hz scheduled for {:?}", frequency, entry.duration);
        }
    }

    while let Some(id) = done_rx.recv().await {
        if scheduler.complete(id) {
            break;
        }
    }

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// 16-bit little-endian PCM sine at the playback rate
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn tone(frequency: f32, duration: Duration) -> Vec<u8> {
    let rate = OUTPUT_SAMPLE_RATE as f32;
    let count = (rate * duration.as_secs_f32()) as usize;
    (0..count)
        .flat_map(|i| {
            let t = i as f32 / rate;
            let sample = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            ((sample * f32::from(i16::MAX)) as i16).to_le_bytes()
        })
        .collect()
}

/// Print every builtin tool declaration
fn list_tools() {
    let registry = ToolRegistry::with_builtins(&EventBus::new());
    for declaration in registry.declarations() {
        println!("{:<26} {}", declaration.name, declaration.description);
    }
}
