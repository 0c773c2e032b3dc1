//! Default output device via cpal

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::time::Instant;

use super::playback::AudioSink;
use crate::channel::protocol::OUTPUT_SAMPLE_RATE;
use crate::{Error, Result};

/// A buffer placed on the output timeline
struct Voice {
    id: u64,
    samples: Arc<[f32]>,
    start_frame: u64,
}

/// Shared state between the scheduler side and the output callback
#[derive(Default)]
struct Mixer {
    /// Frames rendered since the stream started
    clock: u64,
    voices: Vec<Voice>,
    /// Frame just past the last placed voice
    next_frame: u64,
    /// Wall-clock end of the last placed voice
    last_end: Option<Instant>,
}

impl Mixer {
    /// Place a buffer on the output timeline
    ///
    /// A buffer that starts at or before the previous one's end is placed exactly
    /// after it; only a buffer following a drained queue is positioned by its lead
    /// over `now`.
    fn place(&mut self, id: u64, samples: Arc<[f32]>, start: Instant, now: Instant) -> u64 {
        let contiguous = self.next_frame > self.clock
            && self.last_end.is_some_and(|end| start <= end);

        let start_frame = if contiguous {
            self.next_frame
        } else {
            let lead = start.saturating_duration_since(now);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let lead_frames = (lead.as_secs_f64() * f64::from(OUTPUT_SAMPLE_RATE)).round() as u64;
            self.clock + lead_frames
        };

        let len = samples.len() as u64;
        let duration = Duration::from_nanos(len * 1_000_000_000 / u64::from(OUTPUT_SAMPLE_RATE));
        self.next_frame = start_frame + len;
        self.last_end = Some(start + duration);
        self.voices.push(Voice {
            id,
            samples,
            start_frame,
        });
        start_frame
    }

    /// Drop every voice and restart the timeline at the current frame
    fn clear(&mut self) -> Vec<u64> {
        self.next_frame = self.clock;
        self.last_end = None;
        self.voices.drain(..).map(|voice| voice.id).collect()
    }

    /// Render one output frame
    fn next_sample(&mut self) -> f32 {
        let clock = self.clock;
        let mut mixed = 0.0;
        for voice in &self.voices {
            if let Some(offset) = clock.checked_sub(voice.start_frame) {
                if let Some(sample) = usize::try_from(offset)
                    .ok()
                    .and_then(|i| voice.samples.get(i))
                {
                    mixed += sample;
                }
            }
        }
        self.clock += 1;
        self.voices.retain(|voice| {
            let end = voice.start_frame + voice.samples.len() as u64;
            end > self.clock
        });
        mixed.clamp(-1.0, 1.0)
    }
}

/// Plays scheduled buffers on the default output device
///
/// The output stream runs on a dedicated thread for the lifetime of the speaker;
/// buffers are mixed by sample position so back-to-back entries play gaplessly.
pub struct CpalSpeaker {
    mixer: Arc<Mutex<Mixer>>,
    _stop: mpsc::Sender<()>,
}

impl CpalSpeaker {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_mixer = Arc::clone(&mixer);
        std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(thread_mixer) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited during setup".to_string()))??;

        Ok(Self {
            mixer,
            _stop: stop_tx,
        })
    }
}

impl AudioSink for CpalSpeaker {
    fn schedule(&self, id: u64, samples: Arc<[f32]>, start: Instant) {
        let mut mixer = self.mixer.lock().unwrap_or_else(PoisonError::into_inner);
        let start_frame = mixer.place(id, samples, start, Instant::now());
        tracing::trace!(id, start_frame, clock = mixer.clock, "output buffer placed");
    }

    fn cancel_all(&self) {
        let mut mixer = self.mixer.lock().unwrap_or_else(PoisonError::into_inner);
        let cancelled = mixer.clear();
        tracing::trace!(?cancelled, "output buffers cancelled");
    }
}

fn build_output_stream(mixer: Arc<Mutex<Mixer>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let rate = SampleRate(OUTPUT_SAMPLE_RATE);
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = OUTPUT_SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut mixer) = mixer.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    frame.fill(mixer.next_sample());
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}
