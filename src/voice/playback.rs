//! Gapless scheduling of synthesized speech
//!
//! Inbound audio arrives as 24kHz 16-bit mono PCM chunks. Each chunk is scheduled
//! back-to-back after the previous one on the shared clock, never in the past. A
//! per-entry timer reports completion; the owner learns the queue drained when the
//! last active entry completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::protocol::OUTPUT_SAMPLE_RATE;

/// Output device capability
pub trait AudioSink: Send + Sync {
    /// Play `samples` starting at `start`
    fn schedule(&self, id: u64, samples: Arc<[f32]>, start: Instant);

    /// Stop everything scheduled or playing
    fn cancel_all(&self);
}

/// One inbound chunk of synthesized speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedFrame {
    /// Little-endian 16-bit PCM
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub arrival_order: u64,
}

impl SynthesizedFrame {
    /// Decode to float samples
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.pcm
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect()
    }

    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        let frames = (self.pcm.len() / 2 / usize::from(self.channels.max(1))) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / u64::from(self.sample_rate))
    }
}

/// A scheduled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEntry {
    pub id: u64,
    pub arrival_order: u64,
    pub start: Instant,
    pub duration: Duration,
}

impl PlaybackEntry {
    #[must_use]
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

/// Completion callback, invoked with the entry id
pub type EndedCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Schedules synthesized audio on a sink
pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    on_ended: EndedCallback,
    next_start: Instant,
    next_id: u64,
    arrivals: u64,
    active: HashMap<u64, JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Create a scheduler; `on_ended` fires when each entry finishes playing
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>, on_ended: EndedCallback) -> Self {
        Self {
            sink,
            on_ended,
            next_start: Instant::now(),
            next_id: 0,
            arrivals: 0,
            active: HashMap::new(),
        }
    }

    /// Schedule a PCM chunk after everything already queued
    ///
    /// Returns `None` for chunks too short to hold a sample.
    pub fn enqueue(&mut self, pcm: Vec<u8>) -> Option<PlaybackEntry> {
        let frame = SynthesizedFrame {
            pcm,
            sample_rate: OUTPUT_SAMPLE_RATE,
            channels: 1,
            arrival_order: self.arrivals,
        };
        self.arrivals += 1;

        let samples: Arc<[f32]> = frame.samples().into();
        if samples.is_empty() {
            tracing::debug!(arrival_order = frame.arrival_order, "ignoring empty audio chunk");
            return None;
        }

        let now = Instant::now();
        let start = self.next_start.max(now);
        let duration = frame.duration();
        self.next_start = start + duration;

        let id = self.next_id;
        self.next_id += 1;

        let entry = PlaybackEntry {
            id,
            arrival_order: frame.arrival_order,
            start,
            duration,
        };

        self.sink.schedule(id, samples, start);

        let on_ended = Arc::clone(&self.on_ended);
        let end = entry.end();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(end).await;
            on_ended(id);
        });
        self.active.insert(id, timer);

        tracing::trace!(
            id,
            arrival_order = entry.arrival_order,
            delay = ?start.saturating_duration_since(now),
            ?duration,
            "audio scheduled"
        );

        Some(entry)
    }

    /// Mark `id` finished
    ///
    /// Returns `true` if this emptied the active set. Unknown ids (already flushed)
    /// are ignored.
    pub fn complete(&mut self, id: u64) -> bool {
        self.active.remove(&id).is_some() && self.active.is_empty()
    }

    /// Stop all buffers and reset the clock to now
    pub fn flush(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.abort();
        }
        self.sink.cancel_all();
        self.next_start = Instant::now();
        tracing::debug!("playback flushed");
    }

    /// Whether nothing is scheduled
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Earliest start time for the next chunk
    #[must_use]
    pub const fn next_start(&self) -> Instant {
        self.next_start
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.abort();
        }
    }
}

/// Sink that discards audio; used when no output device is configured
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn schedule(&self, _id: u64, _samples: Arc<[f32]>, _start: Instant) {}

    fn cancel_all(&self) {}
}
