//! Microphone capture and framing
//!
//! A [`Microphone`] delivers raw mono samples at whatever rate the device runs.
//! [`AudioCaptureStream`] resamples them to 16 kHz, cuts fixed 4096-sample windows,
//! converts them to 16-bit PCM and hands each window to a callback. The callback runs
//! on the capture thread, so it must not block.

use async_trait::async_trait;
use rubato::{FftFixedIn, Resampler};

use crate::channel::MediaChunk;
use crate::{Error, Result};

/// Sample rate of outbound frames (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound frame (256 ms at 16kHz)
pub const FRAME_SAMPLES: usize = 4096;

/// Resampler input chunk size
const RESAMPLE_CHUNK: usize = 1024;

/// Microphone permission status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    /// Not decided yet; asking may grant it
    Prompt,
}

/// Receives mono samples and the rate they were captured at
pub type SampleSink = Box<dyn FnMut(&[f32], u32) + Send>;

/// Receives encoded frames
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send>;

/// An open microphone; dropping it releases the device
pub trait MicHandle: Send {
    /// Native capture rate
    fn sample_rate(&self) -> u32;

    /// Stop capturing and release the device
    fn close(&mut self);
}

/// Platform microphone capability
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Current permission status, without prompting
    async fn permission(&self) -> Permission;

    /// Ask for permission once
    async fn request_permission(&self) -> Permission;

    /// Open the device and start delivering samples to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the device is missing or held by another consumer
    async fn open(&self, sink: SampleSink) -> Result<Box<dyn MicHandle>>;
}

/// One outbound window of 16kHz mono PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Capture order, starting at 0
    pub sequence: u64,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Wire envelope for this frame
    #[must_use]
    pub fn to_media_chunk(&self) -> MediaChunk {
        MediaChunk::from_samples(&self.samples)
    }

    /// Frame length
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_micros(
            self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate),
        )
    }
}

/// Converts a float sample in [-1.0, 1.0] to 16-bit PCM
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Builds fixed-size 16kHz frames from arbitrary-rate input
pub struct FrameAssembler {
    input_rate: Option<u32>,
    resampler: Option<FftFixedIn<f64>>,
    pending: Vec<f64>,
    window: Vec<i16>,
    sequence: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            input_rate: None,
            resampler: None,
            pending: Vec::new(),
            window: Vec::with_capacity(FRAME_SAMPLES),
            sequence: 0,
        }
    }

    /// Feed samples captured at `rate`, emitting every completed frame
    ///
    /// # Errors
    ///
    /// Returns error if a resampler cannot be built for `rate`
    pub fn push(
        &mut self,
        samples: &[f32],
        rate: u32,
        emit: &mut dyn FnMut(AudioFrame),
    ) -> Result<()> {
        if self.input_rate != Some(rate) {
            self.reconfigure(rate)?;
        }

        match self.resampler.as_mut() {
            None => {
                for &sample in samples {
                    self.push_sample(f32_to_i16(sample), emit);
                }
            }
            Some(resampler) => {
                self.pending.extend(samples.iter().map(|&s| f64::from(s)));

                let mut resampled = Vec::new();
                // The resampler may round its chunk size up; always ask it
                let chunk_len = resampler.input_frames_next();
                while self.pending.len() >= chunk_len {
                    let chunk: Vec<f64> = self.pending.drain(..chunk_len).collect();
                    let output = resampler
                        .process(&[chunk], None)
                        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
                    if let Some(channel) = output.into_iter().next() {
                        resampled.extend(channel);
                    }
                }

                for sample in resampled {
                    #[allow(clippy::cast_possible_truncation)]
                    self.push_sample(f32_to_i16(sample as f32), emit);
                }
            }
        }

        Ok(())
    }

    fn reconfigure(&mut self, rate: u32) -> Result<()> {
        self.pending.clear();
        self.resampler = if rate == SAMPLE_RATE {
            None
        } else {
            let resampler = FftFixedIn::<f64>::new(
                rate as usize,
                SAMPLE_RATE as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            tracing::debug!(from = rate, to = SAMPLE_RATE, "capture resampling enabled");
            Some(resampler)
        };
        self.input_rate = Some(rate);
        Ok(())
    }

    fn push_sample(&mut self, sample: i16, emit: &mut dyn FnMut(AudioFrame)) {
        self.window.push(sample);
        if self.window.len() == FRAME_SAMPLES {
            let samples = std::mem::replace(&mut self.window, Vec::with_capacity(FRAME_SAMPLES));
            emit(AudioFrame {
                sequence: self.sequence,
                samples,
                sample_rate: SAMPLE_RATE,
                channels: 1,
            });
            self.sequence += 1;
        }
    }
}

/// A running capture producing [`AudioFrame`]s
pub struct AudioCaptureStream {
    handle: Option<Box<dyn MicHandle>>,
}

impl AudioCaptureStream {
    /// Open `microphone` and deliver every completed frame to `on_frame`
    ///
    /// # Errors
    ///
    /// Returns error if the microphone cannot be opened
    pub async fn open(microphone: &dyn Microphone, mut on_frame: FrameSink) -> Result<Self> {
        let mut assembler = FrameAssembler::new();
        let sink: SampleSink = Box::new(move |samples: &[f32], rate: u32| {
            if let Err(e) = assembler.push(samples, rate, &mut on_frame) {
                tracing::error!(error = %e, "dropping captured audio");
            }
        });

        let handle = microphone.open(sink).await?;
        tracing::debug!(device_rate = handle.sample_rate(), "audio capture started");

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Stop capturing and release the device; safe to call more than once
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for AudioCaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
