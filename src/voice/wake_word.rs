//! Wake word detection
//!
//! Uses a hybrid approach: local energy segmentation picks out short utterances,
//! then a transcriber turns each one into text which is matched against the
//! configured trigger phrases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::capture::{Microphone, samples_to_wav};
use super::transcribe::Transcriber;
use crate::Result;

/// Default minimum audio energy to consider speech
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum speech length for a segment
const MIN_SPEECH: Duration = Duration::from_millis(300);

/// Silence that ends an utterance
const END_SILENCE: Duration = Duration::from_millis(500);

/// Longest segment worth transcribing
const MAX_SEGMENT: Duration = Duration::from_secs(6);

/// State of the speech segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Detected potential speech, accumulating
    Listening,
}

/// Splits a sample stream into utterances using RMS energy
pub struct SpeechSegmenter {
    threshold: f32,
    min_speech_samples: usize,
    silence_samples: usize,
    max_samples: usize,
    state: SegmenterState,
    buffer: Vec<f32>,
    silence_counter: usize,
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    usize::try_from(duration.as_millis() * u128::from(sample_rate) / 1000).unwrap_or(usize::MAX)
}

impl SpeechSegmenter {
    #[must_use]
    pub fn new(sample_rate: u32, threshold: f32) -> Self {
        Self {
            threshold,
            min_speech_samples: samples_for(MIN_SPEECH, sample_rate),
            silence_samples: samples_for(END_SILENCE, sample_rate),
            max_samples: samples_for(MAX_SEGMENT, sample_rate),
            state: SegmenterState::Idle,
            buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    /// Feed samples; returns a finished utterance when speech is followed by silence
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        let energy = rms(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Listening;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
                None
            }
            SegmenterState::Listening => {
                self.buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                let speech_len = self.buffer.len().saturating_sub(self.silence_counter);
                if self.silence_counter > self.silence_samples
                    && speech_len > self.min_speech_samples
                {
                    tracing::debug!(samples = self.buffer.len(), "speech segment complete");
                    let segment = std::mem::take(&mut self.buffer);
                    self.reset();
                    return Some(segment);
                }

                // Too much silence without enough speech, or a monologue
                if self.silence_counter > self.silence_samples * 2
                    || self.buffer.len() > self.max_samples
                {
                    tracing::trace!("segment discarded");
                    self.reset();
                }
                None
            }
        }
    }

    /// Reset to idle
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.clear();
        self.silence_counter = 0;
    }

    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }
}

/// Root-mean-square level of `samples`; 0 for an empty slice
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// A recognised activation phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// One of the generic activation phrases
    Standard { phrase: String },
    /// The reserved phrase, answered with a fixed reply
    Secret { reply: String },
}

impl Trigger {
    /// Context to start the session with
    #[must_use]
    pub fn context(&self) -> Option<String> {
        match self {
            Self::Standard { .. } => None,
            Self::Secret { reply } => Some(format!(
                "The user just said the secret phrase. Respond only with: \"{reply}\""
            )),
        }
    }
}

/// Lowercase, drop punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classifies transcripts into triggers
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    phrases: Vec<String>,
    secret: Option<(String, String)>,
}

impl TriggerMatcher {
    /// Create a matcher for `phrases`, plus an optional secret phrase and its reply
    #[must_use]
    pub fn new(phrases: &[String], secret: Option<(&str, &str)>) -> Self {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        let secret = secret
            .map(|(phrase, reply)| (normalize(phrase), reply.to_string()))
            .filter(|(phrase, _)| !phrase.is_empty());

        tracing::debug!(wake_words = ?phrases, secret = secret.is_some(), "trigger matcher initialized");
        Self { phrases, secret }
    }

    /// Check a transcript for a trigger phrase; the secret phrase wins
    #[must_use]
    pub fn classify(&self, transcript: &str) -> Option<Trigger> {
        let padded = format!(" {} ", normalize(transcript));
        let contains = |phrase: &str| padded.contains(&format!(" {phrase} "));

        if let Some((phrase, reply)) = &self.secret {
            if contains(phrase) {
                tracing::info!("secret phrase detected");
                return Some(Trigger::Secret {
                    reply: reply.clone(),
                });
            }
        }

        self.phrases
            .iter()
            .find(|phrase| contains(phrase))
            .map(|phrase| {
                tracing::info!(wake_word = %phrase, transcript, "wake word detected");
                Trigger::Standard {
                    phrase: phrase.clone(),
                }
            })
    }

    /// Configured standard phrases, normalized
    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

/// Passive phrase detection capability
///
/// One call to [`listen`](Self::listen) is one detector lifetime. It resolves with a
/// trigger, or `None` when the detector ends on its own without hearing one.
#[async_trait]
pub trait PhraseDetector: Send + Sync {
    /// Listen until a trigger or end of life
    ///
    /// # Errors
    ///
    /// Returns error if the microphone or transcriber fails
    async fn listen(&self) -> Result<Option<Trigger>>;
}

/// Energy-gated detector backed by a transcriber
pub struct EnergyPhraseDetector {
    microphone: Arc<dyn Microphone>,
    transcriber: Arc<dyn Transcriber>,
    matcher: TriggerMatcher,
    listen_window: Duration,
    energy_threshold: f32,
}

impl EnergyPhraseDetector {
    #[must_use]
    pub fn new(
        microphone: Arc<dyn Microphone>,
        transcriber: Arc<dyn Transcriber>,
        matcher: TriggerMatcher,
        listen_window: Duration,
        energy_threshold: f32,
    ) -> Self {
        Self {
            microphone,
            transcriber,
            matcher,
            listen_window,
            energy_threshold,
        }
    }
}

#[async_trait]
impl PhraseDetector for EnergyPhraseDetector {
    async fn listen(&self) -> Result<Option<Trigger>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Vec<f32>, u32)>();
        let mut handle = self
            .microphone
            .open(Box::new(move |samples: &[f32], rate: u32| {
                let _ = tx.send((samples.to_vec(), rate));
            }))
            .await?;

        let deadline = tokio::time::Instant::now() + self.listen_window;
        let mut segmenter: Option<(u32, SpeechSegmenter)> = None;

        let outcome = loop {
            let Ok(Some((samples, rate))) = tokio::time::timeout_at(deadline, rx.recv()).await
            else {
                // Window elapsed or the device went away
                break Ok(None);
            };

            if segmenter.as_ref().map(|(current, _)| *current) != Some(rate) {
                segmenter = Some((rate, SpeechSegmenter::new(rate, self.energy_threshold)));
            }
            let Some((_, active)) = segmenter.as_mut() else {
                continue;
            };

            let Some(segment) = active.push(&samples) else {
                continue;
            };

            let wav = match samples_to_wav(&segment, rate) {
                Ok(wav) => wav,
                Err(e) => break Err(e),
            };
            match self.transcriber.transcribe(wav).await {
                Ok(text) => {
                    if let Some(trigger) = self.matcher.classify(&text) {
                        break Ok(Some(trigger));
                    }
                }
                Err(e) => tracing::warn!(error = %e, "wake word transcription failed"),
            }
        };

        handle.close();
        outcome
    }
}
