//! Voice processing module
//!
//! Handles microphone capture, playback scheduling, and passive wake word
//! detection. Platform devices sit behind the [`Microphone`] and [`AudioSink`]
//! capabilities; cpal implementations are provided for desktop hosts.

mod capture;
mod microphone;
mod playback;
mod speaker;
mod supervisor;
mod transcribe;
mod wake_word;

pub use capture::{
    AudioCaptureStream, AudioFrame, FRAME_SAMPLES, FrameAssembler, FrameSink, MicHandle,
    Microphone, Permission, SAMPLE_RATE, SampleSink, f32_to_i16, samples_to_wav,
};
pub use microphone::CpalMicrophone;
pub use playback::{
    AudioSink, EndedCallback, NullSink, PlaybackEntry, PlaybackScheduler, SynthesizedFrame,
};
pub use speaker::CpalSpeaker;
pub use supervisor::{SessionStarter, WakeWordSupervisor};
pub use transcribe::{Transcriber, WhisperTranscriber};
pub use wake_word::{
    DEFAULT_ENERGY_THRESHOLD, EnergyPhraseDetector, PhraseDetector, SegmenterState,
    SpeechSegmenter, Trigger, TriggerMatcher, rms,
};
