//! Session data model: lifecycle states, the active session and live transcripts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; wake word may be armed
    #[default]
    Idle,
    /// Microphone and channel are being acquired
    Connecting,
    /// Channel open, streaming microphone audio
    Listening,
    /// Synthesized speech is scheduled for playback
    Speaking,
    /// A failure was recorded; the session drains back to idle
    Error,
}

impl SessionState {
    /// Whether inbound channel events are processed in this state
    #[must_use]
    pub const fn accepts_channel_events(self) -> bool {
        matches!(self, Self::Connecting | Self::Listening | Self::Speaking)
    }

    /// Whether captured audio is forwarded in this state
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// The single live session owned by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Unique session identifier
    pub id: Uuid,
    /// Current lifecycle state
    pub state: SessionState,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Last user-visible failure, if any
    pub last_error: Option<String>,
}

impl Session {
    /// Create a session in the connecting state
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            started_at: Utc::now(),
            last_error: None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Who produced a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// A piece of live transcription from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// A finalized line of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Live transcript accumulators for the current turn plus the finished log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptBuffers {
    /// Latest user transcription (partials overwrite)
    pub user: String,
    /// Agent transcription for the current turn (fragments append)
    pub agent: String,
    /// Completed turns
    pub log: Vec<TranscriptLine>,
}

impl TranscriptBuffers {
    /// Apply a fragment: user text replaces the partial, agent text appends
    pub fn apply(&mut self, fragment: TranscriptFragment) {
        match fragment.speaker {
            Speaker::User => self.user = fragment.text,
            Speaker::Agent => self.agent.push_str(&fragment.text),
        }

        if fragment.is_final {
            self.finish_speaker(fragment.speaker);
        }
    }

    /// Move both live buffers into the log
    pub fn complete_turn(&mut self) {
        self.finish_speaker(Speaker::User);
        self.finish_speaker(Speaker::Agent);
    }

    fn finish_speaker(&mut self, speaker: Speaker) {
        let buffer = match speaker {
            Speaker::User => &mut self.user,
            Speaker::Agent => &mut self.agent,
        };
        let text = std::mem::take(buffer);
        let text = text.trim();
        if !text.is_empty() {
            self.log.push(TranscriptLine {
                speaker,
                text: text.to_string(),
                at: Utc::now(),
            });
        }
    }
}

/// Observable view of the controller, published on every transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Option<Session>,
    /// Last failure, kept after the session drains to idle
    pub last_error: Option<String>,
    /// Set when the agent handed the conversation off to another surface
    pub handoff_requested: bool,
    /// A start request is in flight, possibly still waiting on permission
    pub starting: bool,
    pub transcript: TranscriptBuffers,
}

impl SessionSnapshot {
    /// Whether a session exists or is being started
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.starting || self.session.is_some()
    }
}
