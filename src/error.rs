//! Error types for the voxlink session engine

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the session engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone permission was not granted
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Microphone is held by another process or consumer
    #[error("microphone busy: {0}")]
    DeviceBusy(String),

    /// Conversation channel could not be opened
    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    /// Conversation channel failed after opening
    #[error("channel error: {0}")]
    ChannelRuntime(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Speech-to-text error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Operation was cancelled by a stop request
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Session controller task is no longer running
    #[error("session controller is not running")]
    ControllerGone,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Short machine-readable code, used by the control API
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Toml(_) => "config",
            Self::Audio(_) => "audio",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceBusy(_) => "device_busy",
            Self::ChannelOpen(_) => "channel_open_failure",
            Self::ChannelRuntime(_) | Self::WebSocket(_) => "channel_runtime_error",
            Self::Tool(_) => "tool_execution_failure",
            Self::WakeWord(_) => "wake_word",
            Self::Transcription(_) => "transcription",
            Self::Cancelled(_) => "cancelled",
            Self::ControllerGone => "controller_gone",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Serialization(_) => "serialization",
        }
    }
}
