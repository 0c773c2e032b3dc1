//! TOML configuration file loading
//!
//! Supports `~/.config/voxlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Live conversation endpoint
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Session timing and retries
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Passive wake word detection
    #[serde(default)]
    pub wake_word: WakeWordFileConfig,

    /// Audio devices
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Control API server
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Live conversation configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint (`wss://...`)
    pub endpoint: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// API key (prefer the `GEMINI_API_KEY` env var)
    pub api_key: Option<String>,

    /// Prebuilt voice name (e.g. "Puck")
    pub voice: Option<String>,

    /// System instruction sent with every session
    pub base_instruction: Option<String>,
}

/// Session timing configuration (milliseconds)
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub auto_stop_delay_ms: Option<u64>,
    pub rearm_cooldown_ms: Option<u64>,
    pub mic_retry_attempts: Option<u32>,
    pub mic_retry_backoff_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub open_timeout_ms: Option<u64>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    pub enabled: Option<bool>,

    /// Standard activation phrases (e.g. ["hey chef"])
    pub phrases: Option<Vec<String>>,

    /// Reserved phrase answered with `secret_reply`
    pub secret_phrase: Option<String>,
    pub secret_reply: Option<String>,

    pub restart_delay_ms: Option<u64>,

    /// Lifetime of one detector run before it restarts
    pub listen_window_ms: Option<u64>,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: Option<f32>,

    /// OpenAI-compatible transcription base URL
    pub transcription_url: Option<String>,
    pub transcription_model: Option<String>,
}

/// Audio device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Play synthesized speech on the default output device
    pub output_enabled: Option<bool>,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Control API port
    pub port: Option<u16>,

    /// Bind address
    pub host: Option<String>,

    /// Bearer key for the control API
    pub api_key: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> ConfigFile {
    config_file_path().map_or_else(ConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
#[must_use]
pub fn load_config_file_from(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voxlink/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxlink").join("config.toml"))
}
