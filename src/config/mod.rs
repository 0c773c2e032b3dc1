//! Configuration management for voxlink
//!
//! Sources, lowest to highest precedence: built-in defaults, the TOML file
//! (see [`file`]), environment variables.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::session::SessionSettings;
use crate::tools::DEFAULT_TOOL_TIMEOUT;
use crate::voice::DEFAULT_ENERGY_THRESHOLD;
use crate::{Error, Result};
use file::ConfigFile;

/// Default live endpoint
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default control API port
pub const DEFAULT_PORT: u16 = 18_800;

const DEFAULT_INSTRUCTION: &str = "You are a friendly kitchen voice assistant. Keep answers \
     short and conversational. Call terminate_voice_session when the user says goodbye.";

/// voxlink configuration
#[derive(Debug, Default)]
pub struct Config {
    pub live: LiveConfig,
    pub session: SessionConfig,
    pub wake_word: WakeWordConfig,
    pub audio: AudioConfig,
    pub server: ServerConfig,
}

/// Live conversation endpoint configuration
#[derive(Debug)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// API key, sent as the `key` query parameter
    pub api_key: Option<SecretString>,

    /// Prebuilt voice name
    pub voice: String,

    /// System instruction; caller context is appended to it
    pub base_instruction: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            api_key: None,
            voice: "Puck".to_string(),
            base_instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }
}

/// Session timing and retry configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time spent in `Error` before the automatic stop
    pub auto_stop_delay: Duration,

    /// Delay between releasing the microphone and re-arming the wake word
    pub rearm_cooldown: Duration,

    pub mic_retry_attempts: u32,
    pub mic_retry_backoff: Duration,

    /// Upper bound on a single tool call
    pub tool_timeout: Duration,

    /// Wait for the remote setup acknowledgment
    pub open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_stop_delay: Duration::from_secs(3),
            rearm_cooldown: Duration::from_millis(1500),
            mic_retry_attempts: 3,
            mic_retry_backoff: Duration::from_millis(500),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            open_timeout: Duration::from_secs(15),
        }
    }
}

/// Wake word configuration
#[derive(Debug)]
pub struct WakeWordConfig {
    pub enabled: bool,

    /// Standard activation phrases
    pub phrases: Vec<String>,

    /// Reserved phrase and the only reply it may get
    pub secret_phrase: Option<String>,
    pub secret_reply: String,

    /// Pause between detector lifetimes
    pub restart_delay: Duration,

    /// Lifetime of one detector run
    pub listen_window: Duration,

    pub energy_threshold: f32,

    /// OpenAI-compatible transcription endpoint
    pub transcription_url: String,
    pub transcription_model: String,

    /// Key for the transcription endpoint
    pub transcription_api_key: Option<SecretString>,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: vec!["hey chef".to_string(), "okay chef".to_string()],
            secret_phrase: None,
            secret_reply: "You found the secret. Happy cooking!".to_string(),
            restart_delay: Duration::from_millis(750),
            listen_window: Duration::from_secs(30),
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
            transcription_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            transcription_api_key: None,
        }
    }
}

/// Audio device configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Play synthesized speech on the default output device
    pub output_enabled: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_enabled: true,
        }
    }
}

/// Control API configuration
#[derive(Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Bearer key required by the control API; open when unset
    pub api_key: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            api_key: None,
        }
    }
}

/// Parse an optional env value, naming the variable on failure
fn parse_env<T: FromStr>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}")))
        })
        .transpose()
}

fn parse_bool(name: &str, value: Option<String>) -> Result<Option<bool>> {
    value
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("invalid {name}={raw}: expected a boolean"))),
        })
        .transpose()
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |name| std::env::var(name).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let live = LiveConfig {
            endpoint: env("VOXLINK_LIVE_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or(defaults.live.endpoint),
            model: env("VOXLINK_LIVE_MODEL")
                .or(fc.live.model)
                .unwrap_or(defaults.live.model),
            api_key: secret(
                env("GEMINI_API_KEY")
                    .or_else(|| env("VOXLINK_LIVE_API_KEY"))
                    .or(fc.live.api_key),
            ),
            voice: env("VOXLINK_VOICE")
                .or(fc.live.voice)
                .unwrap_or(defaults.live.voice),
            base_instruction: env("VOXLINK_BASE_INSTRUCTION")
                .or(fc.live.base_instruction)
                .unwrap_or(defaults.live.base_instruction),
        };

        let session = SessionConfig {
            auto_stop_delay: millis(
                parse_env("VOXLINK_AUTO_STOP_DELAY_MS", env("VOXLINK_AUTO_STOP_DELAY_MS"))?
                    .or(fc.session.auto_stop_delay_ms),
                defaults.session.auto_stop_delay,
            ),
            rearm_cooldown: millis(
                parse_env("VOXLINK_REARM_COOLDOWN_MS", env("VOXLINK_REARM_COOLDOWN_MS"))?
                    .or(fc.session.rearm_cooldown_ms),
                defaults.session.rearm_cooldown,
            ),
            mic_retry_attempts: parse_env(
                "VOXLINK_MIC_RETRY_ATTEMPTS",
                env("VOXLINK_MIC_RETRY_ATTEMPTS"),
            )?
            .or(fc.session.mic_retry_attempts)
            .unwrap_or(defaults.session.mic_retry_attempts)
            .max(1),
            mic_retry_backoff: millis(
                fc.session.mic_retry_backoff_ms,
                defaults.session.mic_retry_backoff,
            ),
            tool_timeout: millis(
                parse_env("VOXLINK_TOOL_TIMEOUT_MS", env("VOXLINK_TOOL_TIMEOUT_MS"))?
                    .or(fc.session.tool_timeout_ms),
                defaults.session.tool_timeout,
            ),
            open_timeout: millis(fc.session.open_timeout_ms, defaults.session.open_timeout),
        };

        let phrases = env("VOXLINK_WAKE_WORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .or(fc.wake_word.phrases)
            .unwrap_or(defaults.wake_word.phrases);

        let wake_word = WakeWordConfig {
            enabled: parse_bool("VOXLINK_WAKE_WORD_ENABLED", env("VOXLINK_WAKE_WORD_ENABLED"))?
                .or(fc.wake_word.enabled)
                .unwrap_or(defaults.wake_word.enabled),
            phrases,
            secret_phrase: env("VOXLINK_SECRET_PHRASE")
                .or(fc.wake_word.secret_phrase)
                .filter(|p| !p.trim().is_empty()),
            secret_reply: fc
                .wake_word
                .secret_reply
                .unwrap_or(defaults.wake_word.secret_reply),
            restart_delay: millis(
                fc.wake_word.restart_delay_ms,
                defaults.wake_word.restart_delay,
            ),
            listen_window: millis(
                fc.wake_word.listen_window_ms,
                defaults.wake_word.listen_window,
            ),
            energy_threshold: fc
                .wake_word
                .energy_threshold
                .unwrap_or(defaults.wake_word.energy_threshold),
            transcription_url: env("VOXLINK_TRANSCRIPTION_URL")
                .or(fc.wake_word.transcription_url)
                .unwrap_or(defaults.wake_word.transcription_url),
            transcription_model: fc
                .wake_word
                .transcription_model
                .unwrap_or(defaults.wake_word.transcription_model),
            transcription_api_key: secret(env("OPENAI_API_KEY")),
        };

        let audio = AudioConfig {
            output_enabled: parse_bool("VOXLINK_AUDIO_OUTPUT", env("VOXLINK_AUDIO_OUTPUT"))?
                .or(fc.audio.output_enabled)
                .unwrap_or(defaults.audio.output_enabled),
        };

        let server = ServerConfig {
            host: env("VOXLINK_API_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: parse_env("VOXLINK_API_PORT", env("VOXLINK_API_PORT").or_else(|| env("PORT")))?
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            api_key: secret(env("VOXLINK_API_KEY").or(fc.server.api_key)),
        };

        Ok(Self {
            live,
            session,
            wake_word,
            audio,
            server,
        })
    }

    /// Settings handed to the session controller
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            voice: self.live.voice.clone(),
            base_instruction: self.live.base_instruction.clone(),
            auto_stop_delay: self.session.auto_stop_delay,
            mic_retry_attempts: self.session.mic_retry_attempts,
            mic_retry_backoff: self.session.mic_retry_backoff,
            tool_timeout: self.session.tool_timeout,
            open_timeout: self.session.open_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(ConfigFile::default(), env_of(&[])).unwrap();
        assert_eq!(config.live.endpoint, DEFAULT_LIVE_ENDPOINT);
        assert!(config.live.api_key.is_none());
        assert_eq!(config.session.mic_retry_attempts, 3);
        assert_eq!(config.session.tool_timeout, DEFAULT_TOOL_TIMEOUT);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.wake_word.enabled);
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = ConfigFile::default();
        fc.live.voice = Some("Kore".to_string());
        fc.server.port = Some(9000);
        fc.wake_word.phrases = Some(vec!["hey file".to_string()]);

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("VOXLINK_API_PORT", "9100"),
                ("GEMINI_API_KEY", "g-key"),
                ("VOXLINK_WAKE_WORDS", "hey env, ok env ,"),
                ("VOXLINK_WAKE_WORD_ENABLED", "off"),
            ]),
        )
        .unwrap();

        assert_eq!(config.live.voice, "Kore");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.live.api_key.unwrap().expose_secret(), "g-key");
        assert_eq!(config.wake_word.phrases, vec!["hey env", "ok env"]);
        assert!(!config.wake_word.enabled);
    }

    #[test]
    fn invalid_env_value_is_an_error() {
        let err = Config::from_sources(
            ConfigFile::default(),
            env_of(&[("VOXLINK_TOOL_TIMEOUT_MS", "soon")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("VOXLINK_TOOL_TIMEOUT_MS")));
    }

    #[test]
    fn session_settings_follow_config() {
        let mut fc = ConfigFile::default();
        fc.session.tool_timeout_ms = Some(2500);
        fc.live.base_instruction = Some("Be brief.".to_string());

        let settings = Config::from_sources(fc, env_of(&[]))
            .unwrap()
            .session_settings();
        assert_eq!(settings.tool_timeout, Duration::from_millis(2500));
        assert_eq!(settings.base_instruction, "Be brief.");
    }
}
