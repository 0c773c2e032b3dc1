//! Speech-to-text for wake word verification

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Response from an OpenAI-compatible transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Turns a short WAV clip into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

/// Whisper over the OpenAI-compatible `/audio/transcriptions` endpoint
pub struct WhisperTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl WhisperTranscriber {
    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for wake word transcription".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_owned()),
            model: model.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Transcription(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: TranscriptionResponse = response.json().await?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
