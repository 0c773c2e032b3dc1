//! Wire format of the live conversation protocol
//!
//! Client messages are single-key JSON objects (`setup`, `realtimeInput`,
//! `toolResponse`). Server messages carry any of `setupComplete`, `serverContent`,
//! `toolCall`, `toolCallCancellation` or `goAway`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::ChannelEvent;
use crate::session::{Speaker, TranscriptFragment};
use crate::tools::ToolInvocation;

/// MIME type of outbound microphone audio
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Sample rate of inbound synthesized audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Response modality requested from the remote agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Which sides of the conversation the remote transcribes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptionConfig {
    pub input: bool,
    pub output: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
        }
    }
}

/// A tool the remote agent may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Session open configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub response_modality: ResponseModality,
    pub voice: String,
    pub system_instruction: String,
    pub tools: Vec<FunctionDeclaration>,
    pub transcription: TranscriptionConfig,
}

impl LiveSetup {
    /// Build the setup for one session: the caller context is appended verbatim
    #[must_use]
    pub fn new(
        voice: &str,
        base_instruction: &str,
        context: Option<&str>,
        tools: Vec<FunctionDeclaration>,
    ) -> Self {
        let system_instruction = match context {
            Some(extra) if !extra.is_empty() => format!("{base_instruction}\n\n{extra}"),
            _ => base_instruction.to_string(),
        };

        Self {
            response_modality: ResponseModality::Audio,
            voice: voice.to_string(),
            system_instruction,
            tools,
            transcription: TranscriptionConfig::default(),
        }
    }
}

/// Message sent to the remote agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

/// Opening handshake
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Enabled>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Enabled>,
}

impl SetupMessage {
    /// Translate a session setup into the wire handshake for `model`
    #[must_use]
    pub fn new(model: &str, setup: &LiveSetup) -> Self {
        let tools = if setup.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: setup.tools.clone(),
            }]
        };

        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![setup.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            tools,
            input_audio_transcription: setup.transcription.input.then_some(Enabled {}),
            output_audio_transcription: setup.transcription.output.then_some(Enabled {}),
        }
    }
}

/// Marker object serialized as `{}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enabled {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// One encoded capture window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    /// Base64 PCM16 little-endian mono
    pub data: String,
    pub mime_type: String,
}

impl MediaChunk {
    /// Encode 16-bit samples as a 16 kHz PCM chunk
    #[must_use]
    pub fn from_samples(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            data: BASE64.encode(bytes),
            mime_type: INPUT_MIME_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Result of one tool invocation, correlated by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: ToolResultBody,
}

impl FunctionResponse {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            response: ToolResultBody {
                result: result.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResultBody {
    pub result: String,
}

/// Message received from the remote agent
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
    pub tool_call_cancellation: Option<serde_json::Value>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPart {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: Option<String>,
    pub finished: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCall {
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ServerMessage {
    /// Parse a raw server frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not valid JSON for this protocol
    pub fn parse(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Split the message into engine events, in processing order
    #[must_use]
    pub fn into_events(self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ChannelEvent::Open);
        }

        if let Some(call) = self.tool_call {
            let batch: Vec<ToolInvocation> = call
                .function_calls
                .into_iter()
                .map(|c| ToolInvocation {
                    id: c.id,
                    name: c.name,
                    args: c.args,
                })
                .collect();
            if !batch.is_empty() {
                events.push(ChannelEvent::ToolCall(batch));
            }
        }

        if let Some(content) = self.server_content {
            push_transcript(&mut events, Speaker::User, content.input_transcription);
            push_transcript(&mut events, Speaker::Agent, content.output_transcription);

            let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
            for part in parts {
                let Some(inline) = part.inline_data else {
                    continue;
                };
                match BASE64.decode(inline.data.as_bytes()) {
                    Ok(pcm) if !pcm.is_empty() => events.push(ChannelEvent::Audio(pcm)),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable audio part"),
                }
            }

            if content.interrupted == Some(true) {
                events.push(ChannelEvent::Interrupted);
            }
            if content.turn_complete == Some(true) {
                events.push(ChannelEvent::TurnComplete);
            }
        }

        if self.go_away.is_some() {
            tracing::info!("remote announced it will close the channel");
        }

        events
    }
}

fn push_transcript(events: &mut Vec<ChannelEvent>, speaker: Speaker, t: Option<Transcription>) {
    let Some(t) = t else { return };
    let text = t.text.unwrap_or_default();
    let is_final = t.finished.unwrap_or(false);
    if text.is_empty() && !is_final {
        return;
    }
    events.push(ChannelEvent::Transcript(TranscriptFragment {
        speaker,
        text,
        is_final,
    }));
}
