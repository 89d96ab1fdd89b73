//! Live conversation protocol types
//!
//! JSON messages exchanged with the bidirectional generate-content endpoint
//! over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `LIVE_API_URL?key=<credential>`
//! 2. Send `setup` (model, voice, persona, transcription for both directions)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent`: inline audio, transcripts, `interrupted`,
//!    `turnComplete`

use serde::{Deserialize, Serialize};

use super::InboundContent;

/// Live conversation WebSocket endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Output modality requested from the agent
const RESPONSE_MODALITY_AUDIO: &str = "AUDIO";

// ============================================================================
// Client Messages (sent TO the agent)
// ============================================================================

/// Session setup sent as the first message after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Model resource name, e.g. `models/<name>`
    pub model: String,

    pub generation_config: GenerationConfig,

    /// Persona / system instructions
    pub system_instruction: Content,

    /// Presence enables speech-to-text of the learner's audio
    pub input_audio_transcription: AudioTranscriptionConfig,

    /// Presence enables speech-to-text of the agent's audio
    pub output_audio_transcription: AudioTranscriptionConfig,
}

impl SetupConfig {
    /// Build a setup for spoken replies with live transcription both ways
    pub fn new(model: &str, voice: &str, instructions: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![RESPONSE_MODALITY_AUDIO.to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content::text(instructions),
            input_audio_transcription: AudioTranscriptionConfig {},
            output_audio_transcription: AudioTranscriptionConfig {},
        }
    }

    /// First required field left blank, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.model.trim_start_matches("models/").trim().is_empty() {
            return Some("model");
        }
        let voice = &self
            .generation_config
            .speech_config
            .voice_config
            .prebuilt_voice_config
            .voice_name;
        if voice.trim().is_empty() {
            return Some("voice");
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Empty object; its presence switches transcription on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioTranscriptionConfig {}

/// Multi-part content (system instructions, model turns)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 payload with its MIME descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Streamed microphone input
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Messages sent from client to the agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Open request, must be the first message
    Setup(SetupConfig),

    /// Audio from the microphone
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Create an audio message from an already-encoded PCM payload
    pub fn audio(payload: String, mime_type: &str) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: mime_type.to_string(),
                data: payload,
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the agent)
// ============================================================================

/// A server message; exactly one field is normally present
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Extract error info if this is an error message
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Flatten server content into what the session controller consumes
    pub fn into_inbound(self) -> Option<InboundContent> {
        let content = self.server_content?;

        let audio = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .filter(|blob| blob.mime_type.starts_with("audio/"))
                    .map(|blob| blob.data)
                    .collect()
            })
            .unwrap_or_default();

        Some(InboundContent {
            audio,
            interrupted: content.interrupted,
            input_text: content.input_transcription.and_then(|t| t.text),
            output_text: content.output_transcription.and_then(|t| t.text),
            turn_complete: content.turn_complete,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub input_transcription: Option<Transcription>,

    #[serde(default)]
    pub output_transcription: Option<Transcription>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub generation_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

/// Server is about to drop the connection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Error information from the agent
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: Option<String>,
}
