//! Wire messages of the live speech API
//!
//! Client messages are externally tagged JSON objects (`{"setup": ...}`,
//! `{"realtimeInput": ...}`). Server messages carry optional sections that
//! are flattened into a list of [`ServerEvent`]s in a fixed order: handshake,
//! audio, transcripts, interruption, turn completion, go-away.

use crate::integration::config::SessionConfig;
use crate::messages::Role;
use crate::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Empty object enabling server-side transcription
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    /// Build the opening message for `config`
    pub fn setup(config: &SessionConfig, transcripts: bool) -> Self {
        let system_instruction = if config.persona_instructions.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: config.persona_instructions.clone(),
                }],
            })
        };

        ClientMessage::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: transcripts.then(TranscriptionConfig::default),
            output_audio_transcription: transcripts.then(TranscriptionConfig::default),
        })
    }

    /// Wrap one base64 PCM16 mono frame captured at `sample_rate`
    pub fn audio(data: String, sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: format!("audio/pcm;rate={}", sample_rate),
                data,
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ParleyError::Protocol(format!("Failed to encode message: {}", e)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Everything the session can learn from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The open handshake finished, audio may flow
    SetupComplete,

    /// Base64 PCM16 audio at `sample_rate`
    AudioChunk { data: String, sample_rate: u32 },

    /// The server discarded its in-flight turn
    Interrupted,

    TurnComplete,

    Transcript { role: Role, text: String },

    /// The server will close the connection soon
    GoAway { time_left: Option<String> },

    /// The connection ended
    Closed { reason: Option<String> },

    /// Transport or protocol fault ending the session
    Fault(String),
}

impl ServerEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Closed { .. } | ServerEvent::Fault(_))
    }
}

/// Extract `rate=` from a mime type such as `audio/pcm;rate=24000`
pub fn rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Parse one server message into events.
///
/// Audio without an explicit rate is assumed to be at `default_rate`.
pub fn parse_server_message(text: &str, default_rate: u32) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| ParleyError::Protocol(format!("Malformed server message: {}", e)))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|part| part.inline_data) {
            let mime = inline.mime_type.unwrap_or_default();
            if !mime.is_empty() && !mime.starts_with("audio/") {
                debug!("Ignoring non-audio inline data: {}", mime);
                continue;
            }
            events.push(ServerEvent::AudioChunk {
                data: inline.data,
                sample_rate: rate_from_mime(&mime).unwrap_or(default_rate),
            });
        }

        let transcripts = [
            (Role::User, content.input_transcription),
            (Role::Model, content.output_transcription),
        ];
        for (role, transcription) in transcripts {
            if let Some(text) = transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::Transcript { role, text });
                }
            }
        }

        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_setup_matches_wire_contract() {
        let config = SessionConfig::with_persona("Be brief.").with_voice("Puck");
        let json: Value =
            serde_json::from_str(&ClientMessage::setup(&config, false).to_json().unwrap())
                .unwrap();

        assert_eq!(
            json,
            json!({
                "setup": {
                    "model": config.model,
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Puck"}}
                        }
                    },
                    "systemInstruction": {"parts": [{"text": "Be brief."}]}
                }
            })
        );
    }

    #[test]
    fn test_setup_requests_transcripts() {
        let config = SessionConfig::default();
        let json: Value =
            serde_json::from_str(&ClientMessage::setup(&config, true).to_json().unwrap())
                .unwrap();
        assert_eq!(json["setup"]["inputAudioTranscription"], json!({}));
        assert_eq!(json["setup"]["outputAudioTranscription"], json!({}));
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_audio_frame_shape() {
        let json: Value = serde_json::from_str(
            &ClientMessage::audio("AAAA".into(), 16000).to_json().unwrap(),
        )
        .unwrap();
        assert_eq!(
            json,
            json!({"realtimeInput": {"mediaChunks": [
                {"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}
            ]}})
        );
    }

    #[test]
    fn test_parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#, 24000).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn test_parse_audio_parts_in_order() {
        let text = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
            {"inlineData": {"mimeType": "audio/pcm", "data": "BBBB"}},
            {"inlineData": {"mimeType": "audio/pcm;rate=16000", "data": "CCCC"}}
        ]}}})
        .to_string();

        let events = parse_server_message(&text, 24000).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::AudioChunk { data: "AAAA".into(), sample_rate: 24000 },
                ServerEvent::AudioChunk { data: "BBBB".into(), sample_rate: 24000 },
                ServerEvent::AudioChunk { data: "CCCC".into(), sample_rate: 16000 },
            ]
        );
    }

    #[test]
    fn test_parse_interruption_flag() {
        let events =
            parse_server_message(r#"{"serverContent": {"interrupted": true}}"#, 24000).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);

        let events =
            parse_server_message(r#"{"serverContent": {"interrupted": false}}"#, 24000).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_parse_transcripts_and_turn_complete() {
        let text = json!({"serverContent": {
            "inputTranscription": {"text": "hi there"},
            "outputTranscription": {"text": "hello"},
            "turnComplete": true
        }})
        .to_string();

        let events = parse_server_message(&text, 24000).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::Transcript { role: Role::User, text: "hi there".into() },
                ServerEvent::Transcript { role: Role::Model, text: "hello".into() },
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_parse_go_away() {
        let events = parse_server_message(r#"{"goAway": {"timeLeft": "10s"}}"#, 24000).unwrap();
        assert_eq!(
            events,
            vec![ServerEvent::GoAway { time_left: Some("10s".into()) }]
        );
    }

    #[test]
    fn test_unknown_sections_are_ignored() {
        let events = parse_server_message(r#"{"usageMetadata": {"totalTokenCount": 5}}"#, 24000)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_message_is_protocol_error() {
        let err = parse_server_message("{not json", 24000).unwrap_err();
        assert!(matches!(err, ParleyError::Protocol(_)));
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(rate_from_mime("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(rate_from_mime("audio/pcm"), None);
        assert_eq!(rate_from_mime("audio/pcm;rate=abc"), None);
    }
}
