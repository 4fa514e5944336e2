//! JSON messages exchanged with the Gemini Live `BidiGenerateContent`
//! endpoint.

use crate::codec::{decode_payload, encode_payload, EncodedChunk};
use crate::error::VoiceResult;
use crate::transport::ServerEvent;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<Blob>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

/// The first message on a new connection: model, audio-only responses and
/// the prebuilt voice.
pub fn setup_message(model: &str, voice: &str) -> VoiceResult<String> {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    };
    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice },
                    },
                },
            },
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Wrap one encoded microphone chunk as realtime input.
pub fn realtime_input_message(chunk: &EncodedChunk) -> VoiceResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: chunk.mime.to_string(),
                data: encode_payload(&chunk.bytes),
            }],
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Translate one server message into session events, in the order the
/// session must see them: opened, audio, interruption, turn end, error.
///
/// Audio parts whose payload is not valid base64 are logged and skipped.
pub fn parse_server_message(text: &str) -> VoiceResult<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::Opened);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for part in parts {
            if let Some(text) = part.text {
                debug!("Model text: {}", text);
            }
            let Some(blob) = part.inline_data else {
                continue;
            };
            if !blob.mime_type.to_ascii_lowercase().starts_with("audio/") {
                debug!("Ignoring inline {} data", blob.mime_type);
                continue;
            }
            match decode_payload(&blob.data) {
                Ok(bytes) => events.push(ServerEvent::AudioChunk {
                    bytes,
                    mime: blob.mime_type,
                }),
                Err(e) => warn!("Dropping audio part: {}", e),
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
        warn!(
            "Server is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }

    if let Some(error) = message.error {
        let text = error.message.unwrap_or_else(|| "unspecified server error".to_string());
        events.push(ServerEvent::Error(match error.code {
            Some(code) => format!("{} ({})", text, code),
            None => text,
        }));
    }

    Ok(events)
}
