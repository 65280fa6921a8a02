//! Message shapes of the live service's bidirectional stream
//!
//! Outbound: `setup`, `realtimeInput`, `toolResponse`.
//! Inbound: `setupComplete`, `serverContent`, `toolCall`,
//! `toolCallCancellation`, `goAway`. Anything else is ignored.

use crate::audio::{AudioChunk, OUTPUT_SAMPLE_RATE};
use crate::config::{ResponseModality, SessionConfig, ToolDeclaration};
use crate::error::{VoiceError, VoiceResult};
use crate::tools::{ToolInvocation, ToolResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A web source the agent grounded its answer on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One decoded inbound message may yield several of these, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Audio(AudioChunk),
    Content {
        text: String,
        grounding_chunks: Vec<GroundingChunk>,
    },
    InputTranscription {
        text: String,
        is_final: bool,
    },
    OutputTranscription {
        text: String,
        is_final: bool,
    },
    ToolCall(Vec<ToolInvocation>),
    ToolCallCancellation(Vec<String>),
    Interrupted,
    TurnComplete,
    GoAway {
        time_left: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<InstructionContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSet<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<TranscriptionToggle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<TranscriptionToggle>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [ResponseModality; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct InstructionContent<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet<'a> {
    function_declarations: Vec<FunctionDeclaration<'a>>,
}

#[derive(Serialize)]
struct FunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a Value>,
}

impl<'a> From<&'a ToolDeclaration> for FunctionDeclaration<'a> {
    fn from(tool: &'a ToolDeclaration) -> Self {
        Self {
            name: &tool.name,
            description: &tool.description,
            parameters: tool.parameters.as_ref(),
        }
    }
}

/// Serializes as `{}`.
#[derive(Serialize)]
struct TranscriptionToggle {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
struct RealtimeInput {
    audio: Blob,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseMessage<'a> {
    tool_response: ToolResponse<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse<'a> {
    function_responses: &'a [ToolResult],
}

/// First message on a new connection.
pub fn encode_setup(config: &SessionConfig) -> VoiceResult<String> {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let tools = if config.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolSet {
            function_declarations: config.tools.iter().map(FunctionDeclaration::from).collect(),
        }]
    };

    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: [config.modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &config.voice,
                        },
                    },
                },
            },
            system_instruction: (!config.system_instruction.is_empty()).then(|| InstructionContent {
                parts: [TextPart {
                    text: &config.system_instruction,
                }],
            }),
            tools,
            input_audio_transcription: config.input_transcription.then_some(TranscriptionToggle {}),
            output_audio_transcription: config.output_transcription.then_some(TranscriptionToggle {}),
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Microphone audio as base64 little-endian PCM.
pub fn encode_audio(chunk: &AudioChunk) -> VoiceResult<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            audio: Blob {
                mime_type: format!("audio/pcm;rate={}", chunk.sample_rate),
                data: B64.encode(chunk.to_le_bytes()),
            },
        },
    };
    Ok(serde_json::to_string(&message)?)
}

pub fn encode_tool_response(results: &[ToolResult]) -> VoiceResult<String> {
    let message = ToolResponseMessage {
        tool_response: ToolResponse {
            function_responses: results,
        },
    };
    Ok(serde_json::to_string(&message)?)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCallPayload>,
    #[serde(default)]
    tool_call_cancellation: Option<ToolCallCancellationPayload>,
    #[serde(default)]
    go_away: Option<GoAwayPayload>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
    #[serde(default)]
    input_transcription: Option<TranscriptionPayload>,
    #[serde(default)]
    output_transcription: Option<TranscriptionPayload>,
}

#[derive(Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<Blob>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Default)]
struct TranscriptionPayload {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finished: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default)]
    function_calls: Vec<ToolInvocation>,
}

#[derive(Deserialize)]
struct ToolCallCancellationPayload {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayPayload {
    #[serde(default)]
    time_left: Option<String>,
}

/// Sample rate from a mime type such as `audio/pcm;rate=24000`.
fn sample_rate_of(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(OUTPUT_SAMPLE_RATE)
}

/// Decode one inbound frame (text or binary, both carry JSON).
pub fn decode(frame: &[u8]) -> VoiceResult<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_slice(frame)
        .map_err(|e| VoiceError::Protocol(format!("undecodable server message: {}", e)))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        decode_server_content(content, &mut events)?;
    }

    if let Some(call) = message.tool_call {
        events.push(ServerEvent::ToolCall(call.function_calls));
    }

    if let Some(cancellation) = message.tool_call_cancellation {
        events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
    }

    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    Ok(events)
}

fn decode_server_content(content: ServerContent, events: &mut Vec<ServerEvent>) -> VoiceResult<()> {
    // An interruption supersedes whatever else rode along in the same message.
    if content.interrupted {
        events.push(ServerEvent::Interrupted);
        return Ok(());
    }

    if let Some(t) = content.input_transcription {
        events.push(ServerEvent::InputTranscription {
            text: t.text,
            is_final: t.finished,
        });
    }

    if let Some(t) = content.output_transcription {
        events.push(ServerEvent::OutputTranscription {
            text: t.text,
            is_final: t.finished,
        });
    }

    let grounding_chunks = content
        .grounding_metadata
        .map(|g| g.grounding_chunks)
        .unwrap_or_default();

    let mut texts = Vec::new();
    for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
        match part.inline_data {
            Some(blob) if blob.mime_type.starts_with("audio/pcm") => {
                let bytes = B64
                    .decode(blob.data.as_bytes())
                    .map_err(|e| VoiceError::Protocol(format!("invalid audio payload: {}", e)))?;
                let chunk = AudioChunk::from_le_bytes(&bytes, sample_rate_of(&blob.mime_type))?;
                events.push(ServerEvent::Audio(chunk));
            }
            _ => {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    texts.push(text);
                }
            }
        }
    }

    if !texts.is_empty() || !grounding_chunks.is_empty() {
        events.push(ServerEvent::Content {
            text: texts.join(" "),
            grounding_chunks,
        });
    }

    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }

    Ok(())
}
