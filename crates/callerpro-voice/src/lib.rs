//! # CallerPro Voice - Live Voice Session Core
//!
//! Full-duplex spoken conversation with a remote conversational service:
//! microphone audio streams out, agent audio streams back in, and a running
//! transcript is assembled from both sides while agent-requested tool calls
//! are dispatched and answered on the same session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    VoiceSessionController                        │
//! │  ┌──────────────┐   chunks   ┌──────────────┐   ws   ┌────────┐  │
//! │  │   Capture    │──────────▶ │ SessionClient│◀──────▶│ Remote │  │
//! │  │ (cpal 16kHz) │            │ (state, ids) │        └────────┘  │
//! │  └──────────────┘            └──────┬───────┘                    │
//! │                    audio/interrupt  │  transcripts    tool calls │
//! │  ┌──────────────┐◀──────────────────┼──────────┐  ┌───────────┐  │
//! │  │   Playback   │                   ▼          └─▶│   Tool    │  │
//! │  │ (rodio 24kHz)│            ┌──────────────┐     │ Dispatcher│  │
//! │  └──────────────┘            │TurnAssembler │     └───────────┘  │
//! │                              └──────────────┘                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod turns;

pub use audio::{AudioChunk, AudioConfig, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
pub use capture::AudioCapturePipeline;
pub use config::{
    available_voices, voice_alias, CallSettings, ResponseModality, Scheduling, SessionConfig,
    Template, ToolDeclaration, ToolManifest, DEFAULT_LIVE_MODEL, DEFAULT_VOICE,
};
pub use controller::{format_call_duration, ControllerOptions, VoiceSessionController};
pub use error::{VoiceError, VoiceResult};
pub use playback::AudioPlaybackPipeline;
pub use protocol::{GroundingChunk, ServerEvent, WebSource};
pub use session::{SessionClient, SessionEvent, SessionId, SessionState};
pub use tools::{
    handler_fn, StaticToolHandler, ToolAuditRecord, ToolDispatcher, ToolHandler, ToolInvocation,
    ToolOutcome, ToolResult,
};
pub use transport::{Connection, Connector, LiveSocketConnector, LoopbackConnector, RemoteEnd, TransportEvent};
pub use turns::{ConversationTurn, Role, TranscriptLog, TurnAssembler, TurnInput};
