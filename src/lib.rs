//! Realtime voice client
//!
//! A reconnecting, full-duplex session with a remote conversational agent
//! over WebSocket, fed by a voice-activity-gated capture pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames  ┌──────────────┐  WAV chunks  ┌────────────────┐
//! │ CaptureDevice├─────────▸│ VoicePipeline├─────────────▸│ RealtimeClient │
//! └──────────────┘          │  (VAD)       │ speech edges │ (SessionEngine)│
//!                           └──────────────┘              └───────┬────────┘
//!                                                     EventSink ◂─┤
//!                                                                 ▾
//!                                                          WebSocket transport
//! ```

pub mod config;
pub mod error;
pub mod voice;

pub use config::{Config, ConnectionConfig};
pub use error::{Error, ErrorKind, Result};
pub use voice::{
    AgentStatus, ChannelSink, ChatMessage, EventSink, RealtimeClient, Role, UiEvent, VoiceSession,
};
