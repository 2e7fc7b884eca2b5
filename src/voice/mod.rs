//! Realtime voice conversation core.
//!
//! A long-lived, reconnecting, full-duplex session with a remote
//! conversational agent, fed by a voice-activity-gated microphone pipeline.
//!
//! ## Design
//! - Pure engines (`session::SessionEngine`, `vad::VoiceActivityDetector`) that
//!   take inputs and return effects, so every transition is testable without IO
//! - Single dispatch task per client (`client::RealtimeClient`) owning the
//!   transport, the timers, and the engine
//! - Tagged protocol enums decoded through one `type` discriminator
//! - Typed event sinks injected at construction (`EventSink`)

pub mod capture;
pub mod client;
pub mod codec;
pub mod energy;
pub mod protocol;
pub mod session;
pub mod shim;
pub mod timer;
pub mod transport;
pub mod vad;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorKind;

// ── Shared UI-facing types ───────────────────────────────────────

/// Speaker of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// What the remote agent is doing, as shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Speaking,
    Error,
}

/// A finalized message ready for the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    /// Conversation item id, when the remote assigned one.
    pub item_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>, item_id: Option<String>) -> Self {
        Self {
            role,
            text: text.into(),
            item_id,
        }
    }
}

/// Provider-agnostic event produced by the core for the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A complete user or assistant message.
    Message(ChatMessage),
    /// Agent status transition.
    Status(AgentStatus),
    /// Connection state transition.
    Connection(ConnectionState),
    /// Speech activity started (`true`) or stopped (`false`).
    SpeechActivity(bool),
    /// The remote assigned a session id.
    SessionReady { session_id: String },
    /// Decoded agent audio (PCM as delivered by the remote).
    Audio(Vec<u8>),
    /// A user-visible error.
    Error { kind: ErrorKind, message: String },
}

// ── Event sink ───────────────────────────────────────────────────

/// Typed callback surface consumed by the UI collaborator.
///
/// Injected at construction; all callbacks run on the client's dispatch
/// task and must not block.
pub trait EventSink: Send + Sync {
    fn on_message(&self, message: &ChatMessage);
    fn on_status_change(&self, status: AgentStatus);
    fn on_connection_change(&self, state: ConnectionState);
    fn on_speech_activity(&self, active: bool);

    fn on_session_ready(&self, _session_id: &str) {}
    fn on_audio(&self, _pcm: &[u8]) {}
    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}

impl UiEvent {
    /// Route this event to the matching sink callback.
    pub fn deliver(&self, sink: &dyn EventSink) {
        match self {
            Self::Message(message) => sink.on_message(message),
            Self::Status(status) => sink.on_status_change(*status),
            Self::Connection(state) => sink.on_connection_change(*state),
            Self::SpeechActivity(active) => sink.on_speech_activity(*active),
            Self::SessionReady { session_id } => sink.on_session_ready(session_id),
            Self::Audio(pcm) => sink.on_audio(pcm),
            Self::Error { kind, message } => sink.on_error(*kind, message),
        }
    }
}

/// Sink that forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, event: UiEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_message(&self, message: &ChatMessage) {
        self.push(UiEvent::Message(message.clone()));
    }

    fn on_status_change(&self, status: AgentStatus) {
        self.push(UiEvent::Status(status));
    }

    fn on_connection_change(&self, state: ConnectionState) {
        self.push(UiEvent::Connection(state));
    }

    fn on_speech_activity(&self, active: bool) {
        self.push(UiEvent::SpeechActivity(active));
    }

    fn on_session_ready(&self, session_id: &str) {
        self.push(UiEvent::SessionReady {
            session_id: session_id.to_string(),
        });
    }

    fn on_audio(&self, pcm: &[u8]) {
        self.push(UiEvent::Audio(pcm.to_vec()));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.push(UiEvent::Error {
            kind,
            message: message.to_string(),
        });
    }
}

#[allow(unused_imports)]
pub use capture::{CaptureDevice, CaptureFrame, WavFileCapture};
#[allow(unused_imports)]
pub use client::RealtimeClient;
#[allow(unused_imports)]
pub use protocol::{
    ClientEvent, ContentPart, ConversationItem, ServerEvent, SessionConfig, TurnDetectionMode,
};
#[allow(unused_imports)]
pub use session::{Command, ConnectionState, SessionEngine};
#[allow(unused_imports)]
pub use shim::VoiceSession;
#[allow(unused_imports)]
pub use transport::{Connector, Transport, WsConnector};
#[allow(unused_imports)]
pub use vad::{AudioChunk, VadConfig, VadEvent, VoiceActivityDetector, VoicePipeline};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn channel_sink_forwards_every_callback() {
        let (sink, mut rx) = ChannelSink::new();
        let events = vec![
            UiEvent::Message(ChatMessage::new(Role::Assistant, "hi", None)),
            UiEvent::Status(AgentStatus::Thinking),
            UiEvent::Connection(ConnectionState::Open),
            UiEvent::SpeechActivity(true),
            UiEvent::SessionReady {
                session_id: "s1".into(),
            },
            UiEvent::Audio(vec![1, 2]),
            UiEvent::Error {
                kind: ErrorKind::Protocol,
                message: "bad".into(),
            },
        ];
        for event in &events {
            event.deliver(&sink);
        }
        for expected in events {
            assert_eq!(rx.try_recv().unwrap(), expected);
        }
        assert!(rx.try_recv().is_err());
    }
}
