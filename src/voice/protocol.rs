//! Wire schema for the realtime turn protocol.
//!
//! Every frame is one UTF-8 JSON object with a mandatory `type`
//! discriminator. Outbound frames additionally carry `client_timestamp`
//! (milliseconds since the Unix epoch), stamped when the frame is written.
//!
//! ```text
//! client ──session.update / input_audio_buffer.append / response.create──▸ remote
//!        ◂──session.created / response.*.delta / response.done────────────
//! ```

use serde::{Deserialize, Serialize};

use super::Role;
use crate::error::{Error, Result};

// ── Session configuration ─────────────────────────────────────────

/// Who decides when a spoken user turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    /// Local VAD segments speech; the client commits each turn.
    ClientVad,
    /// The remote runs its own end-of-turn detection.
    ServerVad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub mode: TurnDetectionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetingConfig {
    pub enable: bool,
    pub content: String,
}

/// Vendor extension block sent with `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaFields {
    pub chat_mode: String,
    pub tts_source: String,
    pub auto_search: bool,
    pub greeting_config: GreetingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseReduction {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Session draft negotiated with the remote.
///
/// Built from caller configuration merged with these defaults. A copy
/// echoed back in `session.updated` confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub model: String,
    pub modalities: Vec<String>,
    pub turn_detection: TurnDetection,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta_fields: Option<BetaFields>,
    pub voice: String,
    pub output_audio_format: String,
    pub input_audio_format: String,
    pub tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_noise_reduction: Option<NoiseReduction>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "glm-4-realtime".into(),
            modalities: vec!["audio".into(), "text".into()],
            turn_detection: TurnDetection {
                mode: TurnDetectionMode::ClientVad,
            },
            instructions: "You are a helpful assistant. Answer clearly and concisely.".into(),
            beta_fields: Some(BetaFields {
                chat_mode: "audio".into(),
                tts_source: "e2e".into(),
                auto_search: false,
                greeting_config: GreetingConfig {
                    enable: false,
                    content: "Hello! How can I help you today?".into(),
                },
            }),
            voice: "tongtong".into(),
            output_audio_format: "pcm".into(),
            input_audio_format: "wav".into(),
            tools: Vec::new(),
            input_audio_noise_reduction: Some(NoiseReduction {
                kind: "near_field".into(),
            }),
        }
    }
}

impl SessionConfig {
    pub fn turn_detection_mode(&self) -> TurnDetectionMode {
        self.turn_detection.mode
    }
}

/// Session object echoed by the remote.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

// ── Conversation items ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    InputText,
    Audio,
    InputAudio,
    #[serde(other)]
    Other,
}

impl ContentKind {
    fn is_audio(self) -> bool {
        matches!(self, Self::Audio | Self::InputAudio)
    }
}

/// One part of a conversation item: text, audio, or transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::InputText,
            text: Some(text.into()),
            transcript: None,
        }
    }

    /// Text carried by this part. Audio parts prefer their transcript.
    pub fn text_content(&self) -> Option<&str> {
        let (first, second) = if self.kind.is_audio() {
            (&self.transcript, &self.text)
        } else {
            (&self.text, &self.transcript)
        };
        first
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| second.as_deref().filter(|t| !t.is_empty()))
    }
}

fn default_item_kind() -> String {
    "message".into()
}

/// An addressable unit of dialogue content. `id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_item_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message holding one `input_text` part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: default_item_kind(),
            role: Some(Role::User),
            content: vec![ContentPart::input_text(text)],
        }
    }

    /// Concatenated text of all text-bearing parts, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::text_content)
            .collect()
    }
}

// ── Responses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Incomplete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    pub id: Option<String>,
    pub status: Option<ResponseStatus>,
    #[serde(default)]
    pub output: Vec<ConversationItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorDetail {
    pub message: Option<String>,
    pub code: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ErrorDetail {
    pub fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("unknown remote error");
        match &self.code {
            Some(serde_json::Value::String(code)) => format!("{message} ({code})"),
            Some(serde_json::Value::Number(code)) => format!("{message} ({code})"),
            _ => message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeltaData {
    pub text: Option<String>,
}

// ── Client → Server ──────────────────────────────────────────────

/// Messages sent from the client to the remote agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Open a session with the core fields of the draft.
    #[serde(rename = "session.create")]
    SessionCreate {
        model: String,
        voice: String,
        instructions: String,
        input_audio_format: String,
        output_audio_format: String,
    },

    /// Replace the session configuration.
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: String,
        session: SessionConfig,
    },

    /// Append one encoded audio chunk (base64) to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete { item_id: String },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,

    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
}

impl ClientEvent {
    pub fn session_create(config: &SessionConfig) -> Self {
        Self::SessionCreate {
            model: config.model.clone(),
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: config.input_audio_format.clone(),
            output_audio_format: config.output_audio_format.clone(),
        }
    }

    pub fn session_update(config: &SessionConfig, now_ms: i64) -> Self {
        Self::SessionUpdate {
            event_id: format!("evt_{now_ms}"),
            session: config.clone(),
        }
    }

    /// The `type` discriminator, for logging without dumping payloads.
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreate { .. } => "session.create",
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::InputAudioBufferClear => "input_audio_buffer.clear",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ConversationItemDelete { .. } => "conversation.item.delete",
            Self::ResponseCreate => "response.create",
            Self::ResponseCancel => "response.cancel",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Serialize into one text frame stamped with `client_timestamp`.
    pub fn to_frame(&self, client_timestamp: i64) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        match value.as_object_mut() {
            Some(map) => {
                map.insert(
                    "client_timestamp".into(),
                    serde_json::Value::from(client_timestamp),
                );
            }
            None => {
                return Err(Error::Protocol(format!(
                    "{} did not serialize to an object",
                    self.event_type()
                )))
            }
        }
        Ok(serde_json::to_string(&value)?)
    }
}

// ── Server → Client ──────────────────────────────────────────────

/// Messages received from the remote agent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: Option<SessionInfo> },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: Option<SessionInfo> },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted { item_id: Option<String> },

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: ConversationItem },

    #[serde(rename = "conversation.item.deleted")]
    ConversationItemDeleted { item_id: String },

    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated { item_id: Option<String> },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputAudioTranscriptionFailed {
        item_id: Option<String>,
        #[serde(default)]
        error: ErrorDetail,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        response_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone,

    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        response_id: Option<String>,
        item_id: Option<String>,
        part: ContentPart,
    },

    #[serde(rename = "response.content_part.done")]
    ContentPartDone,

    #[serde(rename = "response.text.delta")]
    TextDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
        data: Option<DeltaData>,
    },

    #[serde(rename = "response.text.done")]
    TextDone,

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        response_id: Option<String>,
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone,

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone {
        response: Option<ResponseInfo>,
        status: Option<ResponseStatus>,
    },

    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        response: Option<ResponseInfo>,
        response_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },

    #[serde(rename = "speech_started", alias = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "speech_stopped", alias = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(other)]
    Unknown,
}

/// Decode one inbound text frame.
pub fn parse_server_event(json_text: &str) -> Result<ServerEvent> {
    serde_json::from_str(json_text)
        .map_err(|e| Error::Protocol(format!("malformed server event: {e}")))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_json(event: &ClientEvent) -> serde_json::Value {
        serde_json::from_str(&event.to_frame(1_700_000_000_000).unwrap()).unwrap()
    }

    #[test]
    fn every_frame_carries_type_and_timestamp() {
        let events = [
            ClientEvent::InputAudioBufferCommit,
            ClientEvent::ResponseCreate,
            ClientEvent::ResponseCancel,
            ClientEvent::Heartbeat { timestamp: 5 },
            ClientEvent::ConversationItemDelete {
                item_id: "item_1".into(),
            },
        ];
        for event in &events {
            let json = frame_json(event);
            assert_eq!(json["type"], event.event_type());
            assert_eq!(json["client_timestamp"], 1_700_000_000_000i64);
        }
    }

    #[test]
    fn session_update_wraps_session_object() {
        let event = ClientEvent::session_update(&SessionConfig::default(), 42);
        let json = frame_json(&event);
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["event_id"], "evt_42");
        assert_eq!(json["session"]["model"], "glm-4-realtime");
        assert_eq!(json["session"]["turn_detection"]["type"], "client_vad");
        assert_eq!(json["session"]["input_audio_format"], "wav");
        assert_eq!(json["session"]["output_audio_format"], "pcm");
        assert_eq!(json["session"]["beta_fields"]["tts_source"], "e2e");
        assert_eq!(
            json["session"]["input_audio_noise_reduction"]["type"],
            "near_field"
        );
    }

    #[test]
    fn session_create_is_flat() {
        let json = frame_json(&ClientEvent::session_create(&SessionConfig::default()));
        assert_eq!(json["type"], "session.create");
        assert_eq!(json["voice"], "tongtong");
        assert!(json.get("session").is_none());
    }

    #[test]
    fn user_text_item_shape() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("Hello"),
        };
        let json = frame_json(&event);
        assert_eq!(json["item"]["type"], "message");
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "Hello");
        assert!(json["item"].get("id").is_none());
    }

    #[test]
    fn audio_append_carries_payload() {
        let json = frame_json(&ClientEvent::InputAudioBufferAppend {
            audio: "UklGRg==".into(),
        });
        assert_eq!(json["type"], "input_audio_buffer.append");
        assert_eq!(json["audio"], "UklGRg==");
    }

    #[test]
    fn parse_session_created() {
        let event =
            parse_server_event(r#"{"type":"session.created","session":{"id":"s1","model":"m"}}"#)
                .unwrap();
        assert!(matches!(
            event,
            ServerEvent::SessionCreated { session: Some(SessionInfo { id: Some(ref id), .. }) } if id == "s1"
        ));
    }

    #[test]
    fn parse_text_delta_with_extra_fields() {
        let event = parse_server_event(
            r#"{"type":"response.text.delta","response_id":"r1","item_id":"i1","delta":"Hi","event_id":"e9"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            ServerEvent::TextDelta { ref delta, ref response_id, .. }
                if delta == "Hi" && response_id.as_deref() == Some("r1")
        ));
    }

    #[test]
    fn parse_response_done_with_nested_status() {
        let event = parse_server_event(
            r#"{"type":"response.done","response":{"id":"r1","status":"completed","output":[]}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ResponseDone { response, status } => {
                let response = response.unwrap();
                assert_eq!(response.id.as_deref(), Some("r1"));
                assert_eq!(response.status, Some(ResponseStatus::Completed));
                assert!(status.is_none());
            }
            other => panic!("Expected ResponseDone, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_status_and_type() {
        let event =
            parse_server_event(r#"{"type":"response.done","status":"exotic"}"#).unwrap();
        assert!(matches!(
            event,
            ServerEvent::ResponseDone {
                status: Some(ResponseStatus::Unknown),
                ..
            }
        ));

        let event = parse_server_event(r#"{"type":"rate_limits.updated","x":1}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn parse_speech_events_accept_both_spellings() {
        assert_eq!(
            parse_server_event(r#"{"type":"speech_started"}"#).unwrap(),
            ServerEvent::SpeechStarted
        );
        assert_eq!(
            parse_server_event(r#"{"type":"input_audio_buffer.speech_stopped","audio_end_ms":10}"#)
                .unwrap(),
            ServerEvent::SpeechStopped
        );
    }

    #[test]
    fn parse_error_event() {
        let event = parse_server_event(
            r#"{"type":"error","error":{"message":"Rate limit exceeded","code":"1302"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.describe(), "Rate limit exceeded (1302)");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_malformed_json() {
        assert!(parse_server_event("{not json").is_err());
        assert!(parse_server_event(r#"{"no_type":true}"#).is_err());
        // Known type with a missing required field.
        assert!(parse_server_event(r#"{"type":"conversation.item.deleted"}"#).is_err());
    }

    #[test]
    fn audio_part_prefers_transcript() {
        let part = ContentPart {
            kind: ContentKind::Audio,
            text: Some("text".into()),
            transcript: Some("spoken".into()),
        };
        assert_eq!(part.text_content(), Some("spoken"));

        let part = ContentPart {
            kind: ContentKind::Audio,
            text: None,
            transcript: Some(String::new()),
        };
        assert_eq!(part.text_content(), None);
    }

    #[test]
    fn item_text_concatenates_parts() {
        let item: ConversationItem = serde_json::from_str(
            r#"{"id":"i1","type":"message","role":"assistant","content":[
                {"type":"text","text":"Hi"},
                {"type":"audio","transcript":" there"},
                {"type":"image_url"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(item.role, Some(Role::Assistant));
        assert_eq!(item.text(), "Hi there");
    }
}
