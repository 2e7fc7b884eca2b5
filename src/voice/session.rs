//! Session protocol engine.
//!
//! Owns the connection state machine, session confirmation, the active
//! streamed response, and the item dedup set. It performs no IO: every
//! input (`connect`, an inbound frame, a fired timer, a transport close)
//! returns the [`Effect`]s the driver must carry out, in order.
//!
//! ```text
//! Disconnected ─connect─▸ Connecting ─open─▸ Open ─disconnect─▸ Closing ─▸ Disconnected
//!                             ▴               │
//!                   backoff n │        unclean close
//!                             │               ▾
//!                       Reconnecting(n) ◂─────┘ ── n > max ──▸ Failed
//! ```

use std::collections::HashSet;
use std::time::Duration;

use super::codec;
use super::protocol::{
    parse_server_event, ClientEvent, ConversationItem, ResponseStatus, ServerEvent, SessionConfig,
    TurnDetectionMode,
};
use super::timer::TimerKind;
use super::{AgentStatus, ChatMessage, Role, UiEvent};
use crate::config::ConnectionConfig;
use crate::error::{Error, ErrorKind, Result};

/// Close code for a clean, caller-initiated shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

/// Audio-chunk logs are sampled: the first chunk and every Nth after it.
const AUDIO_LOG_EVERY: u64 = 50;

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Waiting out the backoff before reconnect attempt `n`.
    Reconnecting(u32),
    Closing,
    /// Reconnection exhausted; only a caller `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Reconnecting(n) => write!(f, "reconnecting ({n})"),
            Self::Closing => f.write_str("closing"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// The single streamed response currently being assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseState {
    pub id: Option<String>,
    pub status: ResponseStatus,
    /// Conversation item the response is rendered into, once known.
    pub item_id: Option<String>,
    /// Ordered concatenation of every text fragment received so far.
    pub text: String,
}

impl ResponseState {
    fn new(id: Option<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::InProgress,
            item_id: None,
            text: String::new(),
        }
    }

    /// Events without a response id are attributed to the active response.
    fn accepts(&self, response_id: Option<&str>) -> bool {
        match (self.id.as_deref(), response_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    fn link_item(&mut self, item_id: Option<&str>) {
        if self.item_id.is_none() {
            self.item_id = item_id.map(str::to_owned);
        }
    }
}

// ── Engine IO ────────────────────────────────────────────────────

/// Caller commands; all require the connection to be open.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Send `session.create` with the given draft.
    CreateSession(SessionConfig),
    /// Replace the draft and send `session.update`.
    UpdateSession(SessionConfig),
    /// Create a user text item, then request a response.
    SendText(String),
    /// Append one encoded (WAV) utterance chunk to the input buffer.
    SendAudioChunk(Vec<u8>),
    CommitAudioBuffer,
    ClearAudioBuffer,
    CreateConversationItem(ConversationItem),
    DeleteConversationItem(String),
    CancelResponse,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "create_session",
            Self::UpdateSession(_) => "update_session",
            Self::SendText(_) => "send_text",
            Self::SendAudioChunk(_) => "send_audio_chunk",
            Self::CommitAudioBuffer => "commit_audio_buffer",
            Self::ClearAudioBuffer => "clear_audio_buffer",
            Self::CreateConversationItem(_) => "create_conversation_item",
            Self::DeleteConversationItem(_) => "delete_conversation_item",
            Self::CancelResponse => "cancel_response",
        }
    }
}

/// Side effect requested by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a new transport; report back with `on_open` or `on_dial_failed`.
    Dial,
    /// Write one protocol message.
    Send(ClientEvent),
    /// Close the transport; report back with `on_closed`.
    Close { code: u16, reason: String },
    Schedule { timer: TimerKind, after: Duration },
    Cancel(TimerKind),
    /// Deliver an event to the UI sink.
    Notify(UiEvent),
}

// ── Engine ───────────────────────────────────────────────────────

pub struct SessionEngine {
    config: ConnectionConfig,
    draft: SessionConfig,
    state: ConnectionState,
    /// Reconnect attempts in the current failure episode.
    attempts: u32,
    session_id: Option<String>,
    confirmed: bool,
    status: AgentStatus,
    active: Option<ResponseState>,
    seen: HashSet<String>,
    /// Key of the last reply finalized before any item id was linked to it.
    unlinked_reply: Option<String>,
    /// Audio appended since the last commit or clear.
    audio_pending: bool,
    audio_chunks_sent: u64,
}

impl SessionEngine {
    pub fn new(config: &ConnectionConfig, draft: SessionConfig) -> Self {
        Self {
            config: config.clone(),
            draft,
            state: ConnectionState::Disconnected,
            attempts: 0,
            session_id: None,
            confirmed: false,
            status: AgentStatus::Idle,
            active: None,
            seen: HashSet::new(),
            unlinked_reply: None,
            audio_pending: false,
            audio_chunks_sent: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn active_response(&self) -> Option<&ResponseState> {
        self.active.as_ref()
    }

    /// Whether the remote has echoed the current draft.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn draft(&self) -> &SessionConfig {
        &self.draft
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Caller-initiated connect. Also the way out of `Failed`.
    pub fn connect(&mut self) -> Result<Vec<Effect>> {
        let mut fx = Vec::new();
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                tracing::debug!(state = %self.state, "Connect ignored, already active");
                return Ok(fx);
            }
            ConnectionState::Closing => {
                return Err(Error::Connection(
                    "cannot connect while the previous connection is closing".into(),
                ));
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting(_)
            | ConnectionState::Failed => {}
        }
        self.config.validate_for_connect()?;

        tracing::info!(url = %self.config.redacted_url(), "Connecting to realtime endpoint");
        self.attempts = 0;
        fx.push(Effect::Cancel(TimerKind::Reconnect));
        self.set_state(ConnectionState::Connecting, &mut fx);
        fx.push(Effect::Dial);
        Ok(fx)
    }

    /// Caller-initiated clean shutdown.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        match self.state {
            ConnectionState::Open => {
                tracing::info!(session_id = ?self.session_id, "Disconnecting");
                self.leave_open(&mut fx);
                self.set_state(ConnectionState::Closing, &mut fx);
                fx.push(Effect::Close {
                    code: NORMAL_CLOSE,
                    reason: "client disconnect".into(),
                });
            }
            ConnectionState::Reconnecting(_) | ConnectionState::Failed => {
                fx.push(Effect::Cancel(TimerKind::Reconnect));
                self.attempts = 0;
                self.set_state(ConnectionState::Disconnected, &mut fx);
            }
            ConnectionState::Connecting
            | ConnectionState::Closing
            | ConnectionState::Disconnected => {}
        }
        fx
    }

    /// The transport finished its handshake.
    pub fn on_open(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state != ConnectionState::Connecting {
            tracing::warn!(state = %self.state, "Unexpected transport open, closing it");
            fx.push(Effect::Close {
                code: NORMAL_CLOSE,
                reason: "stale connection".into(),
            });
            return fx;
        }
        if self.attempts > 0 {
            tracing::info!(attempts = self.attempts, "Reconnected");
        } else {
            tracing::info!("Realtime connection open");
        }
        self.attempts = 0;
        self.session_id = None;
        self.confirmed = false;
        // Item ids are scoped to one connection.
        self.seen.clear();
        self.unlinked_reply = None;
        self.audio_pending = false;
        self.set_state(ConnectionState::Open, &mut fx);
        self.set_status(AgentStatus::Idle, &mut fx);
        fx.push(Effect::Schedule {
            timer: TimerKind::Heartbeat,
            after: self.config.heartbeat_interval(),
        });
        fx
    }

    /// A dial ended without an open transport.
    pub fn on_dial_failed(&mut self, error: &Error) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state != ConnectionState::Connecting {
            return fx;
        }
        if self.attempts == 0 {
            tracing::error!(error = %error, "Connection failed");
            self.set_state(ConnectionState::Disconnected, &mut fx);
            fx.push(Effect::Notify(UiEvent::Error {
                kind: ErrorKind::Connection,
                message: error.to_string(),
            }));
        } else {
            tracing::warn!(attempt = self.attempts, error = %error, "Reconnect attempt failed");
            self.retry(&mut fx);
        }
        fx
    }

    /// The transport closed. `code` is `None` when no close frame arrived.
    pub fn on_closed(&mut self, code: Option<u16>, reason: &str) -> Vec<Effect> {
        let mut fx = Vec::new();
        match self.state {
            ConnectionState::Closing => {
                tracing::info!(?code, "Connection closed");
                self.set_state(ConnectionState::Disconnected, &mut fx);
            }
            ConnectionState::Open => {
                self.leave_open(&mut fx);
                if code == Some(NORMAL_CLOSE) {
                    tracing::info!(reason, "Remote closed the connection");
                    self.set_state(ConnectionState::Disconnected, &mut fx);
                } else {
                    let dropped = Error::TransportDrop {
                        code,
                        reason: reason.to_string(),
                    };
                    tracing::warn!(error = %dropped, "Transport dropped, scheduling reconnect");
                    self.retry(&mut fx);
                }
            }
            ConnectionState::Connecting => {
                let error = Error::Connection(format!(
                    "closed during handshake (code {code:?}): {reason}"
                ));
                fx = self.on_dial_failed(&error);
            }
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting(_)
            | ConnectionState::Failed => {
                tracing::debug!(state = %self.state, ?code, "Ignoring close of inactive transport");
            }
        }
        fx
    }

    pub fn on_timer(&mut self, timer: TimerKind) -> Vec<Effect> {
        let mut fx = Vec::new();
        match timer {
            TimerKind::Heartbeat => {
                if self.state.is_open() {
                    tracing::trace!("Heartbeat");
                    fx.push(Effect::Send(ClientEvent::Heartbeat {
                        timestamp: now_ms(),
                    }));
                    fx.push(Effect::Schedule {
                        timer: TimerKind::Heartbeat,
                        after: self.config.heartbeat_interval(),
                    });
                }
            }
            TimerKind::SessionUpdate => {
                if self.state.is_open() && !self.confirmed {
                    fx.push(self.session_update());
                }
            }
            TimerKind::Reconnect => {
                if let ConnectionState::Reconnecting(n) = self.state {
                    tracing::info!(
                        attempt = n,
                        max = self.config.max_reconnect_attempts,
                        "Attempting reconnect"
                    );
                    self.set_state(ConnectionState::Connecting, &mut fx);
                    fx.push(Effect::Dial);
                }
            }
        }
        fx
    }

    /// Local VAD speech activity. Onset doubles as a barge-in signal.
    pub fn local_speech(&mut self, active: bool) -> Vec<Effect> {
        let mut fx = vec![Effect::Notify(UiEvent::SpeechActivity(active))];
        if active {
            self.barge_in(&mut fx);
        }
        fx
    }

    fn retry(&mut self, fx: &mut Vec<Effect>) {
        let max = self.config.max_reconnect_attempts;
        if self.attempts >= max {
            tracing::error!(attempts = self.attempts, "Reconnect exhausted, giving up");
            let error = Error::ReconnectExhausted {
                attempts: self.attempts,
            };
            self.set_state(ConnectionState::Failed, fx);
            self.set_status(AgentStatus::Error, fx);
            fx.push(Effect::Notify(UiEvent::Error {
                kind: error.kind(),
                message: error.to_string(),
            }));
            return;
        }
        self.attempts += 1;
        let after = self.config.reconnect_delay(self.attempts);
        tracing::info!(
            attempt = self.attempts,
            max,
            delay_ms = after.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.set_state(ConnectionState::Reconnecting(self.attempts), fx);
        fx.push(Effect::Schedule {
            timer: TimerKind::Reconnect,
            after,
        });
    }

    fn leave_open(&mut self, fx: &mut Vec<Effect>) {
        fx.push(Effect::Cancel(TimerKind::Heartbeat));
        fx.push(Effect::Cancel(TimerKind::SessionUpdate));
        if self.active.take().is_some() {
            tracing::debug!("Dropping in-flight response with the connection");
        }
        self.set_status(AgentStatus::Idle, fx);
    }

    fn set_state(&mut self, state: ConnectionState, fx: &mut Vec<Effect>) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "Connection state");
            self.state = state;
            fx.push(Effect::Notify(UiEvent::Connection(state)));
        }
    }

    fn set_status(&mut self, status: AgentStatus, fx: &mut Vec<Effect>) {
        if self.status != status {
            self.status = status;
            fx.push(Effect::Notify(UiEvent::Status(status)));
        }
    }

    fn session_update(&self) -> Effect {
        tracing::debug!(model = %self.draft.model, voice = %self.draft.voice, "Sending session.update");
        Effect::Send(ClientEvent::session_update(&self.draft, now_ms()))
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Translate a caller command into outbound messages. Fails fast unless open.
    pub fn execute(&mut self, command: Command) -> Result<Vec<Effect>> {
        if !self.state.is_open() {
            return Err(Error::Connection(format!(
                "cannot {} while {}",
                command.name(),
                self.state
            )));
        }

        let mut fx = Vec::new();
        match command {
            Command::CreateSession(config) => {
                fx.push(Effect::Send(ClientEvent::session_create(&config)));
                self.draft = config;
                self.confirmed = false;
            }
            Command::UpdateSession(config) => {
                self.draft = config;
                self.confirmed = false;
                fx.push(self.session_update());
            }
            Command::SendText(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    tracing::debug!("Ignoring empty text message");
                    return Ok(fx);
                }
                fx.push(Effect::Send(ClientEvent::ConversationItemCreate {
                    item: ConversationItem::user_text(text.clone()),
                }));
                fx.push(Effect::Send(ClientEvent::ResponseCreate));
                fx.push(Effect::Notify(UiEvent::Message(ChatMessage::new(
                    Role::User,
                    text,
                    None,
                ))));
                self.set_status(AgentStatus::Thinking, &mut fx);
            }
            Command::SendAudioChunk(wav) => {
                let audio = codec::to_transport_text(&wav)?;
                self.audio_chunks_sent += 1;
                if self.audio_chunks_sent == 1 || self.audio_chunks_sent % AUDIO_LOG_EVERY == 0 {
                    tracing::debug!(
                        chunks = self.audio_chunks_sent,
                        bytes = wav.len(),
                        "Sending audio chunk"
                    );
                }
                fx.push(Effect::Send(ClientEvent::InputAudioBufferAppend { audio }));
                self.audio_pending = true;
            }
            Command::CommitAudioBuffer => {
                fx.push(Effect::Send(ClientEvent::InputAudioBufferCommit));
                self.audio_pending = false;
            }
            Command::ClearAudioBuffer => {
                fx.push(Effect::Send(ClientEvent::InputAudioBufferClear));
                self.audio_pending = false;
            }
            Command::CreateConversationItem(item) => {
                fx.push(Effect::Send(ClientEvent::ConversationItemCreate { item }));
            }
            Command::DeleteConversationItem(item_id) => {
                fx.push(Effect::Send(ClientEvent::ConversationItemDelete { item_id }));
            }
            Command::CancelResponse => {
                fx.push(Effect::Send(ClientEvent::ResponseCancel));
                // Advisory: the remote's response.cancelled/done is authoritative.
                self.active = None;
                self.set_status(AgentStatus::Idle, &mut fx);
            }
        }
        Ok(fx)
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Decode and apply one inbound text frame. Malformed frames are dropped.
    pub fn on_frame(&mut self, text: &str) -> Vec<Effect> {
        match parse_server_event(text) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                tracing::warn!(error = %e, frame = %preview, "Dropping malformed server event");
                Vec::new()
            }
        }
    }

    pub fn handle_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            ServerEvent::SessionCreated { session } => {
                if let Some(id) = session.and_then(|s| s.id) {
                    tracing::info!(session_id = %id, "Session created");
                    self.session_id = Some(id.clone());
                    fx.push(Effect::Notify(UiEvent::SessionReady { session_id: id }));
                }
                if !self.confirmed {
                    let delay = self.config.session_update_delay();
                    if delay.is_zero() {
                        fx.push(self.session_update());
                    } else {
                        fx.push(Effect::Schedule {
                            timer: TimerKind::SessionUpdate,
                            after: delay,
                        });
                    }
                }
            }
            ServerEvent::SessionUpdated { session } => {
                self.confirmed = true;
                if let Some(id) = session.and_then(|s| s.id) {
                    if self.session_id.is_none() {
                        self.session_id = Some(id);
                    }
                }
                tracing::info!(session_id = ?self.session_id, "Session configuration confirmed");
            }
            ServerEvent::InputAudioBufferCommitted { item_id } => {
                tracing::debug!(?item_id, "Input audio committed");
            }
            ServerEvent::InputAudioBufferCleared => {
                tracing::debug!("Input audio cleared");
            }
            ServerEvent::ConversationItemCreated { item } => {
                self.on_item_created(item, &mut fx);
            }
            ServerEvent::ConversationItemDeleted { item_id } => {
                if self.seen.remove(&item_id) {
                    tracing::debug!(item_id = %item_id, "Item deleted, id may be reused");
                }
            }
            ServerEvent::ConversationItemTruncated { item_id } => {
                tracing::debug!(?item_id, "Item truncated");
            }
            ServerEvent::InputAudioTranscriptionCompleted {
                item_id,
                transcript,
            } => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    self.emit(Role::User, transcript.to_string(), item_id, &mut fx);
                }
            }
            ServerEvent::InputAudioTranscriptionFailed { item_id, error } => {
                let message = format!("transcription failed: {}", error.describe());
                tracing::warn!(?item_id, message = %message, "Input transcription failed");
                fx.push(Effect::Notify(UiEvent::Error {
                    kind: ErrorKind::Protocol,
                    message,
                }));
            }
            ServerEvent::ResponseCreated { response } => {
                if let Some(prior) = &self.active {
                    tracing::debug!(prior = ?prior.id, "Replacing lingering response");
                }
                tracing::debug!(response_id = ?response.id, "Response started");
                self.unlinked_reply = None;
                let mut state = ResponseState::new(response.id);
                state.link_item(response.output.first().and_then(|i| i.id.as_deref()));
                self.active = Some(state);
                self.set_status(AgentStatus::Thinking, &mut fx);
            }
            ServerEvent::OutputItemAdded { response_id, item } => {
                if let Some(active) = self.active_for(response_id.as_deref()) {
                    active.link_item(item.id.as_deref());
                    active.text.push_str(&item.text());
                }
            }
            ServerEvent::ContentPartAdded {
                response_id,
                item_id,
                part,
            } => {
                if let Some(active) = self.active_for(response_id.as_deref()) {
                    active.link_item(item_id.as_deref());
                    if let Some(text) = part.text_content() {
                        active.text.push_str(text);
                    }
                }
            }
            ServerEvent::TextDelta {
                response_id,
                item_id,
                delta,
                data,
            } => {
                let fragment = if delta.is_empty() {
                    data.and_then(|d| d.text).unwrap_or_default()
                } else {
                    delta
                };
                self.append_delta(response_id, item_id, &fragment, &mut fx);
            }
            ServerEvent::AudioTranscriptDelta {
                response_id,
                item_id,
                delta,
            } => {
                self.append_delta(response_id, item_id, &delta, &mut fx);
            }
            ServerEvent::AudioDelta { response_id, delta } => {
                self.on_audio_delta(response_id, &delta, &mut fx);
            }
            ServerEvent::OutputItemDone
            | ServerEvent::ContentPartDone
            | ServerEvent::TextDone
            | ServerEvent::AudioTranscriptDone
            | ServerEvent::AudioDone => {}
            ServerEvent::ResponseDone { response, status } => {
                self.on_response_done(response.unwrap_or_default(), status, &mut fx);
            }
            ServerEvent::ResponseCancelled {
                response,
                response_id,
            } => {
                let id = response_id.or_else(|| response.and_then(|r| r.id));
                if self.active_for(id.as_deref()).is_some() {
                    tracing::debug!(response_id = ?id, "Response cancelled");
                    self.active = None;
                }
                self.set_status(AgentStatus::Idle, &mut fx);
            }
            ServerEvent::Error { error } => {
                let message = error.describe();
                tracing::warn!(message = %message, kind = ?error.kind, "Remote reported an error");
                self.set_status(AgentStatus::Error, &mut fx);
                fx.push(Effect::Notify(UiEvent::Error {
                    kind: ErrorKind::Protocol,
                    message,
                }));
            }
            ServerEvent::SpeechStarted => {
                fx.push(Effect::Notify(UiEvent::SpeechActivity(true)));
                self.barge_in(&mut fx);
            }
            ServerEvent::SpeechStopped => {
                fx.push(Effect::Notify(UiEvent::SpeechActivity(false)));
                // With client VAD the local detector owns the commit.
                if self.draft.turn_detection_mode() == TurnDetectionMode::ServerVad
                    && self.audio_pending
                {
                    tracing::debug!("Remote detected end of speech, committing audio");
                    fx.push(Effect::Send(ClientEvent::InputAudioBufferCommit));
                    self.audio_pending = false;
                }
            }
            ServerEvent::Heartbeat => {
                tracing::trace!("Heartbeat acknowledged");
            }
            ServerEvent::Unknown => {
                tracing::debug!("Ignoring unknown server event");
            }
        }
        fx
    }

    fn active_for(&mut self, response_id: Option<&str>) -> Option<&mut ResponseState> {
        match self.active.as_mut() {
            Some(active) if active.accepts(response_id) => Some(active),
            Some(active) => {
                tracing::debug!(
                    active = ?active.id,
                    event = ?response_id,
                    "Dropping event for inactive response"
                );
                None
            }
            None => None,
        }
    }

    fn append_delta(
        &mut self,
        response_id: Option<String>,
        item_id: Option<String>,
        fragment: &str,
        fx: &mut Vec<Effect>,
    ) {
        let Some(active) = self.active_for(response_id.as_deref()) else {
            tracing::debug!(?response_id, "Delta without an active response");
            return;
        };
        active.link_item(item_id.as_deref());
        active.text.push_str(fragment);
        self.set_status(AgentStatus::Speaking, fx);
    }

    fn on_audio_delta(&mut self, response_id: Option<String>, delta: &str, fx: &mut Vec<Effect>) {
        if delta.is_empty() {
            return;
        }
        match codec::from_transport_text(delta) {
            Ok(pcm) => fx.push(Effect::Notify(UiEvent::Audio(pcm))),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable audio delta");
                return;
            }
        }
        if self.active_for(response_id.as_deref()).is_some() {
            self.set_status(AgentStatus::Speaking, fx);
        }
    }

    fn on_item_created(&mut self, item: ConversationItem, fx: &mut Vec<Effect>) {
        if item.role != Some(Role::Assistant) {
            tracing::debug!(item_id = ?item.id, role = ?item.role, "Item created");
            return;
        }
        let Some(id) = item.id.clone() else {
            tracing::debug!("Assistant item without id, not rendering");
            return;
        };
        match self.active.as_mut() {
            Some(active) => active.link_item(Some(&id)),
            None => {
                if let Some(reply) = self.unlinked_reply.take() {
                    // Snapshot of the reply already rendered from streamed deltas.
                    tracing::debug!(item_id = %id, response_id = %reply, "Linked item to finalized reply");
                    self.seen.insert(id);
                    return;
                }
            }
        }
        let text = item.text();
        if !text.trim().is_empty() {
            self.emit(Role::Assistant, text, Some(id), fx);
        }
    }

    fn on_response_done(
        &mut self,
        response: super::protocol::ResponseInfo,
        status: Option<ResponseStatus>,
        fx: &mut Vec<Effect>,
    ) {
        let status = status.or(response.status).unwrap_or(ResponseStatus::Completed);

        let Some(mut active) = self.active.take() else {
            // Already reset locally, e.g. after an optimistic cancel.
            tracing::debug!(response_id = ?response.id, "Response done with no active response");
            self.set_status(AgentStatus::Idle, fx);
            return;
        };
        if !active.accepts(response.id.as_deref()) {
            tracing::debug!(
                active = ?active.id,
                done = ?response.id,
                "Ignoring completion of a superseded response"
            );
            self.active = Some(active);
            return;
        }

        active.status = status;
        if status == ResponseStatus::Completed {
            if active.text.is_empty() {
                active.text = response.output.iter().map(ConversationItem::text).collect();
            }
            active.link_item(response.output.first().and_then(|i| i.id.as_deref()));
            let linked = active.item_id.is_some();
            let key = active.item_id.or(active.id);
            if active.text.trim().is_empty() {
                tracing::debug!(key = ?key, "Completed response carried no text");
            } else {
                if !linked {
                    self.unlinked_reply = key.clone();
                }
                self.emit(Role::Assistant, active.text, key, fx);
            }
        } else {
            tracing::debug!(
                response_id = ?active.id,
                ?status,
                discarded = active.text.len(),
                "Response ended without completing"
            );
        }
        self.set_status(AgentStatus::Idle, fx);
    }

    fn barge_in(&mut self, fx: &mut Vec<Effect>) {
        if self.active.is_none() && self.status != AgentStatus::Speaking {
            return;
        }
        tracing::info!(response_id = ?self.active.as_ref().and_then(|r| r.id.clone()), "Barge-in, cancelling response");
        if self.state.is_open() {
            fx.push(Effect::Send(ClientEvent::ResponseCancel));
        }
        self.active = None;
        self.set_status(AgentStatus::Idle, fx);
    }

    /// Emit a finalized message, at most once per item id.
    fn emit(&mut self, role: Role, text: String, key: Option<String>, fx: &mut Vec<Effect>) {
        if let Some(key) = &key {
            if !self.seen.insert(key.clone()) {
                tracing::debug!(item_id = %key, "Duplicate delivery suppressed");
                return;
            }
        }
        fx.push(Effect::Notify(UiEvent::Message(ChatMessage::new(
            role, text, key,
        ))));
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Tests ──────────────────────────────────────────────────────────
