//! Realtime session client.
//!
//! A cheap, cloneable handle in front of a single dispatch task. The task
//! owns the transport, the timers and the [`SessionEngine`]; every state
//! mutation happens there, in arrival order. Handle methods never block on
//! the network: they enqueue a request and return.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{ConversationItem, SessionConfig};
use super::session::{Command, ConnectionState, Effect, SessionEngine};
use super::timer::Timers;
use super::transport::{Connector, Inbound, Transport};
use super::{AgentStatus, EventSink};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
enum Request {
    Connect,
    Disconnect,
    Execute(Command),
    LocalSpeech(bool),
    Shutdown,
}

/// Engine state mirrored for the handle, written only by the dispatch task.
#[derive(Debug)]
struct Snapshot {
    state: ConnectionState,
    session_id: Option<String>,
    status: AgentStatus,
}

#[derive(Clone)]
pub struct RealtimeClient {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Mutex<Snapshot>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RealtimeClient {
    /// Start the dispatch task. Nothing is dialed until [`Self::connect`].
    pub fn spawn(
        config: &ConnectionConfig,
        session: SessionConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Snapshot {
            state: ConnectionState::Disconnected,
            session_id: None,
            status: AgentStatus::Idle,
        }));

        let dispatcher = Dispatcher {
            engine: SessionEngine::new(config, session),
            url: config.url(),
            connector,
            transport: None,
            timers: Timers::new(),
            sink,
            shared: Arc::clone(&shared),
            requests: rx,
        };
        let task = tokio::spawn(dispatcher.run());

        Self {
            requests: tx,
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.shared.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Begin connecting. The outcome arrives through the event sink.
    pub fn connect(&self) -> Result<()> {
        self.enqueue(Request::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.enqueue(Request::Disconnect)
    }

    /// Queue a protocol command. Fails fast unless the connection is open.
    pub fn send(&self, command: Command) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(Error::Connection(format!(
                "cannot {} while {state}",
                command.name()
            )));
        }
        self.enqueue(Request::Execute(command))
    }

    pub fn create_session(&self, config: SessionConfig) -> Result<()> {
        self.send(Command::CreateSession(config))
    }

    pub fn update_session(&self, config: SessionConfig) -> Result<()> {
        self.send(Command::UpdateSession(config))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendText(text.into()))
    }

    pub fn send_audio_chunk(&self, wav: Vec<u8>) -> Result<()> {
        self.send(Command::SendAudioChunk(wav))
    }

    pub fn commit_audio_buffer(&self) -> Result<()> {
        self.send(Command::CommitAudioBuffer)
    }

    pub fn clear_audio_buffer(&self) -> Result<()> {
        self.send(Command::ClearAudioBuffer)
    }

    pub fn create_conversation_item(&self, item: ConversationItem) -> Result<()> {
        self.send(Command::CreateConversationItem(item))
    }

    pub fn delete_conversation_item(&self, item_id: impl Into<String>) -> Result<()> {
        self.send(Command::DeleteConversationItem(item_id.into()))
    }

    pub fn cancel_response(&self) -> Result<()> {
        self.send(Command::CancelResponse)
    }

    /// Report local VAD speech activity (drives UI activity and barge-in).
    pub fn notify_local_speech(&self, active: bool) -> Result<()> {
        self.enqueue(Request::LocalSpeech(active))
    }

    /// Close the connection if open and stop the dispatch task.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Dispatch task ended abnormally");
            }
        }
    }

    fn enqueue(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::Connection("client has shut down".into()))
    }
}

// ── Dispatch task ────────────────────────────────────────────────

struct Dispatcher {
    engine: SessionEngine,
    url: String,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    timers: Timers,
    sink: Arc<dyn EventSink>,
    shared: Arc<Mutex<Snapshot>>,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request).await,
                },
                inbound = next_inbound(&mut self.transport) => {
                    let effects = match inbound {
                        Inbound::Text(text) => self.engine.on_frame(&text),
                        Inbound::Closed { code, reason } => {
                            self.transport = None;
                            self.engine.on_closed(code, &reason)
                        }
                    };
                    self.apply(effects).await;
                },
                timer = self.timers.next() => {
                    let effects = self.engine.on_timer(timer);
                    self.apply(effects).await;
                },
            }
        }

        let effects = self.engine.disconnect();
        self.apply(effects).await;
        self.timers.cancel_all();
        tracing::debug!("Realtime dispatch task stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        let effects = match request {
            Request::Connect => self.engine.connect(),
            Request::Disconnect => Ok(self.engine.disconnect()),
            Request::Execute(command) => self.engine.execute(command),
            Request::LocalSpeech(active) => Ok(self.engine.local_speech(active)),
            Request::Shutdown => Ok(Vec::new()),
        };
        match effects {
            Ok(effects) => self.apply(effects).await,
            Err(e) => {
                tracing::warn!(error = %e, "Request rejected");
                if e.is_user_visible() || matches!(e, Error::Config(_)) {
                    self.sink.on_error(e.kind(), &e.to_string());
                }
            }
        }
    }

    /// Carry out effects in order. IO outcomes feed back into the engine
    /// and their effects run before anything queued after them.
    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            // Handle readers must see the state before the sink hears about it.
            self.sync_shared();
            let follow_up = match effect {
                Effect::Dial => Some(self.dial().await),
                Effect::Send(event) => {
                    let kind = event.event_type();
                    match event.to_frame(chrono::Utc::now().timestamp_millis()) {
                        Ok(frame) => self.send_frame(kind, frame).await,
                        Err(e) => {
                            tracing::error!(error = %e, event = kind, "Failed to encode outbound event");
                            None
                        }
                    }
                }
                Effect::Close { code, reason } => {
                    if let Some(mut transport) = self.transport.take() {
                        if let Err(e) = transport.close(code, &reason).await {
                            tracing::debug!(error = %e, "Close handshake failed");
                        }
                    }
                    Some(self.engine.on_closed(Some(code), &reason))
                }
                Effect::Schedule { timer, after } => {
                    self.timers.schedule(timer, after);
                    None
                }
                Effect::Cancel(timer) => {
                    self.timers.cancel(timer);
                    None
                }
                Effect::Notify(event) => {
                    event.deliver(self.sink.as_ref());
                    None
                }
            };
            if let Some(more) = follow_up {
                for effect in more.into_iter().rev() {
                    queue.push_front(effect);
                }
            }
        }
        self.sync_shared();
    }

    async fn dial(&mut self) -> Vec<Effect> {
        match self.connector.connect(&self.url).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.engine.on_open()
            }
            Err(e) => self.engine.on_dial_failed(&e),
        }
    }

    async fn send_frame(&mut self, kind: &'static str, frame: String) -> Option<Vec<Effect>> {
        let Some(transport) = self.transport.as_mut() else {
            tracing::warn!(event = kind, "No transport for outbound event");
            return None;
        };
        tracing::trace!(event = kind, "Sending");
        match transport.send_text(frame).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(error = %e, event = kind, "Send failed, treating as transport drop");
                self.transport = None;
                Some(self.engine.on_closed(None, &e.to_string()))
            }
        }
    }

    fn sync_shared(&self) {
        let mut shared = self.shared.lock();
        shared.state = self.engine.state();
        shared.status = self.engine.status();
        if shared.session_id.as_deref() != self.engine.session_id() {
            shared.session_id = self.engine.session_id().map(str::to_owned);
        }
    }
}

async fn next_inbound(transport: &mut Option<Box<dyn Transport>>) -> Inbound {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}
