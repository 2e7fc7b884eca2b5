//! Message-framed full-duplex transport.
//!
//! The client depends only on [`Connector`]/[`Transport`], so tests can
//! script a server in memory. [`WsConnector`] is the production
//! implementation over tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// What a transport yields when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One UTF-8 protocol frame.
    Text(String),
    /// The connection is gone. `code` is `None` without a close frame.
    Closed { code: Option<u16>, reason: String },
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound frame. Must be cancel-safe; after `Closed`, keeps
    /// returning `Closed`.
    async fn recv(&mut self) -> Inbound;

    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

// ── WebSocket ────────────────────────────────────────────────────

pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let request = url
            .into_client_request()
            .map_err(|e| Error::Connection(format!("Failed to build WebSocket request: {e}")))?;

        let (ws_stream, response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    Error::Connection(format!(
                        "handshake timed out after {}s",
                        self.timeout.as_secs()
                    ))
                })?
                .map_err(|e| Error::Connection(format!("Failed to connect: {e}")))?;

        tracing::debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport::new(ws_stream)))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: Option<(Option<u16>, String)>,
}

impl WsTransport {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            stream,
            closed: None,
        }
    }

    fn mark_closed(&mut self, code: Option<u16>, reason: String) -> Inbound {
        self.closed = Some((code, reason.clone()));
        Inbound::Closed { code, reason }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| Error::Connection(format!("WebSocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Inbound {
        if let Some((code, reason)) = &self.closed {
            return Inbound::Closed {
                code: *code,
                reason: reason.clone(),
            };
        }

        while let Some(msg_result) = self.stream.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => return Inbound::Text(text.as_str().to_owned()),
                // Some gateways deliver JSON in binary frames.
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    match std::str::from_utf8(&data) {
                        Ok(text) => return Inbound::Text(text.to_owned()),
                        Err(_) => {
                            tracing::warn!(len = data.len(), "Dropping non-UTF-8 binary frame");
                        }
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(close_frame = ?frame, "WebSocket closed by remote");
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(u16::from(frame.code)),
                            frame.reason.as_str().to_owned(),
                        ),
                        None => (None, String::new()),
                    };
                    return self.mark_closed(code, reason);
                }
                Ok(
                    WsMessage::Ping(_)
                    | WsMessage::Pong(_)
                    | WsMessage::Frame(_)
                    | WsMessage::Binary(_),
                ) => {
                    // ping/pong handled by tungstenite
                }
                Err(e) => {
                    tracing::error!(error = %e, "WebSocket error");
                    return self.mark_closed(None, e.to_string());
                }
            }
        }
        self.mark_closed(None, "stream ended".into())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.closed.is_some() {
            return Ok(());
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let result = self.stream.close(Some(frame)).await;
        self.closed = Some((Some(code), reason.to_owned()));
        result.map_err(|e| Error::Connection(format!("WebSocket close failed: {e}")))
    }
}
