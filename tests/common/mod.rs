//! Shared test utilities: an in-memory transport with a scripted server side,
//! a paced capture device, and event-stream helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use realtime_voice::voice::capture::{CaptureDevice, CaptureFrame};
use realtime_voice::voice::transport::{Connector, Inbound, Transport};
use realtime_voice::{ConnectionConfig, Error, Result, UiEvent};

/// Generous bound for anything the dispatch task should do promptly.
pub const WAIT: Duration = Duration::from_secs(120);

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        api_key: "test-key".into(),
        ..ConnectionConfig::default()
    }
}

// ── Scripted server ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Refuse,
}

/// Server side of one accepted connection.
pub struct ServerConn {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Inbound>,
}

impl ServerConn {
    pub fn send(&self, json: &str) {
        let _ = self.to_client.send(Inbound::Text(json.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Next frame the client sent, parsed.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client transport dropped");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Next frame whose `type` is not `heartbeat`.
    pub async fn next_non_heartbeat(&mut self) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] != "heartbeat" {
                return frame;
            }
        }
    }

    /// Skip frames until one of type `kind` arrives.
    pub async fn expect_type(&mut self, kind: &str) -> serde_json::Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }
}

pub struct ScriptedConnector {
    plan: Mutex<VecDeque<Dial>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
    dials: AtomicU32,
}

impl ScriptedConnector {
    /// Dials follow `plan` in order, then accept once it runs out.
    pub fn new(plan: Vec<Dial>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.into()),
            accepted: tx,
            dials: AtomicU32::new(0),
        });
        (connector, rx)
    }

    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self.plan.lock().pop_front().unwrap_or(Dial::Accept);
        if outcome == Dial::Refuse {
            return Err(Error::Connection("connection refused".into()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerConn {
            from_client: client_rx,
            to_client: server_tx,
        });
        Ok(Box::new(MemoryTransport {
            to_server: client_tx,
            from_server: server_rx,
            closed: false,
        }))
    }
}

struct MemoryTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<Inbound>,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(Error::Connection("transport closed".into()));
        }
        self.to_server
            .send(text)
            .map_err(|_| Error::Connection("server gone".into()))
    }

    async fn recv(&mut self) -> Inbound {
        if self.closed {
            return std::future::pending().await;
        }
        match self.from_server.recv().await {
            Some(inbound) => {
                if matches!(inbound, Inbound::Closed { .. }) {
                    self.closed = true;
                }
                inbound
            }
            None => {
                self.closed = true;
                Inbound::Closed {
                    code: None,
                    reason: "server gone".into(),
                }
            }
        }
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

// ── Capture ──────────────────────────────────────────────────────

/// Plays back fixed samples at real-time pace on the tokio clock.
pub struct PacedCapture {
    samples: Vec<f32>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PacedCapture {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            task: None,
        }
    }
}

#[async_trait]
impl CaptureDevice for PacedCapture {
    async fn start_capture(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<Result<CaptureFrame>>> {
        let (tx, rx) = mpsc::channel(8);
        let samples = std::mem::take(&mut self.samples);
        let period = Duration::from_secs_f64(frame_size as f64 / f64::from(sample_rate));
        self.task = Some(tokio::spawn(async move {
            for block in samples.chunks(frame_size) {
                tokio::time::sleep(period).await;
                let frame = CaptureFrame {
                    samples: block.to_vec(),
                    timestamp: tokio::time::Instant::now(),
                };
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        }));
        Ok(rx)
    }

    async fn stop_capture(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub fn sine(freq: f32, amplitude: f32, seconds: f32, rate: u32) -> Vec<f32> {
    let n = (seconds * rate as f32) as usize;
    (0..n)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
        .collect()
}

pub fn silence(seconds: f32, rate: u32) -> Vec<f32> {
    vec![0.0; (seconds * rate as f32) as usize]
}

// ── Events ───────────────────────────────────────────────────────

/// Receive events until one matches, returning everything seen up to it.
pub async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<UiEvent>,
    pred: impl Fn(&UiEvent) -> bool,
) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<UiEvent>,
    expected: &UiEvent,
) -> Vec<UiEvent> {
    collect_until(events, |e| e == expected).await
}
