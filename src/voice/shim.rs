//! UI-facing voice session: the realtime client plus microphone input.
//!
//! Detector chunks go to `input_audio_buffer.append`; local speech edges
//! drive activity events and barge-in; in client-VAD mode a speech stop
//! commits the buffered turn.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::CaptureDevice;
use super::client::RealtimeClient;
use super::protocol::TurnDetectionMode;
use super::transport::Connector;
use super::vad::{VadConfig, VadEvent, VoicePipeline};
use super::EventSink;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};

const VAD_EVENT_BUFFER: usize = 64;

pub struct VoiceSession {
    client: RealtimeClient,
    vad: VadConfig,
    mode: TurnDetectionMode,
    sink: Arc<dyn EventSink>,
    pipeline: Option<VoicePipeline>,
    forwarder: Option<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn new(config: &Config, connector: Arc<dyn Connector>, sink: Arc<dyn EventSink>) -> Self {
        let client = RealtimeClient::spawn(
            &config.connection,
            config.session.clone(),
            connector,
            Arc::clone(&sink),
        );
        Self {
            client,
            vad: config.vad.clone(),
            mode: config.session.turn_detection_mode(),
            sink,
            pipeline: None,
            forwarder: None,
        }
    }

    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    pub fn is_voice_active(&self) -> bool {
        self.pipeline.as_ref().is_some_and(VoicePipeline::is_running)
    }

    pub fn connect(&self) -> Result<()> {
        self.client.connect()
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.stop_voice_input().await;
        self.client.disconnect()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.client.send_text(text)
    }

    pub fn cancel_response(&self) -> Result<()> {
        self.client.cancel_response()
    }

    /// Start streaming `device` through the VAD into the open session.
    pub async fn start_voice_input(&mut self, device: Box<dyn CaptureDevice>) -> Result<()> {
        if !self.client.is_open() {
            return Err(Error::Connection(format!(
                "cannot start voice input while {}",
                self.client.state()
            )));
        }
        self.stop_voice_input().await;

        let (tx, rx) = mpsc::channel(VAD_EVENT_BUFFER);
        let pipeline = match VoicePipeline::start(device, self.vad.clone(), self.mode, tx).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                if e.kind() == ErrorKind::Device {
                    self.sink.on_error(ErrorKind::Device, &e.to_string());
                }
                return Err(e);
            }
        };

        self.forwarder = Some(tokio::spawn(forward_events(
            rx,
            self.client.clone(),
            self.mode,
            Arc::clone(&self.sink),
        )));
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Stop capture; the remaining utterance is flushed and committed first.
    pub async fn stop_voice_input(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                tracing::warn!(error = %e, "VAD forwarder ended abnormally");
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.stop_voice_input().await;
        self.client.shutdown().await;
    }
}

async fn forward_events(
    mut events: mpsc::Receiver<VadEvent>,
    client: RealtimeClient,
    mode: TurnDetectionMode,
    sink: Arc<dyn EventSink>,
) {
    // Chunks appended since the last commit.
    let mut uncommitted = 0usize;

    while let Some(event) = events.recv().await {
        let result = match event {
            VadEvent::SpeechStarted => client.notify_local_speech(true),
            VadEvent::SpeechStopped => client.notify_local_speech(false).and_then(|()| {
                if mode == TurnDetectionMode::ClientVad && uncommitted > 0 && client.is_open() {
                    uncommitted = 0;
                    client.commit_audio_buffer()
                } else {
                    Ok(())
                }
            }),
            VadEvent::Chunk(chunk) => {
                if client.is_open() {
                    uncommitted += 1;
                    client.send_audio_chunk(chunk.wav)
                } else {
                    tracing::debug!(bytes = chunk.wav.len(), "Dropping audio chunk, connection not open");
                    Ok(())
                }
            }
            VadEvent::DeviceError(message) => {
                sink.on_error(ErrorKind::Device, &message);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "VAD event not delivered");
        }
    }
}
