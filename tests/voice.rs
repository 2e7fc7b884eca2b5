//! Voice input integration tests
//!
//! Paced synthetic audio → VAD pipeline → shim → client → scripted server.
//! No audio hardware required.

use std::sync::Arc;

use base64::Engine;

use realtime_voice::voice::codec::WAV_HEADER_LEN;
use realtime_voice::voice::protocol::TurnDetectionMode;
use realtime_voice::voice::session::ConnectionState;
use realtime_voice::{ChannelSink, Config, ErrorKind, UiEvent, VoiceSession};

mod common;
use common::{
    collect_until, connection_config, sine, silence, wait_for, PacedCapture, ScriptedConnector,
    ServerConn,
};

const RATE: u32 = 16000;

fn voice_config(mode: TurnDetectionMode) -> Config {
    let mut config = Config {
        connection: connection_config(),
        ..Config::default()
    };
    config.session.turn_detection.mode = mode;
    config.vad.frame_size = 1600;
    config
}

async fn open_session(
    config: &Config,
) -> (
    VoiceSession,
    ServerConn,
    tokio::sync::mpsc::UnboundedReceiver<UiEvent>,
) {
    let (connector, mut servers) = ScriptedConnector::new(vec![]);
    let (sink, mut events) = ChannelSink::new();
    let session = VoiceSession::new(config, connector, Arc::new(sink));
    session.connect().unwrap();
    let server = servers.recv().await.unwrap();
    wait_for(&mut events, &UiEvent::Connection(ConnectionState::Open)).await;
    (session, server, events)
}

fn utterance() -> Vec<f32> {
    let mut samples = silence(0.5, RATE);
    samples.extend(sine(440.0, 0.5, 1.0, RATE));
    samples.extend(silence(6.0, RATE));
    samples
}

fn decode_audio(frame: &serde_json::Value) -> Vec<u8> {
    let text = frame["audio"].as_str().expect("append carries audio");
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .expect("audio is base64")
}

#[tokio::test(start_paused = true)]
async fn spoken_turn_is_streamed_then_committed() {
    let config = voice_config(TurnDetectionMode::ClientVad);
    let (mut session, mut server, mut events) = open_session(&config).await;

    session
        .start_voice_input(Box::new(PacedCapture::new(utterance())))
        .await
        .unwrap();

    let mut appended = Vec::new();
    loop {
        let frame = server.next_non_heartbeat().await;
        match frame["type"].as_str() {
            Some("input_audio_buffer.append") => appended.push(decode_audio(&frame)),
            Some("input_audio_buffer.commit") => break,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    assert!(!appended.is_empty());
    for wav in &appended {
        assert_eq!(&wav[0..4], b"RIFF");
        assert!(wav.len() > WAV_HEADER_LEN);
    }
    // Every chunk but the final remainder crossed the size threshold.
    for wav in &appended[..appended.len() - 1] {
        assert!(wav.len() > config.vad.chunk_threshold_bytes);
    }

    let activity = collect_until(&mut events, |e| *e == UiEvent::SpeechActivity(false)).await;
    assert!(activity.contains(&UiEvent::SpeechActivity(true)));

    session.stop_voice_input().await;
    assert!(!session.is_voice_active());
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn server_vad_streams_without_committing() {
    let config = voice_config(TurnDetectionMode::ServerVad);
    let (mut session, mut server, _events) = open_session(&config).await;

    session
        .start_voice_input(Box::new(PacedCapture::new(silence(2.0, RATE))))
        .await
        .unwrap();

    // Silence is forwarded too when the remote decides turn boundaries.
    let first = server.expect_type("input_audio_buffer.append").await;
    assert_eq!(&decode_audio(&first)[0..4], b"RIFF");

    session.stop_voice_input().await;
    while let Ok(frame) =
        tokio::time::timeout(std::time::Duration::from_millis(10), server.next_frame()).await
    {
        assert_ne!(frame["type"], "input_audio_buffer.commit");
    }
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn voice_input_requires_open_connection() {
    let config = voice_config(TurnDetectionMode::ClientVad);
    let (connector, _servers) = ScriptedConnector::new(vec![]);
    let (sink, _events) = ChannelSink::new();
    let mut session = VoiceSession::new(&config, connector, Arc::new(sink));

    let err = session
        .start_voice_input(Box::new(PacedCapture::new(utterance())))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_wav_device_is_reported() {
    let config = voice_config(TurnDetectionMode::ClientVad);
    let (mut session, _server, mut events) = open_session(&config).await;

    let device = realtime_voice::voice::WavFileCapture::new("/nonexistent/speech.wav");
    let err = session.start_voice_input(Box::new(device)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);

    let seen = collect_until(&mut events, |e| matches!(e, UiEvent::Error { .. })).await;
    assert!(matches!(
        seen.last(),
        Some(UiEvent::Error { kind: ErrorKind::Device, .. })
    ));
    assert_eq!(session.client().state(), ConnectionState::Open);
    session.shutdown().await;
}
