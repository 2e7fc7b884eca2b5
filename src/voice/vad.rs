//! Voice activity pipeline.
//!
//! [`VoiceActivityDetector`] is the pure state machine: feed it captured
//! frames and periodic energy readings, collect [`VadEvent`]s.
//! [`VoicePipeline`] drives it from a [`CaptureDevice`] on a tokio task,
//! polling an [`EnergyMeter`] at a fixed interval.
//!
//! ```text
//!            energy > baseline
//!   Silence ───────────────────▸ Speaking
//!      ▴                            │
//!      └──── delay_frame_limit ─────┘
//!            consecutive lows
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::capture::CaptureDevice;
use super::codec;
use super::energy::EnergyMeter;
use super::protocol::TurnDetectionMode;
use crate::error::{Error, Result};

/// Baseline smoothing: `avg = avg * BASELINE_DECAY + reading * (1 - BASELINE_DECAY)`.
const BASELINE_DECAY: f32 = 0.95;

// ── Configuration ────────────────────────────────────────────────

/// Voice activity pipeline tuning.
///
/// Recommended: keep `poll_interval_ms * delay_frame_limit` near two
/// seconds so ordinary pauses do not split an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Capture rate requested from the device.
    pub sample_rate: u32,
    /// Rate of the PCM sent to the remote.
    pub target_sample_rate: u32,
    /// Samples per captured frame.
    pub frame_size: usize,
    /// Energy poll period.
    pub poll_interval_ms: u64,
    /// Consecutive below-baseline polls that end an utterance.
    pub delay_frame_limit: u32,
    /// Encoded (WAV) size above which the utterance buffer is flushed.
    pub chunk_threshold_bytes: usize,
    /// Pre-onset frames retained while silent.
    pub lookahead_frames: usize,
    /// Energy meter FFT window.
    pub fft_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            target_sample_rate: 16000,
            frame_size: 4096,
            poll_interval_ms: 100,
            delay_frame_limit: 20,
            chunk_threshold_bytes: 10_000,
            lookahead_frames: 4,
            fft_size: 2048,
        }
    }
}

impl VadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.target_sample_rate == 0 {
            return Err(Error::Config("vad sample rates must be non-zero".into()));
        }
        if self.frame_size == 0 {
            return Err(Error::Config("vad.frame_size must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("vad.poll_interval_ms must be non-zero".into()));
        }
        if self.delay_frame_limit == 0 {
            return Err(Error::Config("vad.delay_frame_limit must be at least 1".into()));
        }
        if self.chunk_threshold_bytes <= codec::WAV_HEADER_LEN {
            return Err(Error::Config(format!(
                "vad.chunk_threshold_bytes must exceed the {}-byte WAV header",
                codec::WAV_HEADER_LEN
            )));
        }
        Ok(())
    }
}

// ── Detector ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speaking,
}

/// One encoded utterance segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Mono PCM16 WAV at the target rate.
    pub wav: Vec<u8>,
    /// Captured samples the chunk was encoded from.
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechStopped,
    Chunk(AudioChunk),
    /// Capture failed; the pipeline has stopped.
    DeviceError(String),
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    mode: TurnDetectionMode,
    state: VadState,
    baseline: Option<f32>,
    trailing: u32,
    lookahead: VecDeque<Vec<f32>>,
    buffer: Vec<f32>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig, mode: TurnDetectionMode) -> Self {
        Self {
            config,
            mode,
            state: VadState::Silence,
            baseline: None,
            trailing: 0,
            lookahead: VecDeque::new(),
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Record one captured frame. May flush a chunk when the buffer is full.
    pub fn push_frame(&mut self, samples: &[f32]) -> Result<Vec<VadEvent>> {
        match (self.mode, self.state) {
            (TurnDetectionMode::ClientVad, VadState::Speaking) => {
                for frame in self.lookahead.drain(..) {
                    self.buffer.extend_from_slice(&frame);
                }
                self.buffer.extend_from_slice(samples);
            }
            (TurnDetectionMode::ClientVad, VadState::Silence) => {
                self.lookahead.push_back(samples.to_vec());
                while self.lookahead.len() > self.config.lookahead_frames {
                    self.lookahead.pop_front();
                }
            }
            (TurnDetectionMode::ServerVad, _) => {
                self.buffer.extend_from_slice(samples);
            }
        }

        let mut events = Vec::new();
        if self.encoded_len() > self.config.chunk_threshold_bytes {
            events.push(VadEvent::Chunk(self.flush()?));
        }
        Ok(events)
    }

    /// Classify one energy reading against the adaptive baseline.
    pub fn poll(&mut self, energy: f32) -> Result<Vec<VadEvent>> {
        let mut events = Vec::new();
        let Some(baseline) = self.baseline else {
            self.baseline = Some(energy);
            return Ok(events);
        };

        if energy > baseline {
            if self.state == VadState::Silence {
                tracing::debug!(energy, baseline, "Speech started");
                self.state = VadState::Speaking;
                events.push(VadEvent::SpeechStarted);
            }
            self.trailing = 0;
        } else {
            self.trailing = self.trailing.saturating_add(1);
            if self.state == VadState::Speaking && self.trailing >= self.config.delay_frame_limit {
                tracing::debug!(trailing = self.trailing, baseline, "Speech stopped");
                self.state = VadState::Silence;
                if !self.buffer.is_empty() {
                    events.push(VadEvent::Chunk(self.flush()?));
                }
                events.push(VadEvent::SpeechStopped);
            }
        }

        self.baseline = Some(baseline * BASELINE_DECAY + energy * (1.0 - BASELINE_DECAY));
        Ok(events)
    }

    /// End of input: flush the remainder and close an open utterance.
    pub fn finish(&mut self) -> Result<Vec<VadEvent>> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            events.push(VadEvent::Chunk(self.flush()?));
        }
        if self.state == VadState::Speaking {
            events.push(VadEvent::SpeechStopped);
        }
        self.reset();
        Ok(events)
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.baseline = None;
        self.trailing = 0;
        self.lookahead.clear();
        self.buffer.clear();
    }

    fn encoded_len(&self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        codec::wav_len(codec::resampled_len(
            self.buffer.len(),
            self.config.sample_rate,
            self.config.target_sample_rate,
        ))
    }

    fn flush(&mut self) -> Result<AudioChunk> {
        let samples = self.buffer.len();
        let wav = codec::encode_wav(
            &self.buffer,
            self.config.sample_rate,
            self.config.target_sample_rate,
        )?;
        self.buffer.clear();
        Ok(AudioChunk { wav, samples })
    }
}

// ── Pipeline driver ──────────────────────────────────────────────

/// Running capture → energy → detector loop.
pub struct VoicePipeline {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl VoicePipeline {
    /// Start capturing and stream detector events into `events`.
    ///
    /// Capture start failures are returned directly; later device failures
    /// arrive as [`VadEvent::DeviceError`] and end the pipeline.
    pub async fn start(
        mut device: Box<dyn CaptureDevice>,
        config: VadConfig,
        mode: TurnDetectionMode,
        events: mpsc::Sender<VadEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let frames = device
            .start_capture(config.sample_rate, config.frame_size)
            .await?;
        tracing::info!(
            sample_rate = config.sample_rate,
            frame_size = config.frame_size,
            mode = ?mode,
            "Voice input started"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_pipeline(device, frames, config, mode, events, stop_rx));
        Ok(Self {
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop capturing. The remainder is flushed before this returns.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Voice pipeline task ended abnormally");
            }
        }
    }
}

async fn run_pipeline(
    mut device: Box<dyn CaptureDevice>,
    mut frames: mpsc::Receiver<Result<crate::voice::capture::CaptureFrame>>,
    config: VadConfig,
    mode: TurnDetectionMode,
    events: mpsc::Sender<VadEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut meter = EnergyMeter::new(config.fft_size);
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detector = VoiceActivityDetector::new(config, mode);
    let mut frame_count: u64 = 0;

    loop {
        let produced = tokio::select! {
            _ = &mut stop => {
                tracing::debug!(frames = frame_count, "Voice input stop requested");
                let flushed = detector.finish();
                forward(&events, flushed).await;
                break;
            }
            frame = frames.recv() => match frame {
                Some(Ok(frame)) => {
                    frame_count += 1;
                    meter.push(&frame.samples);
                    detector.push_frame(&frame.samples)
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Capture device failed");
                    report_device_failure(&mut detector, &events, &e).await;
                    break;
                }
                None => {
                    tracing::debug!(frames = frame_count, "Capture stream ended");
                    let flushed = detector.finish();
                    forward(&events, flushed).await;
                    break;
                }
            },
            _ = ticker.tick() => detector.poll(meter.level()),
        };
        if !forward(&events, produced).await {
            break;
        }
    }

    device.stop_capture().await;
    tracing::info!("Voice input stopped");
}

/// Close any open utterance, then report the failure.
async fn report_device_failure(
    detector: &mut VoiceActivityDetector,
    events: &mpsc::Sender<VadEvent>,
    error: &Error,
) {
    if forward(events, detector.finish()).await {
        let _ = events.send(VadEvent::DeviceError(error.to_string())).await;
    }
}

/// Returns `false` once nobody is listening.
async fn forward(events: &mpsc::Sender<VadEvent>, produced: Result<Vec<VadEvent>>) -> bool {
    match produced {
        Ok(batch) => {
            for event in batch {
                if events.send(event).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable audio segment");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::capture::CaptureFrame;
    use async_trait::async_trait;

    fn test_config() -> VadConfig {
        VadConfig {
            frame_size: 160,
            ..VadConfig::default()
        }
    }

    fn frame(value: f32) -> Vec<f32> {
        vec![value; 160]
    }

    /// Push one frame before each poll, like the live loop does.
    fn drive(detector: &mut VoiceActivityDetector, energies: &[f32]) -> Vec<(usize, VadEvent)> {
        let mut out = Vec::new();
        for (i, &energy) in energies.iter().enumerate() {
            for e in detector.push_frame(&frame(0.01 * (i % 50) as f32)).unwrap() {
                out.push((i, e));
            }
            for e in detector.poll(energy).unwrap() {
                out.push((i, e));
            }
        }
        out
    }

    fn count(events: &[(usize, VadEvent)], pred: impl Fn(&VadEvent) -> bool) -> usize {
        events.iter().filter(|(_, e)| pred(e)).count()
    }

    #[test]
    fn single_utterance_with_trailing_silence() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        let mut energies = vec![5.0, 5.0, 60.0, 62.0, 58.0];
        energies.extend(std::iter::repeat(4.0).take(25));

        let events = drive(&mut detector, &energies);

        let started: Vec<usize> = events
            .iter()
            .filter(|(_, e)| *e == VadEvent::SpeechStarted)
            .map(|(i, _)| *i)
            .collect();
        let stopped: Vec<usize> = events
            .iter()
            .filter(|(_, e)| *e == VadEvent::SpeechStopped)
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(started, vec![2]);
        // 20th consecutive low reading.
        assert_eq!(stopped, vec![24]);

        let chunks: Vec<&AudioChunk> = events
            .iter()
            .filter_map(|(_, e)| match e {
                VadEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 1);
        // Three pre-onset frames plus frames 3..=24.
        assert_eq!(chunks[0].samples, 25 * 160);

        // Remainder flushed before the stop event.
        let chunk_pos = events.iter().position(|(_, e)| matches!(e, VadEvent::Chunk(_)));
        let stop_pos = events.iter().position(|(_, e)| *e == VadEvent::SpeechStopped);
        assert!(chunk_pos < stop_pos);
        assert_eq!(detector.state(), VadState::Silence);
        assert_eq!(detector.buffered_samples(), 0);
    }

    #[test]
    fn short_pause_does_not_fragment() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        let mut energies = vec![5.0, 5.0, 60.0];
        energies.extend(std::iter::repeat(4.0).take(19));
        energies.push(90.0);
        energies.extend(std::iter::repeat(4.0).take(10));

        let events = drive(&mut detector, &energies);
        assert_eq!(count(&events, |e| *e == VadEvent::SpeechStarted), 1);
        assert_eq!(count(&events, |e| *e == VadEvent::SpeechStopped), 0);
        assert_eq!(detector.state(), VadState::Speaking);
    }

    #[test]
    fn baseline_starts_at_first_reading_and_smooths() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        assert!(detector.poll(10.0).unwrap().is_empty());
        assert_eq!(detector.baseline(), Some(10.0));
        detector.poll(30.0).unwrap();
        let baseline = detector.baseline().unwrap();
        assert!((baseline - 11.0).abs() < 1e-4, "baseline {baseline}");
    }

    #[test]
    fn lookahead_is_prefix_of_first_chunk() {
        let config = VadConfig {
            lookahead_frames: 2,
            ..test_config()
        };
        let mut detector = VoiceActivityDetector::new(config, TurnDetectionMode::ClientVad);

        detector.poll(5.0).unwrap();
        for value in [0.1, 0.2, 0.3] {
            detector.push_frame(&frame(value)).unwrap();
        }
        assert_eq!(detector.poll(50.0).unwrap(), vec![VadEvent::SpeechStarted]);
        detector.push_frame(&frame(0.9)).unwrap();

        let events = detector.finish().unwrap();
        let VadEvent::Chunk(chunk) = &events[0] else {
            panic!("Expected chunk, got {events:?}");
        };

        let mut expected = codec::float_to_pcm16(&frame(0.2), 16000, 16000).unwrap();
        expected.extend(codec::float_to_pcm16(&frame(0.3), 16000, 16000).unwrap());
        let payload = &chunk.wav[codec::WAV_HEADER_LEN..];
        assert_eq!(&payload[..expected.len()], expected.as_slice());
        // Oldest frame fell out of the window.
        assert_eq!(chunk.samples, 3 * 160);
        assert_eq!(events[1], VadEvent::SpeechStopped);
    }

    #[test]
    fn long_utterance_is_flushed_at_threshold() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        detector.poll(1.0).unwrap();
        detector.poll(50.0).unwrap();

        let mut chunks = Vec::new();
        for _ in 0..80 {
            for event in detector.push_frame(&frame(0.5)).unwrap() {
                if let VadEvent::Chunk(chunk) = event {
                    chunks.push(chunk);
                }
            }
        }
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.wav.len() > 10_000);
            // One frame past the threshold, never more.
            assert!(chunk.wav.len() <= 10_000 + 2 * 160);
        }
        assert!(detector.buffered_samples() < 32 * 160);
    }

    #[test]
    fn silence_is_not_recorded_in_client_mode() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        detector.poll(5.0).unwrap();
        for _ in 0..100 {
            assert!(detector.push_frame(&frame(0.0)).unwrap().is_empty());
        }
        assert_eq!(detector.buffered_samples(), 0);
        assert!(detector.finish().unwrap().is_empty());
    }

    #[test]
    fn server_mode_forwards_everything() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ServerVad);
        let mut chunks = 0;
        for _ in 0..100 {
            chunks += detector
                .push_frame(&frame(0.0))
                .unwrap()
                .iter()
                .filter(|e| matches!(e, VadEvent::Chunk(_)))
                .count();
        }
        assert!(chunks >= 3);
    }

    #[test]
    fn validate_rejects_zero_limit() {
        let config = VadConfig {
            delay_frame_limit: 0,
            ..VadConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(VadConfig::default().validate().is_ok());
    }

    struct FailingDevice;

    #[async_trait]
    impl CaptureDevice for FailingDevice {
        async fn start_capture(
            &mut self,
            _sample_rate: u32,
            _frame_size: usize,
        ) -> Result<mpsc::Receiver<Result<CaptureFrame>>> {
            let (tx, rx) = mpsc::channel(4);
            tx.send(Ok(CaptureFrame {
                samples: vec![0.0; 160],
                timestamp: tokio::time::Instant::now(),
            }))
            .await
            .unwrap();
            tx.send(Err(Error::Device("unplugged".into()))).await.unwrap();
            Ok(rx)
        }

        async fn stop_capture(&mut self) {}
    }

    #[tokio::test]
    async fn device_failure_closes_open_utterance_first() {
        let mut detector = VoiceActivityDetector::new(test_config(), TurnDetectionMode::ClientVad);
        detector.poll(5.0).unwrap();
        detector.poll(50.0).unwrap();
        detector.push_frame(&frame(0.4)).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        report_device_failure(&mut detector, &tx, &Error::Device("unplugged".into())).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3, "{events:?}");
        assert!(matches!(&events[0], VadEvent::Chunk(c) if c.samples == 160));
        assert_eq!(events[1], VadEvent::SpeechStopped);
        assert!(matches!(&events[2], VadEvent::DeviceError(m) if m.contains("unplugged")));
        assert_eq!(detector.state(), VadState::Silence);
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_stops_pipeline() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut pipeline = VoicePipeline::start(
            Box::new(FailingDevice),
            test_config(),
            TurnDetectionMode::ClientVad,
            tx,
        )
        .await
        .unwrap();

        let mut saw_error = false;
        while let Some(event) = rx.recv().await {
            if let VadEvent::DeviceError(message) = event {
                assert!(message.contains("unplugged"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        pipeline.stop().await;
        assert!(!pipeline.is_running());
    }
}
