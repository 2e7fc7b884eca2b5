//! Audio capture collaborator.
//!
//! A device yields fixed-size blocks of mono `f32` samples at the requested
//! rate. Failures travel in-band as `Err` items so the pipeline can report
//! them and stop.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One block of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
    /// Capture time of the first sample.
    pub timestamp: Instant,
}

#[async_trait]
pub trait CaptureDevice: Send {
    /// Start producing frames at `sample_rate`. The stream ends when the
    /// device stops; an `Err` item means the device failed.
    async fn start_capture(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<Result<CaptureFrame>>>;

    async fn stop_capture(&mut self);
}

/// Replays a WAV file in real time, standing in for a microphone.
pub struct WavFileCapture {
    path: PathBuf,
    /// Silence appended after the file so trailing-silence detection can fire.
    tail: Duration,
    task: Option<JoinHandle<()>>,
}

impl WavFileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail: Duration::from_secs(3),
            task: None,
        }
    }

    #[must_use]
    pub fn with_tail(mut self, tail: Duration) -> Self {
        self.tail = tail;
        self
    }

    fn read_mono(&self, sample_rate: u32) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::open(&self.path)
            .map_err(|e| Error::Device(format!("cannot open {}: {e}", self.path.display())))?;
        let spec = reader.spec();
        if spec.sample_rate != sample_rate {
            return Err(Error::Device(format!(
                "{} is {} Hz, capture requested {sample_rate} Hz",
                self.path.display(),
                spec.sample_rate
            )));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Device(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::Device(e.to_string()))?
            }
        };

        let channels = usize::from(spec.channels.max(1));
        Ok(interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect())
    }
}

#[async_trait]
impl CaptureDevice for WavFileCapture {
    async fn start_capture(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<mpsc::Receiver<Result<CaptureFrame>>> {
        if frame_size == 0 || sample_rate == 0 {
            return Err(Error::Device("frame size and sample rate must be non-zero".into()));
        }
        self.stop_capture().await;

        let mut samples = self.read_mono(sample_rate)?;
        let tail = (self.tail.as_secs_f64() * f64::from(sample_rate)) as usize;
        samples.resize(samples.len() + tail, 0.0);

        tracing::info!(
            path = %self.path.display(),
            seconds = samples.len() as f64 / f64::from(sample_rate),
            "Replaying WAV file as capture device"
        );

        let frame_period = Duration::from_secs_f64(frame_size as f64 / f64::from(sample_rate));
        let (tx, rx) = mpsc::channel(32);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_period);
            for block in samples.chunks(frame_size) {
                ticker.tick().await;
                let mut block = block.to_vec();
                block.resize(frame_size, 0.0);
                let frame = CaptureFrame {
                    samples: block,
                    timestamp: Instant::now(),
                };
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            tracing::debug!("WAV capture finished");
        }));
        Ok(rx)
    }

    async fn stop_capture(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
