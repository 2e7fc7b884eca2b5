//! Frequency-domain energy meter for voice activity detection.
//!
//! Keeps a sliding window of the most recent samples and, on demand,
//! reduces its spectrum to one scalar in byte units (0–255): the mean of
//! all bins after Blackman windowing, per-bin temporal smoothing, and
//! decibel scaling between `min_db` and `max_db`.

use std::collections::VecDeque;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

/// Default FFT window length.
pub const DEFAULT_FFT_SIZE: usize = 2048;

const DEFAULT_SMOOTHING: f32 = 0.8;
const DEFAULT_MIN_DB: f32 = -100.0;
const DEFAULT_MAX_DB: f32 = -30.0;

pub struct EnergyMeter {
    fft_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Most recent `fft_size` samples.
    history: VecDeque<f32>,
    /// Smoothed magnitude per bin.
    smoothed: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl EnergyMeter {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();

        Self {
            fft_size,
            window: blackman_window(fft_size),
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
            input,
            spectrum,
            fft,
            smoothing: DEFAULT_SMOOTHING,
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Feed newly captured samples.
    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            if self.history.len() == self.fft_size {
                self.history.pop_front();
            }
            self.history.push_back(s);
        }
    }

    /// Current energy reading in byte units (0–255).
    pub fn level(&mut self) -> f32 {
        for (i, (dst, &src)) in self.input.iter_mut().zip(self.history.iter()).enumerate() {
            *dst = src * self.window[i];
        }

        if self.fft.process(&mut self.input, &mut self.spectrum).is_err() {
            tracing::warn!(fft_size = self.fft_size, "FFT failed, reporting silence");
            return 0.0;
        }

        let scale = 1.0 / self.fft_size as f32;
        let range = self.max_db - self.min_db;
        let mut sum = 0.0f32;

        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.spectrum[bin].norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;

            let db = if *smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                self.min_db
            };
            sum += (255.0 * (db - self.min_db) / range).clamp(0.0, 255.0);
        }

        sum / self.smoothed.len() as f32
    }

    /// Forget all history and smoothing state.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }
}

impl Default for EnergyMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn silence_reads_zero() {
        let mut meter = EnergyMeter::default();
        meter.push(&[0.0; 4096]);
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn tone_reads_above_silence() {
        let mut meter = EnergyMeter::default();
        meter.push(&sine(440.0, 0.5, 4096));
        let mut level = 0.0;
        for _ in 0..10 {
            level = meter.level();
        }
        assert!(level > 0.0, "expected positive level, got {level}");
        assert!(level <= 255.0);
    }

    #[test]
    fn louder_input_reads_higher() {
        let mut quiet = EnergyMeter::default();
        let mut loud = EnergyMeter::default();
        quiet.push(&sine(300.0, 0.01, 2048));
        loud.push(&sine(300.0, 0.8, 2048));
        let (mut q, mut l) = (0.0, 0.0);
        for _ in 0..10 {
            q = quiet.level();
            l = loud.level();
        }
        assert!(l > q, "loud {l} should exceed quiet {q}");
    }

    #[test]
    fn reset_clears_history() {
        let mut meter = EnergyMeter::default();
        meter.push(&sine(440.0, 0.5, 2048));
        meter.level();
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn fft_size_rounds_to_power_of_two() {
        assert_eq!(EnergyMeter::new(1000).fft_size(), 1024);
    }
}
