//! Loudness sampling for voice activity detection
//!
//! The meter analyses the most recent `fft_size` samples of the open capture
//! stream on every control-loop tick. Loudness is reported on the 0–255 byte
//! scale of a browser `AnalyserNode`: Blackman window, real FFT, per-bin
//! magnitude smoothed over time, converted to dB and mapped linearly from
//! `[min_decibels, max_decibels]` onto `0..=255`. The sample value is the mean
//! over all positive-frequency bins.

use crate::audio::buffer::AudioRingBuffer;
use crate::audio::input::CaptureStream;
use crate::{Result, VoiceError};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Deserialize;
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Analyser configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Analysis window in samples (power of two)
    pub fft_size: usize,

    /// Magnitude mapped to byte 0
    pub min_decibels: f32,

    /// Magnitude mapped to byte 255
    pub max_decibels: f32,

    /// Weight of the previous poll's magnitudes (0.0 = no smoothing)
    pub smoothing_time_constant: f32,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            min_decibels: -100.0,
            max_decibels: -30.0,
            smoothing_time_constant: 0.8,
        }
    }
}

impl LevelConfig {
    /// Disable temporal smoothing
    pub fn without_smoothing(mut self) -> Self {
        self.smoothing_time_constant = 0.0;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(VoiceError::ConfigError(format!(
                "fft_size must be a power of two >= 32, got {}",
                self.fft_size
            )));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(VoiceError::ConfigError(format!(
                "min_decibels ({}) must be below max_decibels ({})",
                self.min_decibels, self.max_decibels
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing_time_constant) {
            return Err(VoiceError::ConfigError(format!(
                "smoothing_time_constant must be in [0, 1), got {}",
                self.smoothing_time_constant
            )));
        }
        Ok(())
    }
}

/// One loudness measurement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoudnessSample {
    /// Mean byte-scaled magnitude, 0.0–255.0
    pub value: f32,
    /// Clock time of the poll
    pub timestamp_ms: u64,
}

impl LoudnessSample {
    pub fn new(value: f32, timestamp_ms: u64) -> Self {
        Self {
            value,
            timestamp_ms,
        }
    }
}

/// Spectral analyser producing byte-scaled mean magnitudes
pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    config: LevelConfig,
}

impl SpectrumAnalyser {
    pub fn new(config: &LevelConfig) -> Self {
        let n = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(n);

        // Blackman window, as used by the Web Audio analyser
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            smoothed: vec![0.0; n / 2],
            scratch: vec![Complex::new(0.0, 0.0); n],
            config: config.clone(),
        }
    }

    /// Analyse the last `fft_size` samples and return the mean byte level
    ///
    /// Shorter input is zero-padded at the front.
    pub fn mean_level(&mut self, samples: &[f32]) -> f32 {
        let n = self.config.fft_size;
        let tail = &samples[samples.len().saturating_sub(n)..];
        let pad = n - tail.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let tau = self.config.smoothing_time_constant;
        let range = self.config.max_decibels - self.config.min_decibels;
        let mut total = 0.0f32;

        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[k].norm() / n as f32;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;

            let db = 20.0 * smoothed.log10();
            let byte = (255.0 / range * (db - self.config.min_decibels))
                .floor()
                .clamp(0.0, 255.0);
            total += byte;
        }

        total / self.smoothed.len() as f32
    }

    /// Forget smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }
}

/// Level meter attached to one capture stream
pub struct LevelMeter {
    window: Option<AudioRingBuffer>,
    analyser: SpectrumAnalyser,
    polls: u64,
}

impl LevelMeter {
    /// Attach a meter to an open capture stream
    ///
    /// # Errors
    /// `DeviceUnavailable` if the stream's device has already been released.
    pub fn open(stream: &CaptureStream, config: &LevelConfig) -> Result<Self> {
        if stream.is_released() {
            return Err(VoiceError::DeviceUnavailable(
                "capture stream already released".into(),
            ));
        }

        debug!(
            "Level meter opened on capture {} ({} sample window)",
            stream.id(),
            config.fft_size
        );

        Ok(Self {
            window: Some(stream.window()),
            analyser: SpectrumAnalyser::new(config),
            polls: 0,
        })
    }

    /// Take one loudness sample, or `None` once closed
    pub fn poll(&mut self, now_ms: u64) -> Option<LoudnessSample> {
        let window = self.window.as_ref()?;
        let value = self.analyser.mean_level(&window.latest());
        self.polls += 1;
        Some(LoudnessSample::new(value, now_ms))
    }

    /// Number of samples taken since open
    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn is_open(&self) -> bool {
        self.window.is_some()
    }

    /// Detach from the stream; safe to call repeatedly
    pub fn close(&mut self) {
        if self.window.take().is_some() {
            self.analyser.reset();
            debug!("Level meter closed after {} polls", self.polls);
        }
    }
}
