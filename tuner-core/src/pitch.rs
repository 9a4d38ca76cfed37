//! # Pitch Detection Module
//!
//! Turns one analysis window into a fundamental frequency estimate with a
//! confidence score.
//!
//! ## Features
//! - Window-normalized autocorrelation (default): Hann window, FFT
//!   autocorrelation, division by the window's own autocorrelation so a
//!   periodic signal scores ~1 at its period
//! - YIN cumulative mean normalized difference as an alternative estimator
//! - Noise gate on the frame's RMS level
//! - Parabolic interpolation for sub-sample lag accuracy
//!
//! A window that cannot be analyzed confidently is never an error: it yields
//! an estimate with zero frequency and zero confidence.

use std::ops::RangeInclusive;

use crate::AudioFrame;
use crate::config::{Estimator, TunerConfig};
use crate::error::Result;
use crate::fft::{self, Autocorrelator};

/// A peak within this fraction of the highest peak wins if it sits at a
/// shorter lag. Keeps a sine from being reported an octave low when its
/// second period correlates as well as its first.
const PEAK_TOLERANCE: f32 = 0.9;

/// Fundamental frequency estimate for one analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Estimated fundamental in Hz, 0.0 when no pitch was found.
    pub frequency_hz: f32,
    /// Clarity of the estimate in [0, 1], 0.0 when no pitch was found.
    pub confidence: f32,
    /// Index of the analyzed frame; strictly increasing.
    pub frame_index: u64,
    /// RMS level of the frame in dBFS.
    pub amplitude_db: f32,
}

impl PitchEstimate {
    /// An estimate carrying no pitch (silence, noise or an unusable window).
    pub fn unpitched(frame_index: u64, amplitude_db: f32) -> Self {
        Self {
            frequency_hz: 0.0,
            confidence: 0.0,
            frame_index,
            amplitude_db,
        }
    }

    pub fn is_pitched(&self) -> bool {
        self.frequency_hz > 0.0 && self.confidence > 0.0
    }
}

/// Pitch estimator with all of its buffers allocated up front.
pub struct FrameAnalyzer {
    estimator: Estimator,
    sample_rate: u32,
    window_size: usize,
    min_lag: usize,
    max_lag: usize,
    min_peak_height: f32,
    noise_floor_db: f32,
    yin_threshold: f32,
    /// Hann coefficients.
    window: Vec<f32>,
    /// Autocorrelation of the Hann window normalized to 1 at lag 0.
    window_acf: Vec<f32>,
    autocorrelator: Autocorrelator,
    conditioned: Vec<f32>,
    weighted: Vec<f32>,
    /// Normalized autocorrelation (or YIN difference) for lags 0..=max_lag+1.
    lag_buffer: Vec<f32>,
}

impl FrameAnalyzer {
    /// Builds an analyzer for frames captured at `sample_rate`.
    ///
    /// Fails with `InsufficientWindow` when the window cannot hold two periods
    /// of the lowest searchable frequency at this rate.
    pub fn new(config: &TunerConfig, sample_rate: u32) -> Result<Self> {
        config.validate_for_rate(sample_rate)?;

        let window_size = config.window_size;
        let min_lag = config.min_lag(sample_rate);
        let max_lag = config.max_lag(sample_rate);
        let lags = max_lag + 2;

        let window = fft::hann_window(window_size);
        let mut autocorrelator = Autocorrelator::new(window_size);
        let mut window_acf = vec![0.0; lags];
        autocorrelator.compute(&window, &mut window_acf);
        let energy = window_acf[0];
        for value in window_acf.iter_mut() {
            *value /= energy;
        }

        log::debug!(
            "Frame analyzer: {:?}, {} Hz, window {}, lags {}..={}",
            config.estimator,
            sample_rate,
            window_size,
            min_lag,
            max_lag
        );

        Ok(Self {
            estimator: config.estimator,
            sample_rate,
            window_size,
            min_lag,
            max_lag,
            min_peak_height: config.min_peak_height,
            noise_floor_db: config.noise_floor_db,
            yin_threshold: config.yin_threshold,
            window,
            window_acf,
            autocorrelator,
            conditioned: vec![0.0; window_size],
            weighted: vec![0.0; window_size],
            lag_buffer: vec![0.0; lags],
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Estimates the fundamental frequency of one frame.
    pub fn analyze(&mut self, frame: &AudioFrame) -> PitchEstimate {
        let samples = frame.samples();
        if samples.len() != self.window_size || frame.sample_rate() != self.sample_rate {
            log::debug!(
                "Skipping frame {}: {} samples at {} Hz does not match the analyzer",
                frame.index(),
                samples.len(),
                frame.sample_rate()
            );
            return PitchEstimate::unpitched(frame.index(), f32::NEG_INFINITY);
        }

        self.conditioned.copy_from_slice(samples);
        fft::remove_dc_offset(&mut self.conditioned);
        let amplitude_db = fft::rms_db(&self.conditioned);

        // --- Noise Gate: also rejects NaN levels from corrupt input ---
        if !(amplitude_db >= self.noise_floor_db) {
            return PitchEstimate::unpitched(frame.index(), amplitude_db);
        }

        let detected = match self.estimator {
            Estimator::Autocorrelation => self.detect_autocorrelation(),
            Estimator::Yin => self.detect_yin(),
        };

        match detected {
            Some((frequency_hz, confidence)) if frequency_hz.is_finite() && frequency_hz > 0.0 => {
                log::trace!(
                    "Frame {}: {:.2} Hz, confidence {:.3}, {:.1} dBFS",
                    frame.index(),
                    frequency_hz,
                    confidence,
                    amplitude_db
                );
                PitchEstimate {
                    frequency_hz,
                    confidence,
                    frame_index: frame.index(),
                    amplitude_db,
                }
            }
            _ => PitchEstimate::unpitched(frame.index(), amplitude_db),
        }
    }

    /// Normalized autocorrelation pitch detection.
    fn detect_autocorrelation(&mut self) -> Option<(f32, f32)> {
        for (out, (&sample, &coefficient)) in self
            .weighted
            .iter_mut()
            .zip(self.conditioned.iter().zip(&self.window))
        {
            *out = sample * coefficient;
        }
        self.autocorrelator
            .compute(&self.weighted, &mut self.lag_buffer);

        let energy = self.lag_buffer[0];
        if !(energy > f32::MIN_POSITIVE) {
            return None;
        }
        for (value, &window_value) in self.lag_buffer.iter_mut().zip(&self.window_acf) {
            *value /= energy * window_value;
        }

        let (lag, confidence) = pick_period(
            &self.lag_buffer,
            self.min_lag.max(1)..=self.max_lag,
            self.min_peak_height,
        )?;
        Some((self.sample_rate as f32 / lag, confidence))
    }

    /// YIN pitch detection over the configured lag band.
    fn detect_yin(&mut self) -> Option<(f32, f32)> {
        let signal = &self.conditioned;
        let last_lag = self.max_lag + 1;
        let integration = self.window_size - last_lag;
        let yin_buffer = &mut self.lag_buffer;

        // --- Step 1 & 2: Difference function and squared difference ---
        for tau in 1..=last_lag {
            let mut diff = 0.0;
            for i in 0..integration {
                let delta = signal[i] - signal[i + tau];
                diff += delta * delta;
            }
            yin_buffer[tau] = diff;
        }

        // --- Step 3: Cumulative mean normalized difference ---
        let mut running_sum = 0.0;
        yin_buffer[0] = 1.0;
        for tau in 1..=last_lag {
            running_sum += yin_buffer[tau];
            if running_sum > 0.0 {
                yin_buffer[tau] *= tau as f32 / running_sum;
            } else {
                yin_buffer[tau] = 1.0;
            }
        }

        // --- Step 4: First dip below the threshold, followed to its minimum ---
        let mut period = (self.min_lag.max(2)..=self.max_lag)
            .find(|&tau| yin_buffer[tau] < self.yin_threshold)?;
        while period < self.max_lag && yin_buffer[period + 1] < yin_buffer[period] {
            period += 1;
        }

        // --- Step 5: Parabolic interpolation for better precision ---
        let (shift, value) = parabolic_peak(
            yin_buffer[period - 1],
            yin_buffer[period],
            yin_buffer[period + 1],
        );
        let frequency = self.sample_rate as f32 / (period as f32 + shift);
        Some((frequency, (1.0 - value).clamp(0.0, 1.0)))
    }
}

/// Picks the period from a window-normalized autocorrelation.
///
/// Peaks are compared on the curve clamped to [-1, 1], where the window
/// normalization can overshoot at long lags. The vertex is interpolated on
/// the unclamped values around the chosen peak, since a clamped plateau has
/// no vertex. Returns the fractional lag and the confidence in [0, 1].
///
/// `lags` must leave one sample on each side within `nacf`.
fn pick_period(
    nacf: &[f32],
    lags: RangeInclusive<usize>,
    min_peak_height: f32,
) -> Option<(f32, f32)> {
    let clamped = |k: usize| nacf[k].clamp(-1.0, 1.0);
    let is_peak = |k: usize| clamped(k) > clamped(k - 1) && clamped(k) >= clamped(k + 1);
    let last = *lags.end();

    let highest = lags
        .clone()
        .filter(|&k| is_peak(k))
        .map(clamped)
        .fold(f32::NEG_INFINITY, f32::max);
    if !(highest >= min_peak_height) {
        return None;
    }

    let threshold = (highest * PEAK_TOLERANCE).max(min_peak_height);
    let mut lag = lags.filter(|&k| is_peak(k)).find(|&k| clamped(k) >= threshold)?;
    // The first lag of a clamped plateau; the raw maximum may lie further on.
    while lag < last && nacf[lag + 1] > nacf[lag] {
        lag += 1;
    }

    let (shift, height) = parabolic_peak(nacf[lag - 1], nacf[lag], nacf[lag + 1]);
    Some((lag as f32 + shift, height.clamp(0.0, 1.0)))
}

/// Fits a parabola through three equally spaced points around an extremum.
///
/// Returns the offset of the vertex from the middle point, in [-0.5, 0.5]
/// when the middle point is the extremum, and the value at the vertex.
fn parabolic_peak(left: f32, center: f32, right: f32) -> (f32, f32) {
    let denominator = left - 2.0 * center + right;
    if denominator.abs() < f32::EPSILON {
        return (0.0, center);
    }
    let shift = (0.5 * (left - right) / denominator).clamp(-0.5, 0.5);
    (shift, center - 0.25 * (left - right) * shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfig;

    fn sine(freq: f32, sample_rate: u32, len: usize, phase: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32 + phase)
                    .sin()
            })
            .collect()
    }

    fn analyze(config: &TunerConfig, sample_rate: u32, samples: Vec<f32>) -> PitchEstimate {
        let mut analyzer = FrameAnalyzer::new(config, sample_rate).unwrap();
        analyzer.analyze(&AudioFrame::new(samples, sample_rate, 7))
    }

    fn assert_close(estimate: &PitchEstimate, freq: f32) {
        let error = (estimate.frequency_hz - freq).abs() / freq;
        assert!(
            error < 0.005,
            "{freq} Hz estimated as {} Hz",
            estimate.frequency_hz
        );
        assert!(
            estimate.confidence > 0.8,
            "{freq} Hz: confidence {}",
            estimate.confidence
        );
    }

    #[test]
    fn sines_across_the_band() {
        let config = TunerConfig::default();
        for &freq in &[50.0, 82.41, 110.0, 196.0, 329.63, 440.0, 880.0, 1200.0, 1499.0] {
            let estimate = analyze(&config, 44100, sine(freq, 44100, 4096, 0.3));
            assert_close(&estimate, freq);
            assert_eq!(estimate.frame_index, 7);
        }
    }

    #[test]
    fn three_periods_are_enough() {
        let config = TunerConfig {
            window_size: 2048,
            ..TunerConfig::default()
        };
        // 2048 samples at 44.1 kHz hold three periods of 65 Hz.
        for phase in [0.0, 1.0, 2.0] {
            let estimate = analyze(&config, 44100, sine(65.0, 44100, 2048, phase));
            assert_close(&estimate, 65.0);
        }
    }

    #[test]
    fn works_at_48k() {
        let config = TunerConfig {
            sample_rate: 48000,
            ..TunerConfig::default()
        };
        let estimate = analyze(&config, 48000, sine(261.63, 48000, 4096, 0.0));
        assert_close(&estimate, 261.63);
    }

    #[test]
    fn silence_has_zero_confidence() {
        for estimator in [Estimator::Autocorrelation, Estimator::Yin] {
            let config = TunerConfig {
                estimator,
                ..TunerConfig::default()
            };
            let estimate = analyze(&config, 44100, vec![0.0; 4096]);
            assert_eq!(estimate.confidence, 0.0);
            assert_eq!(estimate.frequency_hz, 0.0);
            assert!(!estimate.is_pitched());
        }
    }

    #[test]
    fn constant_offset_is_silence() {
        let config = TunerConfig::default();
        let estimate = analyze(&config, 44100, vec![0.25; 4096]);
        assert_eq!(estimate.confidence, 0.0);
    }

    #[test]
    fn quiet_input_is_gated() {
        let config = TunerConfig::default();
        // Amplitude 0.001 is about -63 dBFS RMS.
        let quiet: Vec<f32> = sine(440.0, 44100, 4096, 0.0)
            .into_iter()
            .map(|s| s * 0.002)
            .collect();
        let estimate = analyze(&config, 44100, quiet);
        assert_eq!(estimate.confidence, 0.0);
        assert!(estimate.amplitude_db < -50.0);
    }

    #[test]
    fn noise_is_not_pitched() {
        let config = TunerConfig::default();
        // Deterministic white-ish noise from a linear congruential generator.
        let mut state = 0x2545_f491_u32;
        let noise: Vec<f32> = (0..4096)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect();
        let estimate = analyze(&config, 44100, noise);
        assert!(estimate.confidence < config.confidence_threshold);
    }

    #[test]
    fn harmonic_rich_tone_reports_fundamental() {
        let config = TunerConfig::default();
        let sr = 44100.0;
        let tone: Vec<f32> = (0..4096)
            .map(|i| {
                let t = i as f32 / sr;
                let w = 2.0 * std::f32::consts::PI * 110.0 * t;
                0.2 * w.sin() + 0.5 * (2.0 * w + 1.0).sin() + 0.3 * (3.0 * w + 2.0).sin()
            })
            .collect();
        let estimate = analyze(&config, 44100, tone);
        assert_close(&estimate, 110.0);
    }

    #[test]
    fn yin_finds_sines() {
        let config = TunerConfig {
            estimator: Estimator::Yin,
            ..TunerConfig::default()
        };
        for &freq in &[82.41, 220.0, 440.0, 987.77] {
            let estimate = analyze(&config, 44100, sine(freq, 44100, 4096, 0.5));
            assert_close(&estimate, freq);
        }
    }

    #[test]
    fn mismatched_frame_is_unpitched() {
        let config = TunerConfig::default();
        let mut analyzer = FrameAnalyzer::new(&config, 44100).unwrap();
        let estimate = analyzer.analyze(&AudioFrame::new(sine(440.0, 44100, 1024, 0.0), 44100, 3));
        assert_eq!(estimate.confidence, 0.0);
        assert_eq!(estimate.frame_index, 3);
    }

    #[test]
    fn insufficient_window_fails_at_construction() {
        let config = TunerConfig {
            window_size: 1024,
            ..TunerConfig::default()
        };
        assert!(matches!(
            FrameAnalyzer::new(&config, 44100),
            Err(crate::error::TunerError::InsufficientWindow { .. })
        ));
    }

    #[test]
    fn overshoot_does_not_outrank_earlier_peaks() {
        let mut nacf = vec![0.0f32; 64];
        nacf[19..=21].copy_from_slice(&[0.5, 0.95, 0.5]);
        nacf[39..=41].copy_from_slice(&[1.1, 1.3, 1.1]);

        // Unclamped, 1.3 would lift the threshold above 0.95.
        let (lag, confidence) = pick_period(&nacf, 2..=60, 0.45).unwrap();
        assert!((lag - 20.0).abs() < 1e-6, "picked lag {lag}");
        assert!((confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn clamped_plateau_keeps_sub_sample_vertex() {
        let mut nacf = vec![0.0f32; 64];
        nacf[29..=33].copy_from_slice(&[0.6, 1.01, 1.06, 1.04, 0.6]);

        let (lag, confidence) = pick_period(&nacf, 2..=60, 0.45).unwrap();
        assert!(lag > 31.0 && lag < 31.5, "picked lag {lag}");
        assert_eq!(confidence, 1.0);

        nacf[29..=33].copy_from_slice(&[0.6, 0.7, 0.8, 0.7, 0.6]);
        nacf[40] = -1.5;
        let (lag, confidence) = pick_period(&nacf, 2..=60, 0.45).unwrap();
        assert!((lag - 31.0).abs() < 1e-6);
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn parabola_vertex() {
        let (shift, value) = parabolic_peak(0.5, 1.0, 0.5);
        assert_eq!(shift, 0.0);
        assert_eq!(value, 1.0);
        let (shift, _) = parabolic_peak(0.2, 1.0, 0.8);
        assert!(shift > 0.0 && shift <= 0.5);
    }
}
