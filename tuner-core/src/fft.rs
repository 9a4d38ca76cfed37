//! # Fast Fourier Transform (FFT) Module
//!
//! Signal conditioning and FFT-based autocorrelation for the frame analyzer.
//!
//! ## Features
//! - DC offset removal
//! - Hann window coefficients for reduced spectral leakage
//! - Linear (zero-padded) autocorrelation through RustFFT with buffers planned once
//! - RMS level in dBFS

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
///
/// A DC component shows up as a constant added to every lag of the
/// autocorrelation and would bias peak heights upwards.
pub fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Returns the coefficients of a symmetric Hann window of length `n`.
///
/// The window tapers the signal to zero at the edges.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let n_minus_1 = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos()))
        .collect()
}

/// RMS level of a signal in dBFS (full scale = 1.0).
pub fn rms_db(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32;
    20.0 * (mean_square.sqrt() + 1e-10).log10()
}

/// Computes linear autocorrelations of fixed-length signals.
///
/// Signals are zero-padded to at least twice their length so the circular
/// correlation of the FFT equals the linear one for every lag.
pub struct Autocorrelator {
    size: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Autocorrelator {
    /// Plans the transforms and allocates all buffers for signals of `size` samples.
    pub fn new(size: usize) -> Self {
        let fft_len = (2 * size).next_power_of_two().max(2);
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            size,
            fft_len,
            forward,
            inverse,
            buffer: vec![Complex { re: 0.0, im: 0.0 }; fft_len],
            scratch: vec![Complex { re: 0.0, im: 0.0 }; scratch_len],
        }
    }

    /// Signal length this autocorrelator was planned for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes r[0..out.len()] of `signal` into `out`, with
    /// r[k] = sum_i signal[i] * signal[i + k].
    ///
    /// # Panics
    /// * If `signal` is longer than the planned size or `out` asks for more lags than that
    pub fn compute(&mut self, signal: &[f32], out: &mut [f32]) {
        assert!(signal.len() <= self.size, "signal longer than planned size");
        assert!(out.len() <= self.size, "more lags requested than signal length");

        for (slot, &sample) in self.buffer.iter_mut().zip(signal) {
            *slot = Complex { re: sample, im: 0.0 };
        }
        for slot in self.buffer.iter_mut().skip(signal.len()) {
            *slot = Complex { re: 0.0, im: 0.0 };
        }

        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        for bin in self.buffer.iter_mut() {
            *bin = Complex {
                re: bin.norm_sqr(),
                im: 0.0,
            };
        }
        self.inverse
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        // RustFFT does not normalize the inverse transform.
        let scale = 1.0 / self.fft_len as f32;
        for (r, bin) in out.iter_mut().zip(&self.buffer) {
            *r = bin.re * scale;
        }
    }
}
