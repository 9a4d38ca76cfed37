// tuner-core/src/lib.rs

//! The core of the real-time tuner.
//! This crate captures audio, estimates the fundamental frequency of each
//! analysis window and turns the estimates into stable note readings. It is
//! completely headless; presenters consume readings through [`Tuner`].

pub mod audio;
pub mod config;
pub mod error;
pub mod fft;
pub mod pipeline;
pub mod pitch;
pub mod ring;
pub mod tracker;
pub mod tuning;

pub use audio::{AudioCapture, CaptureInfo, list_input_devices};
pub use config::{Estimator, InputSource, TrackerConfig, TunerConfig};
pub use error::{Result, TunerError};
pub use pipeline::{Diagnostics, EVENT_QUEUE_CAPACITY, StopHandle, Tuner};
pub use pitch::{FrameAnalyzer, PitchEstimate};
pub use tracker::{PitchTracker, StableReading, StringTarget, TrackerEvent, TrackerState};
pub use tuning::NoteName;

/// One analysis window of mono samples.
///
/// Frames overlap by `window_size - hop_size` samples; the index counts
/// frames since the pipeline started.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    index: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, index: u64) -> Self {
        Self {
            samples,
            sample_rate,
            index,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Advances the frame by one hop: the oldest `hop.len()` samples are
    /// discarded, `hop` is appended and the index moves forward.
    ///
    /// # Panics
    /// * If `hop` is longer than the frame
    pub(crate) fn slide(&mut self, hop: &[f32]) {
        let keep = self.samples.len() - hop.len();
        self.samples.copy_within(hop.len().., 0);
        self.samples[keep..].copy_from_slice(hop);
        self.index += 1;
    }
}
