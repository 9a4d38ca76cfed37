//! # Pitch Tracking Module
//!
//! Turns the stream of per-frame estimates into stable readings for a
//! presenter.
//!
//! The tracker is a small state machine:
//! - `Silent`: nothing to show. A confident estimate starts tracking.
//! - `Tracking`: estimates agreeing with the stable pitch (within the cents
//!   tolerance) are folded into a moving average on log2 frequency, so cents
//!   stay linear. A disagreeing estimate switches to `Settling`.
//! - `Settling`: the stable pitch is held while a new candidate collects
//!   consecutive agreeing estimates; once enough agree, tracking resumes at
//!   the candidate.
//!
//! Any state falls back to `Silent` after a run of low-confidence estimates.
//!
//! Estimates close to a multiple or submultiple of the stable pitch are
//! treated as octave/harmonic errors and folded back onto it, unless the
//! shifted hypothesis persists long enough to be a real jump.
//!
//! Each reading also names the closest configured open string and how far
//! off it the pitch is, for tuning an instrument string by string.

use crate::config::{TrackerConfig, TunerConfig};
use crate::pitch::PitchEstimate;
use crate::tuning::{self, NoteName};

/// Highest harmonic number considered when resolving octave errors.
const MAX_HARMONIC: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Silent,
    Tracking,
    Settling,
}

/// The open string closest to a reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StringTarget {
    /// Position in the configured string list, lowest string first.
    pub index: usize,
    /// Guitar numbering: 1 is the highest configured string.
    pub number: usize,
    pub midi: i32,
    pub note: NoteName,
    pub octave: i32,
    /// Signed distance from the string's pitch; not limited to a semitone.
    pub cents: f32,
}

/// A smoothed note reading for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StableReading {
    pub note: NoteName,
    /// Octave in scientific pitch notation.
    pub octave: i32,
    /// Offset from the note, in [-50, 50].
    pub cents: f32,
    /// Smoothed frequency in Hz.
    pub frequency_hz: f32,
    /// Confidence of the estimate that triggered this reading.
    pub confidence: f32,
    /// Level of the frame that triggered this reading, in dBFS.
    pub amplitude_db: f32,
    /// Frame that triggered this reading.
    pub frame_index: u64,
    /// Closest open string, when strings are configured.
    pub target: Option<StringTarget>,
}

impl StableReading {
    fn new(
        frequency_hz: f32,
        reference_pitch_hz: f32,
        estimate: &PitchEstimate,
        target: Option<StringTarget>,
    ) -> Option<Self> {
        let nearest = tuning::nearest_note(frequency_hz, reference_pitch_hz)?;
        Some(Self {
            note: nearest.note,
            octave: nearest.octave,
            cents: nearest.cents,
            frequency_hz,
            confidence: estimate.confidence,
            amplitude_db: estimate.amplitude_db,
            frame_index: estimate.frame_index,
            target,
        })
    }
}

/// An open string with its pitch precomputed for the reference.
#[derive(Debug, Clone, Copy)]
struct OpenString {
    midi: i32,
    log2: f32,
}

/// Output of the tracker for one estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerEvent {
    /// A new stable reading superseding the previous one.
    Reading(StableReading),
    /// The signal went silent; the previous reading is no longer valid.
    Silence { frame_index: u64 },
}

impl TrackerEvent {
    pub fn frame_index(&self) -> u64 {
        match self {
            TrackerEvent::Reading(reading) => reading.frame_index,
            TrackerEvent::Silence { frame_index } => *frame_index,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    log2: f32,
    agreeing: u32,
}

/// Smooths and debounces pitch estimates. Owned by the analysis thread.
#[derive(Debug)]
pub struct PitchTracker {
    settings: TrackerConfig,
    reference_pitch_hz: f32,
    confidence_threshold: f32,
    strings: Vec<OpenString>,
    state: TrackerState,
    /// Smoothed log2 frequency; meaningful outside `Silent`.
    stable_log2: f32,
    candidate: Option<Candidate>,
    low_confidence_run: u32,
    octave_run: u32,
    last_emitted_log2: Option<f32>,
    last_frame: Option<u64>,
}

fn cents(log2_delta: f32) -> f32 {
    log2_delta * 1200.0
}

impl PitchTracker {
    pub fn new(config: &TunerConfig) -> Self {
        Self {
            settings: config.tracker.clone(),
            reference_pitch_hz: config.reference_pitch_hz,
            confidence_threshold: config.confidence_threshold,
            strings: config
                .string_notes()
                .into_iter()
                .map(|midi| OpenString {
                    midi,
                    log2: tuning::note_frequency(midi, config.reference_pitch_hz).log2(),
                })
                .collect(),
            state: TrackerState::Silent,
            stable_log2: 0.0,
            candidate: None,
            low_confidence_run: 0,
            octave_run: 0,
            last_emitted_log2: None,
            last_frame: None,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// The smoothed frequency being held, if any.
    pub fn stable_frequency(&self) -> Option<f32> {
        match self.state {
            TrackerState::Silent => None,
            _ => Some(self.stable_log2.exp2()),
        }
    }

    /// Feeds one estimate; returns an event when the presenter should update.
    ///
    /// Estimates must arrive in increasing frame order; anything else is dropped.
    pub fn update(&mut self, estimate: &PitchEstimate) -> Option<TrackerEvent> {
        if let Some(last) = self.last_frame {
            if estimate.frame_index <= last {
                log::warn!(
                    "Dropping out-of-order estimate for frame {} (last was {})",
                    estimate.frame_index,
                    last
                );
                return None;
            }
        }
        self.last_frame = Some(estimate.frame_index);

        if !estimate.is_pitched() || estimate.confidence < self.confidence_threshold {
            return self.on_low_confidence(estimate);
        }
        self.low_confidence_run = 0;
        let raw = estimate.frequency_hz.log2();

        match self.state {
            TrackerState::Silent => {
                log::debug!(
                    "Silent -> Tracking at {:.2} Hz (frame {})",
                    estimate.frequency_hz,
                    estimate.frame_index
                );
                self.state = TrackerState::Tracking;
                self.stable_log2 = raw;
                self.emit(estimate)
            }
            TrackerState::Tracking => {
                let observed = self.resolve_octave(raw);
                if cents(observed - self.stable_log2).abs() <= self.settings.cents_tolerance {
                    self.stable_log2 += self.settings.smoothing_alpha * (observed - self.stable_log2);
                    self.emit(estimate)
                } else {
                    log::debug!(
                        "Tracking -> Settling: {:.2} Hz disagrees with {:.2} Hz",
                        observed.exp2(),
                        self.stable_log2.exp2()
                    );
                    self.state = TrackerState::Settling;
                    self.candidate = None;
                    self.settle(observed, estimate)
                }
            }
            TrackerState::Settling => {
                let observed = self.resolve_octave(raw);
                self.settle(observed, estimate)
            }
        }
    }

    /// Adds an observation to the settling candidate and resumes tracking
    /// once enough consecutive observations agree.
    fn settle(&mut self, observed: f32, estimate: &PitchEstimate) -> Option<TrackerEvent> {
        let tolerance = self.settings.cents_tolerance;
        let candidate = match self.candidate {
            Some(mut candidate) if cents(observed - candidate.log2).abs() <= tolerance => {
                candidate.agreeing += 1;
                candidate.log2 += (observed - candidate.log2) / candidate.agreeing as f32;
                candidate
            }
            _ => Candidate {
                log2: observed,
                agreeing: 1,
            },
        };

        if candidate.agreeing < self.settings.settle_frames {
            self.candidate = Some(candidate);
            return None;
        }

        log::debug!(
            "Settling -> Tracking at {:.2} Hz after {} agreeing frames",
            candidate.log2.exp2(),
            candidate.agreeing
        );
        self.state = TrackerState::Tracking;
        self.stable_log2 = candidate.log2;
        self.candidate = None;
        self.emit(estimate)
    }

    fn on_low_confidence(&mut self, estimate: &PitchEstimate) -> Option<TrackerEvent> {
        self.low_confidence_run = self.low_confidence_run.saturating_add(1);
        // Settling needs consecutive agreement; a gap starts the count over.
        if self.state == TrackerState::Settling {
            self.candidate = None;
        }
        if self.state == TrackerState::Silent
            || self.low_confidence_run < self.settings.silence_frames
        {
            return None;
        }

        log::debug!(
            "{:?} -> Silent after {} low-confidence frames",
            self.state,
            self.low_confidence_run
        );
        self.state = TrackerState::Silent;
        self.candidate = None;
        self.octave_run = 0;
        self.last_emitted_log2 = None;
        Some(TrackerEvent::Silence {
            frame_index: estimate.frame_index,
        })
    }

    /// Folds an estimate that sits near n or 1/n times the stable pitch back
    /// onto it, unless the shifted hypothesis has persisted long enough.
    fn resolve_octave(&mut self, raw: f32) -> f32 {
        let reference = self.stable_log2;
        let direct = (raw - reference).abs();
        let tolerance = self.settings.octave_tolerance_cents / 1200.0;

        let mut best = raw;
        if cents(direct) > self.settings.cents_tolerance {
            let mut best_distance = direct;
            for n in 2..=MAX_HARMONIC {
                let shift = (n as f32).log2();
                for hypothesis in [raw - shift, raw + shift] {
                    let distance = (hypothesis - reference).abs();
                    if distance <= tolerance && distance < best_distance {
                        best = hypothesis;
                        best_distance = distance;
                    }
                }
            }
        }

        if best == raw {
            self.octave_run = 0;
            return raw;
        }

        self.octave_run = self.octave_run.saturating_add(1);
        if self.octave_run >= self.settings.octave_persistence_frames {
            raw
        } else {
            best
        }
    }

    /// The configured string nearest to `log2` frequency, by absolute cents.
    fn nearest_string(&self, log2: f32) -> Option<StringTarget> {
        let (index, string) = self.strings.iter().enumerate().min_by(|(_, a), (_, b)| {
            (log2 - a.log2).abs().total_cmp(&(log2 - b.log2).abs())
        })?;
        Some(StringTarget {
            index,
            number: self.strings.len() - index,
            midi: string.midi,
            note: NoteName::from_midi(string.midi),
            octave: string.midi.div_euclid(12) - 1,
            cents: cents(log2 - string.log2),
        })
    }

    fn emit(&mut self, estimate: &PitchEstimate) -> Option<TrackerEvent> {
        if let Some(last) = self.last_emitted_log2 {
            if cents(self.stable_log2 - last).abs() < self.settings.min_emit_cents {
                return None;
            }
        }
        let reading = StableReading::new(
            self.stable_log2.exp2(),
            self.reference_pitch_hz,
            estimate,
            self.nearest_string(self.stable_log2),
        )?;
        self.last_emitted_log2 = Some(self.stable_log2);
        Some(TrackerEvent::Reading(reading))
    }
}
