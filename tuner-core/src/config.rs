//! # Configuration Module
//!
//! Tuner configuration, supplied once when the pipeline starts. Changing any
//! value requires a stop/start cycle.
//!
//! Configurations can be saved to and loaded from pretty-printed JSON files.
//! Fields missing from a file fall back to their defaults, so a file only
//! needs to list the options it changes.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TunerError};
use crate::tuning;

/// Capture rates the analysis is tuned for.
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [44100, 48000];

/// Smallest accepted analysis window.
pub const MIN_WINDOW_SIZE: usize = 1024;

/// Largest accepted analysis window.
pub const MAX_WINDOW_SIZE: usize = 8192;

/// Lowest accepted `min_frequency_hz`; below it the lag range is meaningless.
pub const MIN_FREQUENCY_FLOOR_HZ: f32 = 1.0;

/// Standard guitar tuning, low string first.
pub const STANDARD_GUITAR_STRINGS: [&str; 6] = ["E2", "A2", "D3", "G3", "B3", "E4"];

/// Pitch estimation algorithm used by the frame analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimator {
    /// Hann-windowed, window-normalized autocorrelation.
    #[default]
    Autocorrelation,
    /// Cumulative mean normalized difference (YIN).
    Yin,
}

/// Where samples come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputSource {
    /// A cpal input device. `name` matches by substring; `None` is the default device.
    Device {
        #[serde(default)]
        name: Option<String>,
    },
    /// A synthetic sine tone delivered at real-time pace.
    Tone {
        frequency_hz: f32,
        #[serde(default = "default_tone_amplitude")]
        amplitude: f32,
    },
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Device { name: None }
    }
}

fn default_tone_amplitude() -> f32 {
    0.5
}

/// Settings of the pitch tracker's state machine and smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Estimates further apart than this (in cents) disagree.
    pub cents_tolerance: f32,
    /// Consecutive agreeing estimates needed to leave `Settling`.
    pub settle_frames: u32,
    /// Consecutive low-confidence estimates before falling back to `Silent`.
    pub silence_frames: u32,
    /// Weight of the newest estimate in the log-frequency moving average.
    pub smoothing_alpha: f32,
    /// Minimal change (in cents) of the smoothed pitch before a new reading is emitted.
    pub min_emit_cents: f32,
    /// How close (in cents) an estimate must be to a multiple or submultiple
    /// of the stable pitch to be treated as an octave/harmonic error.
    pub octave_tolerance_cents: f32,
    /// Frames an octave-shifted hypothesis must persist before it is believed.
    pub octave_persistence_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cents_tolerance: 30.0,
            settle_frames: 3,
            silence_frames: 6,
            smoothing_alpha: 0.25,
            min_emit_cents: 0.5,
            octave_tolerance_cents: 40.0,
            octave_persistence_frames: 8,
        }
    }
}

/// Complete tuner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Capture rate in Hz, one of [`SUPPORTED_SAMPLE_RATES`].
    pub sample_rate: u32,
    /// Analysis window length; a power of two between 1024 and 8192.
    pub window_size: usize,
    /// Samples advanced between successive windows.
    pub hop_size: usize,
    /// Frequency of A4 used for note mapping.
    pub reference_pitch_hz: f32,
    /// Minimum confidence for the tracker to accept an estimate.
    pub confidence_threshold: f32,
    /// Lowest frequency searched by the analyzer.
    pub min_frequency_hz: f32,
    /// Highest frequency searched by the analyzer.
    pub max_frequency_hz: f32,
    /// Minimum normalized correlation for a peak to count as pitched.
    pub min_peak_height: f32,
    /// Frames below this RMS level (dBFS) are treated as silence.
    pub noise_floor_db: f32,
    pub estimator: Estimator,
    /// Acceptance threshold on the YIN difference function.
    pub yin_threshold: f32,
    /// Ring buffer capacity, in windows.
    pub ring_capacity_windows: usize,
    pub input: InputSource,
    /// Open-string notes ("E2", "A2", ...) readings are matched against.
    /// Empty disables string matching.
    pub strings: Vec<String>,
    pub tracker: TrackerConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            window_size: 4096,
            hop_size: 1024,
            reference_pitch_hz: 440.0,
            confidence_threshold: 0.75,
            min_frequency_hz: 50.0,
            max_frequency_hz: 1500.0,
            min_peak_height: 0.45,
            noise_floor_db: -50.0,
            estimator: Estimator::Autocorrelation,
            yin_threshold: 0.12,
            ring_capacity_windows: 4,
            input: InputSource::default(),
            strings: STANDARD_GUITAR_STRINGS.map(String::from).to_vec(),
            tracker: TrackerConfig::default(),
        }
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> TunerError {
    TunerError::InvalidConfig {
        field,
        message: message.into(),
    }
}

fn check_unit_interval(field: &'static str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside [0, 1]")))
    }
}

fn check_positive(field: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} must be a positive number")))
    }
}

impl TunerConfig {
    /// Validates every option against the configured sample rate.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(TunerError::UnsupportedFormat(format!(
                "sample rate {} Hz (supported: {:?})",
                self.sample_rate, SUPPORTED_SAMPLE_RATES
            )));
        }
        self.validate_for_rate(self.sample_rate)
    }

    /// Validates the options for the rate a stream actually runs at.
    ///
    /// Called again after device negotiation, since a fallback rate changes
    /// the lag range and with it the minimum window size.
    pub fn validate_for_rate(&self, sample_rate: u32) -> Result<()> {
        if !self.window_size.is_power_of_two()
            || !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.window_size)
        {
            return Err(invalid(
                "window_size",
                format!(
                    "{} is not a power of two between {MIN_WINDOW_SIZE} and {MAX_WINDOW_SIZE}",
                    self.window_size
                ),
            ));
        }
        if self.hop_size == 0 || self.hop_size > self.window_size {
            return Err(invalid(
                "hop_size",
                format!("{} must be between 1 and the window size", self.hop_size),
            ));
        }
        check_positive("reference_pitch_hz", self.reference_pitch_hz)?;
        check_unit_interval("confidence_threshold", self.confidence_threshold)?;
        check_unit_interval("min_peak_height", self.min_peak_height)?;
        check_positive("min_frequency_hz", self.min_frequency_hz)?;
        if self.min_frequency_hz < MIN_FREQUENCY_FLOOR_HZ {
            return Err(invalid(
                "min_frequency_hz",
                format!(
                    "{} is below {MIN_FREQUENCY_FLOOR_HZ} Hz",
                    self.min_frequency_hz
                ),
            ));
        }
        check_positive("max_frequency_hz", self.max_frequency_hz)?;

        let nyquist = sample_rate as f32 / 2.0;
        if self.max_frequency_hz <= self.min_frequency_hz || self.max_frequency_hz >= nyquist {
            return Err(invalid(
                "max_frequency_hz",
                format!(
                    "{} must lie between min_frequency_hz ({}) and the Nyquist frequency ({nyquist})",
                    self.max_frequency_hz, self.min_frequency_hz
                ),
            ));
        }
        if !self.noise_floor_db.is_finite() || self.noise_floor_db > 0.0 {
            return Err(invalid(
                "noise_floor_db",
                format!("{} must be a dBFS value <= 0", self.noise_floor_db),
            ));
        }
        if !(self.yin_threshold > 0.0 && self.yin_threshold < 1.0) {
            return Err(invalid(
                "yin_threshold",
                format!("{} is outside (0, 1)", self.yin_threshold),
            ));
        }
        if self.ring_capacity_windows < 2 {
            return Err(invalid(
                "ring_capacity_windows",
                "the ring must hold at least two windows",
            ));
        }
        if let InputSource::Tone {
            frequency_hz,
            amplitude,
        } = &self.input
        {
            check_positive("input.frequency_hz", *frequency_hz)?;
            if *frequency_hz >= nyquist {
                return Err(invalid(
                    "input.frequency_hz",
                    format!("{frequency_hz} is above the Nyquist frequency"),
                ));
            }
            check_unit_interval("input.amplitude", *amplitude)?;
        }
        if let Some(bad) = self
            .strings
            .iter()
            .find(|name| tuning::parse_note(name).is_none())
        {
            return Err(invalid(
                "strings",
                format!("'{bad}' is not a note name with octave"),
            ));
        }
        self.tracker.validate()?;

        let required = self.required_window(sample_rate);
        if self.window_size < required {
            return Err(TunerError::InsufficientWindow {
                window_size: self.window_size,
                min_frequency_hz: self.min_frequency_hz,
                required,
            });
        }
        Ok(())
    }

    /// Shortest lag searched, in samples.
    pub fn min_lag(&self, sample_rate: u32) -> usize {
        ((sample_rate as f32 / self.max_frequency_hz).floor() as usize).max(2)
    }

    /// Longest lag searched, in samples.
    pub fn max_lag(&self, sample_rate: u32) -> usize {
        (sample_rate as f32 / self.min_frequency_hz).ceil() as usize
    }

    /// Smallest window holding two periods of the lowest searchable frequency.
    pub fn required_window(&self, sample_rate: u32) -> usize {
        self.max_lag(sample_rate).saturating_mul(2)
    }

    /// MIDI numbers of the configured strings, in configured order.
    ///
    /// Names that do not parse are skipped; [`TunerConfig::validate`] rejects them.
    pub fn string_notes(&self) -> Vec<i32> {
        self.strings
            .iter()
            .filter_map(|name| tuning::parse_note(name))
            .collect()
    }

    /// Ring capacity in samples.
    pub fn ring_capacity(&self) -> usize {
        self.window_size * self.ring_capacity_windows
    }

    /// Wall-clock time covered by one hop.
    pub fn hop_duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.hop_size as f64 / sample_rate as f64)
    }

    /// Loads a configuration from a JSON file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: TunerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }
}

impl TrackerConfig {
    fn validate(&self) -> Result<()> {
        check_positive("tracker.cents_tolerance", self.cents_tolerance)?;
        if self.settle_frames == 0 {
            return Err(invalid("tracker.settle_frames", "must be at least 1"));
        }
        if self.silence_frames == 0 {
            return Err(invalid("tracker.silence_frames", "must be at least 1"));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(invalid(
                "tracker.smoothing_alpha",
                format!("{} is outside (0, 1]", self.smoothing_alpha),
            ));
        }
        if !self.min_emit_cents.is_finite() || self.min_emit_cents < 0.0 {
            return Err(invalid(
                "tracker.min_emit_cents",
                format!("{} must be >= 0", self.min_emit_cents),
            ));
        }
        // Beyond half an octave, the octave window would swallow ordinary intervals.
        if !(self.octave_tolerance_cents > 0.0 && self.octave_tolerance_cents < 600.0) {
            return Err(invalid(
                "tracker.octave_tolerance_cents",
                format!("{} is outside (0, 600)", self.octave_tolerance_cents),
            ));
        }
        if self.octave_persistence_frames == 0 {
            return Err(invalid(
                "tracker.octave_persistence_frames",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TunerConfig::default();
        config.validate().unwrap();
        config.validate_for_rate(48000).unwrap();
        assert!(config.ring_capacity() >= 2 * config.window_size);
    }

    #[test]
    fn short_window_fails_before_any_stream() {
        let config = TunerConfig {
            window_size: 1024,
            ..TunerConfig::default()
        };
        match config.validate() {
            Err(TunerError::InsufficientWindow {
                window_size,
                required,
                ..
            }) => {
                assert_eq!(window_size, 1024);
                assert_eq!(required, 2 * 882);
            }
            other => panic!("expected InsufficientWindow, got {other:?}"),
        }

        // Raising the lower band edge makes the same window acceptable.
        let config = TunerConfig {
            window_size: 1024,
            min_frequency_hz: 100.0,
            ..TunerConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn fallback_rate_can_invalidate_window() {
        let config = TunerConfig {
            window_size: 2048,
            min_frequency_hz: 44.0,
            ..TunerConfig::default()
        };
        // 44100 / 44 -> 1003 lags, 48000 / 44 -> 1091 lags
        config.validate_for_rate(44100).unwrap();
        assert!(matches!(
            config.validate_for_rate(48000),
            Err(TunerError::InsufficientWindow { .. })
        ));
    }

    #[test]
    fn unsupported_rate_is_a_format_error() {
        let config = TunerConfig {
            sample_rate: 22050,
            ..TunerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TunerError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            (
                TunerConfig {
                    window_size: 3000,
                    ..TunerConfig::default()
                },
                "window_size",
            ),
            (
                TunerConfig {
                    window_size: 16384,
                    ..TunerConfig::default()
                },
                "window_size",
            ),
            (
                TunerConfig {
                    hop_size: 8192,
                    ..TunerConfig::default()
                },
                "hop_size",
            ),
            (
                TunerConfig {
                    confidence_threshold: 1.5,
                    ..TunerConfig::default()
                },
                "confidence_threshold",
            ),
            (
                TunerConfig {
                    max_frequency_hz: 30000.0,
                    ..TunerConfig::default()
                },
                "max_frequency_hz",
            ),
            (
                TunerConfig {
                    ring_capacity_windows: 1,
                    ..TunerConfig::default()
                },
                "ring_capacity_windows",
            ),
            (
                TunerConfig {
                    tracker: TrackerConfig {
                        smoothing_alpha: 0.0,
                        ..TrackerConfig::default()
                    },
                    ..TunerConfig::default()
                },
                "tracker.smoothing_alpha",
            ),
        ];
        for (config, expected) in cases {
            match config.validate() {
                Err(TunerError::InvalidConfig { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid `{expected}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn tiny_min_frequency_is_invalid() {
        for min_frequency_hz in [1e-30, f32::MIN_POSITIVE, 0.5] {
            let config = TunerConfig {
                min_frequency_hz,
                ..TunerConfig::default()
            };
            match config.validate() {
                Err(TunerError::InvalidConfig { field, .. }) => {
                    assert_eq!(field, "min_frequency_hz")
                }
                other => panic!("{min_frequency_hz}: expected InvalidConfig, got {other:?}"),
            }
        }
        // Lag math stays finite even when called on an unvalidated config.
        let config = TunerConfig {
            min_frequency_hz: 1e-30,
            ..TunerConfig::default()
        };
        assert!(config.required_window(48000) >= config.max_lag(48000));
    }

    #[test]
    fn strings_default_to_standard_guitar_tuning() {
        let config = TunerConfig::default();
        assert_eq!(config.string_notes(), vec![40, 45, 50, 55, 59, 64]);

        let drop_d = TunerConfig {
            strings: ["D2", "A2", "D3", "G3", "B3", "E4"].map(String::from).to_vec(),
            ..TunerConfig::default()
        };
        drop_d.validate().unwrap();
        assert_eq!(drop_d.string_notes()[0], 38);

        let none = TunerConfig {
            strings: Vec::new(),
            ..TunerConfig::default()
        };
        none.validate().unwrap();
        assert!(none.string_notes().is_empty());

        let bad = TunerConfig {
            strings: vec!["E2".to_string(), "H7".to_string()],
            ..TunerConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(TunerError::InvalidConfig { field: "strings", .. })
        ));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let json = r#"{
            "window_size": 8192,
            "input": { "kind": "tone", "frequency_hz": 220.0 },
            "tracker": { "settle_frames": 5 }
        }"#;
        let config: TunerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.window_size, 8192);
        assert_eq!(config.hop_size, 1024);
        assert_eq!(config.tracker.settle_frames, 5);
        assert_eq!(config.tracker.silence_frames, 6);
        assert_eq!(
            config.input,
            InputSource::Tone {
                frequency_hz: 220.0,
                amplitude: 0.5
            }
        );
        config.validate().unwrap();
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!(
            "tuner-config-test-{}.json",
            std::process::id()
        ));
        let config = TunerConfig {
            sample_rate: 48000,
            reference_pitch_hz: 442.0,
            estimator: Estimator::Yin,
            ..TunerConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = TunerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
