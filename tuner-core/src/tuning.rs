//! # Musical Tuning Module
//!
//! Equal-temperament note mapping relative to a configurable A4 reference.
//!
//! ## Features
//! - Nearest note, octave and cents offset for any frequency
//! - Note frequency lookup by MIDI number
//! - Cent deviation between two frequencies
//! - Note name parsing ("A4", "C#3", "Bb2")

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

/// MIDI number of A4.
pub const A4_MIDI: i32 = 69;

/// One of the twelve pitch classes, named with sharps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NoteName {
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl NoteName {
    /// Pitch classes in chromatic order starting at C.
    pub const ALL: [NoteName; 12] = [
        NoteName::C,
        NoteName::CSharp,
        NoteName::D,
        NoteName::DSharp,
        NoteName::E,
        NoteName::F,
        NoteName::FSharp,
        NoteName::G,
        NoteName::GSharp,
        NoteName::A,
        NoteName::ASharp,
        NoteName::B,
    ];

    /// Pitch class of a MIDI note number.
    pub fn from_midi(midi: i32) -> Self {
        Self::ALL[midi.rem_euclid(12) as usize]
    }

    /// Semitones above C.
    pub fn semitone(self) -> i32 {
        self as i32
    }

    /// Name spelled with a sharp, e.g. "C#".
    pub fn sharp_name(self) -> &'static str {
        const NAMES: [&str; 12] = [
            "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
        ];
        NAMES[self as usize]
    }

    /// Name spelled with a flat, e.g. "Db".
    pub fn flat_name(self) -> &'static str {
        const NAMES: [&str; 12] = [
            "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
        ];
        NAMES[self as usize]
    }
}

impl fmt::Display for NoteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sharp_name())
    }
}

/// The note closest to a frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestNote {
    pub note: NoteName,
    /// Octave in scientific pitch notation (A4 = 440 Hz).
    pub octave: i32,
    pub midi: i32,
    /// Offset from the note, in [-50, 50].
    pub cents: f32,
    /// Equal-temperament frequency of the note.
    pub target_frequency_hz: f32,
}

/// Pitch-class names (sharp and flat spellings) to semitones above C.
static PITCH_CLASSES: Lazy<BTreeMap<String, i32>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    for note in NoteName::ALL {
        map.insert(note.sharp_name().to_string(), note.semitone());
        map.insert(note.flat_name().to_string(), note.semitone());
    }
    // Enharmonic spellings that cross a letter boundary
    map.insert("E#".to_string(), 5);
    map.insert("Fb".to_string(), 4);
    map.insert("B#".to_string(), 12);
    map.insert("Cb".to_string(), -1);
    map
});

/// Fractional MIDI number of a frequency.
pub fn midi_from_frequency(freq: f32, reference_pitch_hz: f32) -> f32 {
    A4_MIDI as f32 + 12.0 * (freq / reference_pitch_hz).log2()
}

/// Equal-temperament frequency of a MIDI note.
///
/// The formula is f = f0 * 2^(n/12), where f0 is the A4 reference and n the
/// number of semitones away from A4.
pub fn note_frequency(midi: i32, reference_pitch_hz: f32) -> f32 {
    reference_pitch_hz * 2.0_f32.powf((midi - A4_MIDI) as f32 / 12.0)
}

/// Finds the closest note to a frequency.
///
/// Returns `None` for non-positive or non-finite input.
pub fn nearest_note(freq: f32, reference_pitch_hz: f32) -> Option<NearestNote> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let midi_float = midi_from_frequency(freq, reference_pitch_hz);
    let midi = midi_float.round() as i32;
    let cents = ((midi_float - midi as f32) * 100.0).clamp(-50.0, 50.0);

    Some(NearestNote {
        note: NoteName::from_midi(midi),
        octave: midi.div_euclid(12) - 1,
        midi,
        cents,
        target_frequency_hz: note_frequency(midi, reference_pitch_hz),
    })
}

/// Calculates the deviation from a target frequency in cents.
///
/// 100 cents are one semitone and 1200 an octave; positive values are sharp.
pub fn cents_between(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// Parses a note name with octave ("A4", "C#3", "Bb2", "C-1") into a MIDI number.
pub fn parse_note(name: &str) -> Option<i32> {
    let name = name.trim();
    let split = name
        .char_indices()
        .find(|(i, c)| *i > 0 && (c.is_ascii_digit() || *c == '-'))
        .map(|(i, _)| i)?;
    let (class, octave) = name.split_at(split);

    let mut chars = class.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let class: String = std::iter::once(letter).chain(chars).collect();

    let semitone = *PITCH_CLASSES.get(&class)?;
    let octave: i32 = octave.parse().ok()?;
    Some((octave + 1) * 12 + semitone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_pitch_is_a4() {
        let nearest = nearest_note(440.0, 440.0).unwrap();
        assert_eq!(nearest.note, NoteName::A);
        assert_eq!(nearest.octave, 4);
        assert_eq!(nearest.midi, 69);
        assert!(nearest.cents.abs() < 1e-3);
    }

    #[test]
    fn octave_changes_at_c() {
        let b3 = nearest_note(246.94, 440.0).unwrap();
        let c4 = nearest_note(261.63, 440.0).unwrap();
        assert_eq!((b3.note, b3.octave), (NoteName::B, 3));
        assert_eq!((c4.note, c4.octave), (NoteName::C, 4));
        let low_e = nearest_note(82.41, 440.0).unwrap();
        assert_eq!((low_e.note, low_e.octave), (NoteName::E, 2));
    }

    #[test]
    fn cents_follow_reference() {
        // 442 Hz is about +7.85 cents against A440.
        let sharp = nearest_note(442.0, 440.0).unwrap();
        assert_eq!(sharp.note, NoteName::A);
        assert!((sharp.cents - 7.85).abs() < 0.05);

        let tuned = nearest_note(442.0, 442.0).unwrap();
        assert!(tuned.cents.abs() < 1e-3);
        assert!((tuned.target_frequency_hz - 442.0).abs() < 1e-3);
    }

    #[test]
    fn cents_stay_within_half_a_semitone() {
        let mut freq = 60.0f32;
        while freq < 2000.0 {
            let nearest = nearest_note(freq, 440.0).unwrap();
            assert!((-50.0..=50.0).contains(&nearest.cents));
            freq *= 1.013;
        }
    }

    #[test]
    fn rejects_non_positive_frequencies() {
        assert!(nearest_note(0.0, 440.0).is_none());
        assert!(nearest_note(-3.0, 440.0).is_none());
        assert!(nearest_note(f32::NAN, 440.0).is_none());
    }

    #[test]
    fn cents_between_octave() {
        assert!((cents_between(880.0, 440.0) - 1200.0).abs() < 1e-3);
        assert!((cents_between(440.0, 880.0) + 1200.0).abs() < 1e-3);
    }

    #[test]
    fn parses_note_names() {
        assert_eq!(parse_note("A4"), Some(69));
        assert_eq!(parse_note("c4"), Some(60));
        assert_eq!(parse_note("C#3"), Some(49));
        assert_eq!(parse_note("Db3"), Some(49));
        assert_eq!(parse_note("Bb2"), Some(46));
        assert_eq!(parse_note("C-1"), Some(0));
        assert_eq!(parse_note("H2"), None);
        assert_eq!(parse_note("A"), None);
        assert!((note_frequency(parse_note("E2").unwrap(), 440.0) - 82.4069).abs() < 1e-2);
    }

    #[test]
    fn display_uses_sharps() {
        assert_eq!(NoteName::FSharp.to_string(), "F#");
        assert_eq!(NoteName::FSharp.flat_name(), "Gb");
    }
}
