//! # Musical Tuning Module
//!
//! Equal-tempered note arithmetic for the pitch classifier.
//!
//! ## Features
//! - MIDI note values (0-127) with A4 = 440 Hz
//! - Note names with octave numbers (MIDI 60 = "C4")
//! - Nearest-note classification of a frequency with cent deviation
//! - Note name parsing (sharps and flats)

use crate::error::{PitchError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Concert pitch reference.
pub const A4_FREQUENCY: f64 = 440.0;
const A4_MIDI: f64 = 69.0;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Lookup from every accepted spelling of a pitch class to its semitone offset from C.
static PITCH_CLASSES: Lazy<BTreeMap<&'static str, i32>> = Lazy::new(|| {
    let mut map: BTreeMap<&'static str, i32> = NOTE_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i as i32))
        .collect();
    for (flat, semitone) in [("Db", 1), ("Eb", 3), ("Gb", 6), ("Ab", 8), ("Bb", 10), ("Cb", -1), ("Fb", 4)] {
        map.insert(flat, semitone);
    }
    map.insert("E#", 5);
    map.insert("B#", 12);
    map
});

/// A note of the 128-key MIDI range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct MidiNote(u8);

impl MidiNote {
    pub const MIN: MidiNote = MidiNote(0);
    pub const MAX: MidiNote = MidiNote(127);

    /// Creates a note, failing outside `0..=127`.
    pub fn new(value: i32) -> Result<Self> {
        if (0..=127).contains(&value) {
            Ok(MidiNote(value as u8))
        } else {
            Err(PitchError::MidiNoteOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Equal-tempered frequency, `440 * 2^((value - 69) / 12)`.
    pub fn frequency(self) -> f64 {
        A4_FREQUENCY * 2.0_f64.powf((self.0 as f64 - A4_MIDI) / 12.0)
    }

    /// Octave number in scientific pitch notation (MIDI 60 is in octave 4).
    pub fn octave(self) -> i8 {
        (self.0 / 12) as i8 - 1
    }

    /// Display name such as "A4" or "C#3".
    pub fn name(self) -> String {
        format!("{}{}", NOTE_NAMES[(self.0 % 12) as usize], self.octave())
    }

    /// Parses names like "A4", "C#3", "Bb2" or "C-1".
    pub fn from_name(name: &str) -> Result<Self> {
        let name = name.trim();
        let unknown = || PitchError::UnknownNoteName(name.to_string());

        let split = name
            .char_indices()
            .find(|&(i, c)| i > 0 && (c.is_ascii_digit() || c == '-'))
            .map(|(i, _)| i)
            .ok_or_else(unknown)?;
        let (class, octave) = name.split_at(split);

        let mut class = class.to_string();
        if let Some(first) = class.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        let semitone = *PITCH_CLASSES.get(class.as_str()).ok_or_else(unknown)?;
        let octave: i32 = octave.parse().map_err(|_| unknown())?;

        MidiNote::new((octave + 1) * 12 + semitone)
    }
}

impl fmt::Display for MidiNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for MidiNote {
    type Err = PitchError;

    fn from_str(s: &str) -> Result<Self> {
        MidiNote::from_name(s)
    }
}

impl TryFrom<i32> for MidiNote {
    type Error = PitchError;

    fn try_from(value: i32) -> Result<Self> {
        MidiNote::new(value)
    }
}

impl From<MidiNote> for i32 {
    fn from(note: MidiNote) -> i32 {
        note.0 as i32
    }
}

/// The nearest equal-tempered note to a frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchClass {
    pub note: MidiNote,
    /// Display name, e.g. "A4".
    pub name: String,
    pub octave: i8,
    /// Signed deviation from the note's exact frequency (positive = sharp).
    pub cents: f64,
}

/// Maps a frequency to its nearest note and the cent deviation from it.
///
/// Frequencies beyond the MIDI range are clamped to note 0 or 127, so the
/// cent deviation can exceed ±50 there.
pub fn classify(frequency: f64) -> Result<PitchClass> {
    if !(frequency > 0.0) || !frequency.is_finite() {
        return Err(PitchError::InvalidFrequency(frequency));
    }

    let semitones = A4_MIDI + 12.0 * (frequency / A4_FREQUENCY).log2();
    let value = semitones.round().clamp(0.0, 127.0) as u8;
    let note = MidiNote(value);

    Ok(PitchClass {
        note,
        name: note.name(),
        octave: note.octave(),
        cents: cents_between(frequency, note.frequency()),
    })
}

/// Deviation of `frequency` from `target` in cents.
///
/// - 100 cents = 1 semitone
/// - 1200 cents = 1 octave
/// - Positive values are sharp, negative values flat
pub fn cents_between(frequency: f64, target: f64) -> f64 {
    1200.0 * (frequency / target).log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midi_frequency_formula() {
        assert_eq!(MidiNote::new(69).unwrap().frequency(), 440.0);
        for n in 0..=127 {
            let expected = 440.0 * 2.0_f64.powf((n as f64 - 69.0) / 12.0);
            assert_eq!(MidiNote::new(n).unwrap().frequency(), expected);
        }
        let c4 = MidiNote::new(60).unwrap().frequency();
        assert!((c4 - 261.6256).abs() < 1e-3);
    }

    #[test]
    fn midi_range_is_enforced() {
        assert!(matches!(MidiNote::new(-1), Err(PitchError::MidiNoteOutOfRange(-1))));
        assert!(matches!(MidiNote::new(128), Err(PitchError::MidiNoteOutOfRange(128))));
        assert_eq!(MidiNote::new(0).unwrap(), MidiNote::MIN);
        assert_eq!(MidiNote::new(127).unwrap(), MidiNote::MAX);
    }

    #[test]
    fn notes_are_ordered_by_value() {
        let c4 = MidiNote::new(60).unwrap();
        let e4 = MidiNote::new(64).unwrap();
        assert!(c4 < e4);
        assert_eq!(c4.max(e4), e4);
    }

    #[test]
    fn names_and_parsing() {
        assert_eq!(MidiNote::new(69).unwrap().name(), "A4");
        assert_eq!(MidiNote::new(60).unwrap().name(), "C4");
        assert_eq!(MidiNote::new(0).unwrap().name(), "C-1");
        assert_eq!(MidiNote::new(61).unwrap().to_string(), "C#4");

        assert_eq!(MidiNote::from_name("A4").unwrap().value(), 69);
        assert_eq!(MidiNote::from_name("c#4").unwrap().value(), 61);
        assert_eq!(MidiNote::from_name("Db4").unwrap().value(), 61);
        assert_eq!(MidiNote::from_name("Bb2").unwrap().value(), 46);
        assert_eq!(MidiNote::from_name("C-1").unwrap().value(), 0);
        assert_eq!("G9".parse::<MidiNote>().unwrap().value(), 127);

        assert!(matches!(MidiNote::from_name("H4"), Err(PitchError::UnknownNoteName(_))));
        assert!(MidiNote::from_name("A").is_err());
        assert!(MidiNote::from_name("A99").is_err());
    }

    #[test]
    fn classify_exact_and_detuned() {
        let a4 = classify(440.0).unwrap();
        assert_eq!(a4.name, "A4");
        assert_eq!(a4.octave, 4);
        assert!(a4.cents.abs() < 1e-9);

        // ~+20 cents above C4
        let sharp = classify(265.0).unwrap();
        assert_eq!(sharp.name, "C4");
        assert!((sharp.cents - 22.2).abs() < 1.0, "cents = {}", sharp.cents);

        // Just under the C#4/D4 midpoint rounds to C#4
        let flat = classify(285.0).unwrap();
        assert_eq!(flat.name, "C#4");
        assert!(flat.cents.abs() <= 50.0);
    }

    #[test]
    fn classify_rejects_non_positive() {
        assert!(matches!(classify(0.0), Err(PitchError::InvalidFrequency(_))));
        assert!(classify(-10.0).is_err());
        assert!(classify(f64::NAN).is_err());
        assert!(classify(f64::INFINITY).is_err());
    }

    #[test]
    fn classify_clamps_to_midi_range() {
        let low = classify(1.0).unwrap();
        assert_eq!(low.note, MidiNote::MIN);
        assert!(low.cents < -50.0);
    }

    #[test]
    fn cents_of_an_octave() {
        assert!((cents_between(880.0, 440.0) - 1200.0).abs() < 1e-9);
        assert!((cents_between(220.0, 440.0) + 1200.0).abs() < 1e-9);
    }

    #[test]
    fn serde_uses_plain_integers() {
        let note = MidiNote::new(64).unwrap();
        assert_eq!(serde_json::to_string(&note).unwrap(), "64");
        assert_eq!(serde_json::from_str::<MidiNote>("64").unwrap(), note);
        assert!(serde_json::from_str::<MidiNote>("200").is_err());
    }
}
