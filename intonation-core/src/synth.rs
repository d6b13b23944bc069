//! Synthetic harmonic tones for calibration, demos and tests.

use crate::tuning::MidiNote;

/// Generates `len` samples of a tone at `frequency` whose k-th partial has
/// amplitude `amplitudes[k - 1]`.
pub fn harmonic_tone(frequency: f64, amplitudes: &[f32], len: usize, sample_rate: u32) -> Vec<f32> {
    let step = 2.0 * std::f64::consts::PI * frequency / sample_rate as f64;
    (0..len)
        .map(|i| {
            let phase = step * i as f64;
            amplitudes
                .iter()
                .enumerate()
                .map(|(k, &a)| a as f64 * (phase * (k + 1) as f64).sin())
                .sum::<f64>() as f32
        })
        .collect()
}

/// Renders a sequence of notes, each held for `note_seconds`, with three
/// partials at decreasing amplitude.
pub fn scale(notes: &[MidiNote], note_seconds: f64, sample_rate: u32) -> Vec<f32> {
    let per_note = (note_seconds * sample_rate as f64).round() as usize;
    notes
        .iter()
        .flat_map(|note| harmonic_tone(note.frequency(), &[0.5, 0.25, 0.125], per_note, sample_rate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_has_requested_length_and_bounded_amplitude() {
        let tone = harmonic_tone(220.0, &[0.5, 0.25], 1000, 44_100);
        assert_eq!(tone.len(), 1000);
        assert!(tone.iter().all(|s| s.abs() <= 0.75 + 1e-6));
        assert_eq!(tone[0], 0.0);
    }

    #[test]
    fn scale_concatenates_notes() {
        let notes = [MidiNote::new(60).unwrap(), MidiNote::new(62).unwrap()];
        assert_eq!(scale(&notes, 0.5, 8000).len(), 8000);
    }
}
