//! Expected-pitch sources for evaluation.
//!
//! A [`ScalePlayer`] is whatever plays the exercise to the singer and can say
//! which note should be sounding right now. Sound output itself lives outside
//! the engine; [`ClockedScale`] tracks the exercise against a monotonic clock.

use crate::error::{PitchError, Result};
use crate::tuning::MidiNote;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// The exercise the singer follows.
pub trait ScalePlayer: Send + Sync {
    /// Begins playback of `notes`, one per beat at `tempo` BPM.
    fn start(&self, notes: &[MidiNote], tempo: f64) -> Result<()>;

    /// Halts playback. Stopping an idle player does nothing.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Index into the exercise and the note that should be sounding now.
    fn current_position(&self) -> Option<(usize, MidiNote)>;

    /// The note that should be sounding now, if any.
    fn current_note(&self) -> Option<MidiNote> {
        self.current_position().map(|(_, note)| note)
    }

    /// Position of the current note in the exercise. Repeated notes have distinct indices.
    fn current_note_index(&self) -> Option<usize> {
        self.current_position().map(|(index, _)| index)
    }

    fn current_frequency(&self) -> Option<f64> {
        self.current_note().map(MidiNote::frequency)
    }
}

/// A note sequence laid out in time, one note per beat.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleSchedule {
    notes: Vec<MidiNote>,
    beat_seconds: f64,
}

impl ScaleSchedule {
    pub fn new(notes: &[MidiNote], tempo: f64) -> Result<Self> {
        if notes.is_empty() {
            return Err(PitchError::EmptyScale);
        }
        if !(tempo > 0.0) || !tempo.is_finite() {
            return Err(PitchError::InvalidTempo(tempo));
        }
        Ok(Self {
            notes: notes.to_vec(),
            beat_seconds: 60.0 / tempo,
        })
    }

    pub fn notes(&self) -> &[MidiNote] {
        &self.notes
    }

    pub fn beat_seconds(&self) -> f64 {
        self.beat_seconds
    }

    /// Total length in seconds.
    pub fn duration(&self) -> f64 {
        self.notes.len() as f64 * self.beat_seconds
    }

    /// The note sounding `seconds` after the start, `None` outside the schedule.
    pub fn note_at(&self, seconds: f64) -> Option<MidiNote> {
        self.position_at(seconds).map(|(_, note)| note)
    }

    /// Index and note sounding `seconds` after the start.
    pub fn position_at(&self, seconds: f64) -> Option<(usize, MidiNote)> {
        if !(seconds >= 0.0) {
            return None;
        }
        let index = (seconds / self.beat_seconds).floor() as usize;
        self.notes.get(index).map(|&note| (index, note))
    }
}

/// A [`ScalePlayer`] that follows its schedule in wall-clock time.
#[derive(Debug, Default)]
pub struct ClockedScale {
    state: Mutex<Option<(ScaleSchedule, Instant)>>,
}

impl ClockedScale {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut Option<(ScaleSchedule, Instant)>) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

impl ScalePlayer for ClockedScale {
    fn start(&self, notes: &[MidiNote], tempo: f64) -> Result<()> {
        let schedule = ScaleSchedule::new(notes, tempo)?;
        debug!(notes = notes.len(), tempo, "Scale playback started");
        self.with_state(|state| *state = Some((schedule, Instant::now())));
        Ok(())
    }

    fn stop(&self) {
        self.with_state(|state| *state = None);
    }

    fn is_playing(&self) -> bool {
        self.with_state(|state| match state {
            Some((schedule, started)) => started.elapsed().as_secs_f64() < schedule.duration(),
            None => false,
        })
    }

    fn current_position(&self) -> Option<(usize, MidiNote)> {
        self.with_state(|state| {
            state
                .as_ref()
                .and_then(|(schedule, started)| schedule.position_at(started.elapsed().as_secs_f64()))
        })
    }
}
