// intonation-core/src/lib.rs

//! The core logic for the singing-practice pitch engine.
//! This crate is responsible for audio capture, pitch detection,
//! whole-file analysis and accuracy evaluation. It is completely headless
//! and contains no UI code.

pub mod audio;
pub mod config;
pub mod decoder;
pub mod error;
pub mod evaluation;
pub mod fft;
pub mod file_analysis;
pub mod pitch;
pub mod realtime;
pub mod scale;
pub mod synth;
pub mod tuning;

pub use audio::{AudioFrame, CaptureSource, CpalCapture, FrameSink, ReplaySource, SinkFactory};
pub use config::{AnalysisConfig, DetectorConfig, EngineConfig, EvaluatorConfig};
pub use decoder::{AudioDecoder, WavDecoder};
pub use error::{PitchError, Result};
pub use evaluation::{AccuracyEvaluator, EvaluationResult, EvaluationSession};
pub use file_analysis::{AnalysisJob, CancelToken, FileAnalysis, FileAnalyzer, PitchAnalysisData, SpectrogramData};
pub use pitch::{PitchEstimate, SpectralAnalyzer};
pub use realtime::{DetectionSnapshot, PitchObserver, PitchQuery, RealtimeDetector};
pub use scale::{ClockedScale, ScalePlayer, ScaleSchedule};
pub use tuning::{MidiNote, PitchClass};

use serde::{Deserialize, Serialize};

/// One pitch detection, as handed to observers.
///
/// A `confidence` of zero means nothing was detected and `frequency` must not
/// be trusted; [`DetectedPitch::unvoiced`] is the canonical such value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPitch {
    /// The detected fundamental frequency in Hz.
    pub frequency: f64,
    /// The confidence of the detection (0.0 to 1.0).
    pub confidence: f64,
    /// The name of the nearest note, e.g. "A4". Empty when unvoiced.
    pub note_name: String,
    /// Deviation from an expected note in cents, when one was given.
    pub cents: Option<i32>,
}

impl DetectedPitch {
    /// A "no pitch" result.
    pub fn unvoiced() -> Self {
        Self {
            frequency: 0.0,
            confidence: 0.0,
            note_name: String::new(),
            cents: None,
        }
    }

    /// Builds a detection from an analyzer estimate, naming the nearest note.
    pub fn from_estimate(estimate: PitchEstimate) -> Self {
        match tuning::classify(estimate.frequency) {
            Ok(class) => Self {
                frequency: estimate.frequency,
                confidence: estimate.confidence.clamp(0.0, 1.0),
                note_name: class.name,
                cents: None,
            },
            Err(_) => Self::unvoiced(),
        }
    }

    /// Same as [`from_estimate`](Self::from_estimate) but `None` becomes [`unvoiced`](Self::unvoiced).
    pub fn from_option(estimate: Option<PitchEstimate>) -> Self {
        estimate.map_or_else(Self::unvoiced, Self::from_estimate)
    }

    /// Fills in `cents` relative to an expected frequency.
    pub fn with_target(mut self, target_frequency: f64) -> Self {
        if self.is_voiced() && target_frequency > 0.0 {
            self.cents = Some(tuning::cents_between(self.frequency, target_frequency).round() as i32);
        }
        self
    }

    pub fn is_voiced(&self) -> bool {
        self.confidence > 0.0 && self.frequency > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvoiced_has_zero_confidence() {
        let pitch = DetectedPitch::unvoiced();
        assert!(!pitch.is_voiced());
        assert_eq!(pitch.confidence, 0.0);
        assert!(pitch.cents.is_none());
    }

    #[test]
    fn estimate_is_named_and_compared() {
        let pitch = DetectedPitch::from_estimate(PitchEstimate {
            frequency: 265.0,
            confidence: 0.9,
        });
        assert_eq!(pitch.note_name, "C4");
        assert!(pitch.cents.is_none());

        let compared = pitch.with_target(261.63);
        assert_eq!(compared.cents, Some(22));
    }

    #[test]
    fn unvoiced_is_never_compared() {
        assert!(DetectedPitch::unvoiced().with_target(440.0).cents.is_none());
        assert_eq!(DetectedPitch::from_option(None), DetectedPitch::unvoiced());
    }
}
