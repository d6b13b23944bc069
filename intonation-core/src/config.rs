//! # Configuration Module
//!
//! Tunable parameters for the detector, the file analyzer and the evaluator.
//! Every struct has a `Default` carrying the tuned values and can be loaded
//! from JSON; missing fields fall back to the defaults.

use crate::error::{PitchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Parameters of the per-frame spectral pitch analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples per analysis frame. Must be a power of two.
    pub frame_size: usize,
    /// Lowest fundamental considered, in Hz.
    pub min_frequency: f64,
    /// Highest fundamental considered, in Hz.
    pub max_frequency: f64,
    /// Number of spectra multiplied in the harmonic product (original + factors 2..N).
    pub harmonics: usize,
    /// Frames with an RMS below this are treated as silence.
    pub silence_rms: f64,
    /// Sub-harmonic magnitude, relative to the candidate, at which the lower octave wins.
    pub octave_ratio: f64,
    /// Spectral floor added to every HPS factor, relative to the frame's peak magnitude.
    pub hps_floor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            min_frequency: 80.0,
            max_frequency: 1000.0,
            harmonics: 5,
            silence_rms: 0.005,
            octave_ratio: 0.8,
            hps_floor: 1e-3,
        }
    }
}

/// Parameters of offline whole-file analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Samples between successive analysis windows.
    pub hop_size: usize,
    /// Number of linear frequency bins in each spectrogram row.
    pub spectrogram_bins: usize,
    /// Upper edge of the spectrogram, in Hz.
    pub spectrogram_max_frequency: f64,
    /// A spectrogram row is emitted every `spectrogram_stride` windows.
    pub spectrogram_stride: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            hop_size: 4000,
            spectrogram_bins: 128,
            spectrogram_max_frequency: 4000.0,
            spectrogram_stride: 1,
        }
    }
}

/// Parameters of a scale-practice evaluation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Interval between samples of expected vs detected pitch.
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    /// Deviation above which a sample counts as a gross pitch error.
    pub gross_error_cents: f64,
    /// Allowed distance from exactly one octave for an octave error.
    pub octave_tolerance_cents: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            gross_error_cents: 50.0,
            octave_tolerance_cents: 50.0,
        }
    }
}

/// All engine settings, as stored in a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub analysis: AnalysisConfig,
    pub evaluator: EvaluatorConfig,
}

impl EngineConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| PitchError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.analysis.validate()?;
        self.evaluator.validate()
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_size < 256 || !self.frame_size.is_power_of_two() {
            return Err(PitchError::Config(format!(
                "frame_size must be a power of two >= 256, got {}",
                self.frame_size
            )));
        }
        if !(self.min_frequency > 0.0 && self.min_frequency < self.max_frequency) {
            return Err(PitchError::Config(format!(
                "frequency band {}..{} Hz is empty",
                self.min_frequency, self.max_frequency
            )));
        }
        if self.harmonics == 0 {
            return Err(PitchError::Config("harmonics must be at least 1".into()));
        }
        if !(self.octave_ratio > 0.0) || !(self.hps_floor >= 0.0) || !(self.silence_rms >= 0.0) {
            return Err(PitchError::Config(
                "octave_ratio must be positive, hps_floor and silence_rms non-negative".into(),
            ));
        }
        Ok(())
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hop_size == 0 || self.spectrogram_stride == 0 || self.spectrogram_bins == 0 {
            return Err(PitchError::Config(
                "hop_size, spectrogram_stride and spectrogram_bins must be non-zero".into(),
            ));
        }
        if !(self.spectrogram_max_frequency > 0.0) {
            return Err(PitchError::Config("spectrogram_max_frequency must be positive".into()));
        }
        Ok(())
    }
}

impl EvaluatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval.is_zero() {
            return Err(PitchError::Config("sample_interval must be non-zero".into()));
        }
        if !(self.gross_error_cents > 0.0) || !(self.octave_tolerance_cents > 0.0) {
            return Err(PitchError::Config("cent thresholds must be positive".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_frame() {
        let config = DetectorConfig { frame_size: 3000, ..Default::default() };
        assert!(matches!(config.validate(), Err(PitchError::Config(_))));
    }

    #[test]
    fn rejects_empty_band() {
        let config = DetectorConfig {
            min_frequency: 500.0,
            max_frequency: 200.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "detector": {{ "frame_size": 2048 }}, "evaluator": {{ "sample_interval": 50 }} }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.detector.frame_size, 2048);
        assert_eq!(config.detector.harmonics, 5);
        assert_eq!(config.evaluator.sample_interval, Duration::from_millis(50));
        assert_eq!(config.analysis, AnalysisConfig::default());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(EngineConfig::load(file.path()), Err(PitchError::Config(_))));
    }
}
