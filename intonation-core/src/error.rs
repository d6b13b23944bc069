//! # Error Module
//!
//! Unified error type for the engine.
//!
//! Error strategy:
//! - Configuration errors (no capture device, undecodable file): fatal to the
//!   requested operation, surfaced to the immediate caller
//! - Lifecycle misuse (starting an evaluation twice): a distinct error kind
//! - DSP ambiguity (silence, noise, out-of-range timestamps): never an error,
//!   reported as a zero-confidence detection instead

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for pitch engine operations
#[derive(Debug, Error)]
pub enum PitchError {
    // =========================================================================
    // Value errors
    // =========================================================================
    #[error("MIDI note {0} is out of range (expected 0-127)")]
    MidiNoteOutOfRange(i32),

    #[error("Invalid frequency {0} Hz: must be positive and finite")]
    InvalidFrequency(f64),

    #[error("Unknown note name '{0}' (expected e.g. A4, C#3, Bb2)")]
    UnknownNoteName(String),

    // =========================================================================
    // Configuration errors - fatal to the requested operation
    // =========================================================================
    #[error("Audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Failed to decode audio file '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Lifecycle errors
    // =========================================================================
    #[error("An evaluation session is already running")]
    AlreadyEvaluating,

    #[error("Cannot evaluate an empty scale")]
    EmptyScale,

    #[error("Invalid tempo {0} BPM: must be positive")]
    InvalidTempo(f64),

    #[error("Analysis was cancelled")]
    Cancelled,
}

/// Result type alias for pitch engine operations
pub type Result<T> = std::result::Result<T, PitchError>;

impl PitchError {
    /// Returns true for errors caused by the environment (device, file, config)
    /// rather than by how the API was driven.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PitchError::CaptureUnavailable(_)
                | PitchError::Decode { .. }
                | PitchError::Config(_)
                | PitchError::Io(_)
        )
    }

    /// Create a decode error with context about the file
    pub fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PitchError::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
