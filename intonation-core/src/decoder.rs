//! Audio file decoding.
//!
//! The engine only needs "path in, mono samples out"; [`AudioDecoder`] is
//! that seam. [`WavDecoder`] reads PCM and float WAV files with hound and
//! mixes all channels down to mono.

use crate::audio::AudioFrame;
use crate::error::{PitchError, Result};
use std::path::Path;
use tracing::debug;

/// Turns a file into mono samples.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<AudioFrame>;
}

/// Decoder for RIFF/WAVE files.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> Result<AudioFrame> {
        let reader = hound::WavReader::open(path).map_err(|e| PitchError::decode(path, e.to_string()))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(PitchError::decode(path, "WAV header declares no samples"));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| PitchError::decode(path, format!("WAV sample error: {e}")))?,
            hound::SampleFormat::Int => {
                let max_val = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_val))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| PitchError::decode(path, format!("WAV sample error: {e}")))?
            }
        };

        let samples = mix_to_mono(&interleaved, spec.channels as usize);
        debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            samples = samples.len(),
            "Decoded WAV file"
        );
        Ok(AudioFrame::new(samples, spec.sample_rate))
    }
}

/// Averages interleaved channels into one.
fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
