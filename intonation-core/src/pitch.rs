//! # Pitch Detection Module
//!
//! Single-frame fundamental frequency estimation for the singing voice using
//! the Harmonic Product Spectrum (HPS).
//!
//! ## Features
//! - RMS gate that skips the FFT on silent frames
//! - HPS over a restricted vocal band with a spectral floor
//! - Octave error mitigation against the raw spectrum
//! - Log-parabolic interpolation for sub-bin accuracy
//! - Harmonic energy ratio as the confidence score

use crate::config::DetectorConfig;
use crate::fft::{SpectrumProcessor, bin_to_frequency, frequency_to_bin};

/// Bins on either side of a harmonic counted as belonging to it.
/// The Hann main lobe is four bins wide.
const HARMONIC_HALF_WIDTH: usize = 2;

/// Minimum magnitude, relative to the frame's peak, of a bin accepted as the fundamental.
const FUNDAMENTAL_SUPPORT: f64 = 0.05;

/// A fundamental frequency estimate for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz.
    pub frequency: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Stateful per-frame analyzer.
///
/// All buffers are allocated in [`new`](Self::new); [`analyze`](Self::analyze)
/// does not allocate, so one analyzer can live on an audio callback for a
/// whole detection session.
#[derive(Debug)]
pub struct SpectralAnalyzer {
    config: DetectorConfig,
    sample_rate: u32,
    spectrum: SpectrumProcessor,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32, config: &DetectorConfig) -> Self {
        Self {
            config: config.clone(),
            sample_rate,
            spectrum: SpectrumProcessor::new(config.frame_size),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    /// Frequency resolution of one FFT bin in Hz.
    pub fn bin_width(&self) -> f64 {
        bin_to_frequency(1.0, self.frame_size(), self.sample_rate)
    }

    /// Magnitude spectrum of the last analyzed frame (zeros after a silent frame).
    pub fn magnitudes(&self) -> &[f64] {
        self.spectrum.magnitudes()
    }

    /// Estimates the fundamental of one frame.
    ///
    /// Frames shorter than the frame size are zero-padded, longer ones are
    /// truncated. Returns `None` for silence or when no bin in the band
    /// carries energy; ambiguous frames come back with a low confidence.
    pub fn analyze(&mut self, samples: &[f32]) -> Option<PitchEstimate> {
        // --- Noise gate: skip the FFT entirely on silence ---
        let used = &samples[..samples.len().min(self.frame_size())];
        if used.is_empty() || rms(used) < self.config.silence_rms {
            self.spectrum.clear();
            return None;
        }

        self.spectrum.process(used);
        let mags = self.spectrum.magnitudes();

        let peak = mags.iter().skip(1).cloned().fold(0.0_f64, f64::max);
        if !(peak > 0.0) || !peak.is_finite() {
            return None;
        }
        let floor = peak * self.config.hps_floor;

        // --- Band restriction ---
        let n = self.frame_size();
        let min_bin = (frequency_to_bin(self.config.min_frequency, n, self.sample_rate).ceil() as usize).max(1);
        let max_bin = (frequency_to_bin(self.config.max_frequency, n, self.sample_rate).floor() as usize)
            .min(mags.len().saturating_sub(1));
        if min_bin > max_bin {
            return None;
        }

        // --- Harmonic product spectrum, accumulated as log sums ---
        let harmonics = self.config.harmonics;
        let mut best_bin = min_bin;
        let mut best_score = f64::NEG_INFINITY;
        for bin in min_bin..=max_bin {
            let score: f64 = (1..=harmonics)
                .map(|h| (decimated_magnitude(mags, bin, h) + floor).ln())
                .sum();
            if score > best_score {
                best_score = score;
                best_bin = bin;
            }
        }

        // A pure tone scores the same at every sub-harmonic, so the chosen bin
        // must itself carry energy. Otherwise climb to the first multiple that does.
        let support = peak * FUNDAMENTAL_SUPPORT;
        let mut multiple = 1;
        if decimated_magnitude(mags, best_bin, 1).max(neighbour_max(mags, best_bin)) < support {
            if let Some(k) = (2..=harmonics).find(|&k| decimated_magnitude(mags, best_bin, k) >= support) {
                multiple = k;
            }
        }

        // `best_bin * multiple` is only good to about `multiple / 2` bins, so
        // anchor on the actual spectral peak around it before refining.
        let radius = multiple.div_ceil(2) + HARMONIC_HALF_WIDTH;
        let candidate_bin = strongest_bin_near(mags, best_bin * multiple, radius);

        // --- Refine against the raw spectrum ---
        let mut frequency = refine_from_spectrum(mags, candidate_bin as f64, self.sample_rate);

        // --- Octave error mitigation: the first strong harmonic is often mistaken for F0 ---
        let half = frequency / 2.0;
        if half >= self.config.min_frequency
            && self.magnitude_near(half) >= self.config.octave_ratio * self.magnitude_near(frequency)
        {
            let half_bin = frequency_to_bin(half, n, self.sample_rate);
            frequency = refine_from_spectrum(mags, half_bin, self.sample_rate);
        }

        if !frequency.is_finite() || frequency <= 0.0 {
            return None;
        }

        let confidence = self.harmonic_energy_ratio(frequency);
        Some(PitchEstimate { frequency, confidence })
    }

    /// Largest magnitude within one bin of `frequency`.
    fn magnitude_near(&self, frequency: f64) -> f64 {
        let mags = self.spectrum.magnitudes();
        let center = frequency_to_bin(frequency, self.frame_size(), self.sample_rate).round() as usize;
        let start = center.saturating_sub(1);
        let end = (center + 1).min(mags.len().saturating_sub(1));
        if start > end {
            return 0.0;
        }
        mags[start..=end].iter().cloned().fold(0.0, f64::max)
    }

    /// Share of the frame's spectral energy that sits on the harmonics of `f0`.
    fn harmonic_energy_ratio(&self, f0: f64) -> f64 {
        let mags = self.spectrum.magnitudes();
        let total: f64 = mags.iter().skip(1).map(|m| m * m).sum();
        if !(total > 0.0) {
            return 0.0;
        }

        let f0_bin = frequency_to_bin(f0, self.frame_size(), self.sample_rate);
        let mut harmonic = 0.0;
        let mut next_free = 1;
        for h in 1..=self.config.harmonics {
            let center = (f0_bin * h as f64).round() as usize;
            let start = center.saturating_sub(HARMONIC_HALF_WIDTH).max(next_free);
            let end = (center + HARMONIC_HALF_WIDTH).min(mags.len() - 1);
            if start > end {
                continue;
            }
            harmonic += mags[start..=end].iter().map(|m| m * m).sum::<f64>();
            next_free = end + 1;
        }

        (harmonic / total).clamp(0.0, 1.0)
    }
}

/// Root mean square of a block of samples.
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64).sqrt()
}

/// Value of the spectrum downsampled by `factor` at `bin`.
///
/// Takes the maximum over the `factor` bins that fold onto `bin`, so a
/// harmonic that falls between bins still lines up with its fundamental.
fn decimated_magnitude(mags: &[f64], bin: usize, factor: usize) -> f64 {
    let center = bin * factor;
    let half = factor / 2;
    let start = center.saturating_sub(half);
    let end = center + half;
    if start >= mags.len() {
        return 0.0;
    }
    mags[start..=end.min(mags.len() - 1)].iter().cloned().fold(0.0, f64::max)
}

/// Largest magnitude in the bins directly next to `bin`.
fn neighbour_max(mags: &[f64], bin: usize) -> f64 {
    let left = bin.checked_sub(1).map_or(0.0, |i| mags[i]);
    let right = mags.get(bin + 1).copied().unwrap_or(0.0);
    left.max(right)
}

/// Index of the largest magnitude within `radius` bins of `center`, skipping DC.
fn strongest_bin_near(mags: &[f64], center: usize, radius: usize) -> usize {
    let start = center.saturating_sub(radius).max(1);
    let end = (center + radius).min(mags.len().saturating_sub(1));
    if start > end {
        return center;
    }
    mags[start..=end]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(center, |(offset, _)| start + offset)
}

/// Refines a frequency estimate using the magnitude spectrum.
///
/// Finds the strongest bin within two bins of `rough_bin`, then fits a
/// parabola through the log magnitudes of that bin and its neighbours. With
/// a Hann window the main lobe is close to Gaussian, which makes the
/// log-parabolic fit accurate to a small fraction of a bin.
pub fn refine_from_spectrum(spectrum_magnitudes: &[f64], rough_bin: f64, sample_rate: u32) -> f64 {
    let frame_size = spectrum_magnitudes.len() * 2;
    let rough_freq = bin_to_frequency(rough_bin, frame_size, sample_rate);
    if spectrum_magnitudes.len() < 3 || rough_bin <= 0.0 {
        return rough_freq;
    }

    let search_radius = 2.0;
    let start_bin = (rough_bin - search_radius).max(1.0) as usize;
    let end_bin = ((rough_bin + search_radius) as usize).min(spectrum_magnitudes.len() - 2);
    if start_bin > end_bin {
        return rough_freq;
    }

    let peak_bin = spectrum_magnitudes[start_bin..=end_bin]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(offset, _)| start_bin + offset)
        .unwrap_or(start_bin);

    let y1 = spectrum_magnitudes[peak_bin - 1].ln();
    let y2 = spectrum_magnitudes[peak_bin].ln();
    let y3 = spectrum_magnitudes[peak_bin + 1].ln();
    if !y1.is_finite() || !y2.is_finite() || !y3.is_finite() {
        return bin_to_frequency(peak_bin as f64, frame_size, sample_rate);
    }

    let denominator = 2.0 * y2 - y1 - y3;
    let peak_shift = if denominator.abs() < 1e-12 {
        0.0
    } else {
        ((y3 - y1) / (2.0 * denominator)).clamp(-0.5, 0.5)
    };

    bin_to_frequency(peak_bin as f64 + peak_shift, frame_size, sample_rate)
}
