//! # Fast Fourier Transform (FFT) Module
//!
//! Frequency-domain front end shared by the realtime detector and the file
//! analyzer. A [`SpectrumProcessor`] is planned once per frame size and then
//! reused for every frame, so the audio thread never allocates.
//!
//! ## Features
//! - High-performance FFT using RustFFT
//! - Hann windowing for reduced spectral leakage
//! - DC offset removal for accurate analysis
//! - Pre-allocated scratch for real-time processing

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
fn remove_dc_offset(signal: &mut [Complex<f64>]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().map(|c| c.re).sum::<f64>() / len as f64;
    if avg.abs() > 1e-9 {
        for sample in signal.iter_mut() {
            sample.re -= avg;
        }
    }
}

/// Builds a Hann window of `n` points.
///
/// The Hann window tapers the frame to zero at the edges, which keeps the
/// energy of each harmonic inside a narrow main lobe.
fn hann_window(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![1.0; n];
    }
    let n_minus_1 = (n - 1) as f64;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n_minus_1).cos()))
        .collect()
}

/// A planned forward FFT with its window table and scratch buffers.
pub struct SpectrumProcessor {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    magnitudes: Vec<f64>,
}

impl SpectrumProcessor {
    pub fn new(frame_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            fft,
            window: hann_window(frame_size),
            buffer: vec![Complex::new(0.0, 0.0); frame_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            magnitudes: vec![0.0; frame_size / 2],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.window.len()
    }

    /// Computes the magnitude spectrum of one frame.
    ///
    /// The frame goes through the following steps:
    /// 1. Copy (zero-padded or truncated to the frame size)
    /// 2. DC offset removal
    /// 3. Hann windowing
    /// 4. Forward FFT, keeping bins up to the Nyquist frequency
    pub fn process(&mut self, signal: &[f32]) -> &[f64] {
        let n = self.frame_size();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < signal.len() { signal[i] as f64 } else { 0.0 };
            *slot = Complex::new(sample, 0.0);
        }
        remove_dc_offset(&mut self.buffer[..signal.len().min(n)]);
        for (slot, w) in self.buffer.iter_mut().zip(&self.window) {
            slot.re *= w;
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (mag, c) in self.magnitudes.iter_mut().zip(&self.buffer) {
            *mag = c.norm(); // .norm() is sqrt(re^2 + im^2)
        }
        &self.magnitudes
    }

    /// Zeroes the magnitude spectrum (used for frames that skip the FFT).
    pub fn clear(&mut self) -> &[f64] {
        self.magnitudes.iter_mut().for_each(|m| *m = 0.0);
        &self.magnitudes
    }

    /// The spectrum computed by the last call to [`process`](Self::process).
    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }
}

impl std::fmt::Debug for SpectrumProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumProcessor")
            .field("frame_size", &self.frame_size())
            .finish()
    }
}

/// Frequency in Hz of FFT bin `bin` (fractional bins allowed).
pub fn bin_to_frequency(bin: f64, frame_size: usize, sample_rate: u32) -> f64 {
    bin * sample_rate as f64 / frame_size as f64
}

/// Fractional FFT bin of `frequency`.
pub fn frequency_to_bin(frequency: f64, frame_size: usize, sample_rate: u32) -> f64 {
    frequency * frame_size as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_window_shape() {
        let w = hann_window(8);
        assert!(w[0].abs() < 1e-12);
        assert!(w[7].abs() < 1e-12);
        assert!(w.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }

    #[test]
    fn dc_is_removed() {
        let mut processor = SpectrumProcessor::new(1024);
        let signal = vec![0.5_f32; 1024];
        let mags = processor.process(&signal);
        assert!(mags[0] < 1e-6, "DC bin = {}", mags[0]);
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let n = 2048;
        let sample_rate = 48_000;
        // Exactly bin 64
        let freq = bin_to_frequency(64.0, n, sample_rate);
        let signal: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin() as f32)
            .collect();

        let mut processor = SpectrumProcessor::new(n);
        let mags = processor.process(&signal);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 64);
        assert_eq!(mags.len(), n / 2);
    }

    #[test]
    fn short_input_is_zero_padded() {
        let mut processor = SpectrumProcessor::new(512);
        let mags = processor.process(&[0.1, -0.1, 0.2]);
        assert_eq!(mags.len(), 256);
        assert!(mags.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn clear_zeroes_spectrum() {
        let mut processor = SpectrumProcessor::new(256);
        let signal: Vec<f32> = (0..256).map(|i| (i as f32 * 0.3).sin()).collect();
        processor.process(&signal);
        assert!(processor.clear().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn bin_conversions_round_trip() {
        let bin = frequency_to_bin(440.0, 4096, 44_100);
        assert!((bin_to_frequency(bin, 4096, 44_100) - 440.0).abs() < 1e-9);
    }
}
