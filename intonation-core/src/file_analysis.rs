//! # File Analysis Module
//!
//! Offline analysis of a whole recording into a pitch time series and a
//! coarse spectrogram, for drawing an overlay after a practice take.
//!
//! A fixed-size window slides over the decoded audio with a fixed hop. Every
//! window contributes one pitch point; every `spectrogram_stride`-th window
//! also contributes one spectrogram row of `spectrogram_bins` linear bins.

use crate::audio::AudioFrame;
use crate::config::{AnalysisConfig, DetectorConfig};
use crate::decoder::{AudioDecoder, WavDecoder};
use crate::error::{PitchError, Result};
use crate::fft::frequency_to_bin;
use crate::pitch::SpectralAnalyzer;
use crate::scale::ScaleSchedule;
use crate::tuning::MidiNote;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Pitch time series. All four sequences have the same length and index `i`
/// of each refers to the same instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchAnalysisData {
    time_stamps: Vec<f64>,
    frequencies: Vec<f64>,
    confidences: Vec<f64>,
    target_notes: Vec<Option<MidiNote>>,
}

impl PitchAnalysisData {
    fn push(&mut self, time: f64, frequency: f64, confidence: f64, target: Option<MidiNote>) {
        self.time_stamps.push(time);
        self.frequencies.push(frequency);
        self.confidences.push(confidence);
        self.target_notes.push(target);
    }

    pub fn data_point_count(&self) -> usize {
        self.time_stamps.len()
    }

    /// Window centres in seconds, strictly increasing.
    pub fn time_stamps(&self) -> &[f64] {
        &self.time_stamps
    }

    /// Detected fundamentals in Hz; 0 where nothing was detected.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn confidences(&self) -> &[f64] {
        &self.confidences
    }

    /// Expected note at each instant, when the analyzer was given a schedule.
    pub fn target_notes(&self) -> &[Option<MidiNote>] {
        &self.target_notes
    }

    /// Index of the point closest in time to `seconds`.
    pub fn nearest_index(&self, seconds: f64) -> Option<usize> {
        self.time_stamps
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - seconds).abs().total_cmp(&(b.1 - seconds).abs()))
            .map(|(i, _)| i)
    }
}

/// Energy over time and frequency: `magnitudes[t][f]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrogramData {
    time_stamps: Vec<f64>,
    frequency_bins: Vec<f64>,
    magnitudes: Vec<Vec<f32>>,
}

impl SpectrogramData {
    fn with_bins(frequency_bins: Vec<f64>) -> Self {
        Self {
            frequency_bins,
            ..Default::default()
        }
    }

    fn push_row(&mut self, time: f64, row: Vec<f32>) {
        debug_assert_eq!(row.len(), self.frequency_bins.len());
        self.time_stamps.push(time);
        self.magnitudes.push(row);
    }

    pub fn time_stamps(&self) -> &[f64] {
        &self.time_stamps
    }

    /// Bin centre frequencies in Hz, ascending.
    pub fn frequency_bins(&self) -> &[f64] {
        &self.frequency_bins
    }

    pub fn magnitudes(&self) -> &[Vec<f32>] {
        &self.magnitudes
    }
}

/// Everything produced by one file analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub pitch: PitchAnalysisData,
    pub spectrogram: SpectrogramData,
    /// Length of the decoded audio in seconds.
    pub duration: f64,
    pub sample_rate: u32,
}

/// Cooperative cancellation flag, checked once per window.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Whole-file pitch and spectrogram analyzer.
#[derive(Clone)]
pub struct FileAnalyzer {
    decoder: Arc<dyn AudioDecoder>,
    detector: DetectorConfig,
    analysis: AnalysisConfig,
    targets: Option<ScaleSchedule>,
}

impl FileAnalyzer {
    pub fn new(decoder: Arc<dyn AudioDecoder>, detector: DetectorConfig, analysis: AnalysisConfig) -> Self {
        Self {
            decoder,
            detector,
            analysis,
            targets: None,
        }
    }

    /// An analyzer for WAV files with default settings.
    pub fn wav() -> Self {
        Self::new(Arc::new(WavDecoder), DetectorConfig::default(), AnalysisConfig::default())
    }

    /// Fills `target_notes` from `schedule`, aligned to the start of the file.
    pub fn with_targets(mut self, schedule: ScaleSchedule) -> Self {
        self.targets = Some(schedule);
        self
    }

    /// Decodes and analyzes `path`.
    ///
    /// `progress` receives `0.0`, then `windows_done / total_windows` after
    /// every window, ending at exactly `1.0`.
    ///
    /// # Errors
    /// - `Decode` if the file cannot be read or holds no audio
    /// - `Cancelled` if `cancel` fires between windows
    pub fn analyze(&self, path: &Path, progress: impl FnMut(f64), cancel: &CancelToken) -> Result<FileAnalysis> {
        debug!(path = %path.display(), "Analyzing file");
        let audio = self.decoder.decode(path)?;
        if audio.is_empty() || audio.sample_rate == 0 {
            return Err(PitchError::decode(path, "file contains no audio"));
        }
        let analysis = self.analyze_frame(&audio, progress, cancel)?;
        info!(
            path = %path.display(),
            points = analysis.pitch.data_point_count(),
            rows = analysis.spectrogram.time_stamps().len(),
            "File analysis complete"
        );
        Ok(analysis)
    }

    /// Analyzes already-decoded audio.
    pub fn analyze_frame(
        &self,
        audio: &AudioFrame,
        mut progress: impl FnMut(f64),
        cancel: &CancelToken,
    ) -> Result<FileAnalysis> {
        let frame_size = self.detector.frame_size;
        let hop = self.analysis.hop_size.max(1);
        let sample_rate = audio.sample_rate.max(1);

        let mut analyzer = SpectralAnalyzer::new(sample_rate, &self.detector);
        let bands = SpectrogramBands::new(&self.analysis, frame_size, sample_rate);
        let mut pitch = PitchAnalysisData::default();
        let mut spectrogram = SpectrogramData::with_bins(bands.centers.clone());

        let starts = window_starts(audio.len(), frame_size, hop);
        let total = starts.len();
        progress(0.0);

        for (index, &start) in starts.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("File analysis cancelled after {index} of {total} windows");
                return Err(PitchError::Cancelled);
            }

            let time = (start as f64 + frame_size as f64 / 2.0) / sample_rate as f64;
            let estimate = analyzer.analyze(audio.window(start, frame_size));
            let (frequency, confidence) = estimate.map_or((0.0, 0.0), |e| (e.frequency, e.confidence));
            let target = self.targets.as_ref().and_then(|s| s.note_at(time));
            pitch.push(time, frequency, confidence, target);

            if index % self.analysis.spectrogram_stride.max(1) == 0 {
                spectrogram.push_row(time, bands.reduce(analyzer.magnitudes()));
            }

            progress((index + 1) as f64 / total as f64);
        }

        Ok(FileAnalysis {
            pitch,
            spectrogram,
            duration: audio.duration(),
            sample_rate: audio.sample_rate,
        })
    }

    /// Runs [`analyze`](Self::analyze) on a background thread.
    pub fn spawn(&self, path: impl Into<PathBuf>) -> AnalysisJob {
        let analyzer = self.clone();
        let path = path.into();
        let cancel = CancelToken::new();
        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let token = cancel.clone();
        let spawned = thread::Builder::new().name("file-analysis".into()).spawn(move || {
            let result = analyzer.analyze(&path, |p| { let _ = progress_tx.send(p); }, &token);
            let _ = result_tx.send(result);
        });

        AnalysisJob {
            progress_rx,
            result_rx,
            cancel,
            spawn_error: spawned.as_ref().err().map(|e| e.to_string()),
            thread_handle: spawned.ok(),
        }
    }
}

impl std::fmt::Debug for FileAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAnalyzer")
            .field("detector", &self.detector)
            .field("analysis", &self.analysis)
            .field("targets", &self.targets)
            .finish()
    }
}

/// Start offsets of the analysis windows over `len` samples.
///
/// Short audio gets one padded window. Otherwise windows step by `hop`, and
/// a last window flush with the end picks up any tail the hop grid leaves out.
fn window_starts(len: usize, frame_size: usize, hop: usize) -> Vec<usize> {
    if len <= frame_size {
        return vec![0];
    }
    let last = len - frame_size;
    let mut starts: Vec<usize> = (0..=last).step_by(hop.max(1)).collect();
    if starts.last() != Some(&last) {
        starts.push(last);
    }
    starts
}

/// Mapping from FFT bins to the coarser spectrogram bins.
struct SpectrogramBands {
    centers: Vec<f64>,
    ranges: Vec<(usize, usize)>,
}

impl SpectrogramBands {
    fn new(config: &AnalysisConfig, frame_size: usize, sample_rate: u32) -> Self {
        let nyquist = sample_rate as f64 / 2.0;
        let max_frequency = config.spectrogram_max_frequency.min(nyquist);
        let bins = config.spectrogram_bins.max(1);
        let width = max_frequency / bins as f64;
        let fft_bins = frame_size / 2;

        let mut centers = Vec::with_capacity(bins);
        let mut ranges = Vec::with_capacity(bins);
        for j in 0..bins {
            let lo = frequency_to_bin(j as f64 * width, frame_size, sample_rate).ceil() as usize;
            let hi = frequency_to_bin((j + 1) as f64 * width, frame_size, sample_rate).ceil() as usize;
            let center = (j as f64 + 0.5) * width;
            let (lo, hi) = if hi > lo {
                (lo, hi)
            } else {
                // Narrower than one FFT bin: take the bin under the centre.
                let nearest = frequency_to_bin(center, frame_size, sample_rate).round() as usize;
                (nearest, nearest + 1)
            };
            centers.push(center);
            ranges.push((lo.min(fft_bins), hi.min(fft_bins)));
        }
        Self { centers, ranges }
    }

    /// Averages the magnitudes falling into each band.
    fn reduce(&self, magnitudes: &[f64]) -> Vec<f32> {
        self.ranges
            .iter()
            .map(|&(lo, hi)| {
                let hi = hi.min(magnitudes.len());
                if lo >= hi {
                    return 0.0;
                }
                (magnitudes[lo..hi].iter().sum::<f64>() / (hi - lo) as f64) as f32
            })
            .collect()
    }
}

/// A file analysis running on a background thread.
#[derive(Debug)]
pub struct AnalysisJob {
    progress_rx: Receiver<f64>,
    result_rx: Receiver<Result<FileAnalysis>>,
    cancel: CancelToken,
    spawn_error: Option<String>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AnalysisJob {
    /// Progress values in the order they were reported.
    pub fn progress(&self) -> &Receiver<f64> {
        &self.progress_rx
    }

    /// The most recent progress value reported so far, if any.
    pub fn latest_progress(&self) -> Option<f64> {
        self.progress_rx.try_iter().last()
    }

    /// Asks the analysis to stop before its next window.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Waits for the analysis to finish.
    pub fn join(mut self) -> Result<FileAnalysis> {
        if let Some(reason) = self.spawn_error.take() {
            return Err(PitchError::Io(std::io::Error::other(reason)));
        }
        let result = self.result_rx.recv();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        result.unwrap_or_else(|_| Err(PitchError::Io(std::io::Error::other("file analysis thread panicked"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::harmonic_tone;

    const SR: u32 = 44_100;

    fn analyze(audio: &AudioFrame) -> FileAnalysis {
        FileAnalyzer::wav()
            .analyze_frame(audio, |_| {}, &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn window_layout() {
        assert_eq!(window_starts(0, 4096, 4000), vec![0]);
        assert_eq!(window_starts(4096, 4096, 4000), vec![0]);
        assert_eq!(window_starts(4097, 4096, 4000), vec![0, 1]);
        assert_eq!(window_starts(12_096, 4096, 4000), vec![0, 4000, 8000]);
        assert_eq!(window_starts(44_100, 4096, 4000).len(), 12);
    }

    #[test]
    fn windows_reach_the_end_of_the_audio() {
        for len in [4097, 5000, 10_000, 44_100, 48_000, 123_457] {
            let starts = window_starts(len, 4096, 4000);
            assert_eq!(starts.last().map(|s| s + 4096), Some(len), "len {len}");
            assert!(starts.windows(2).all(|w| w[0] < w[1] && w[1] - w[0] <= 4000));
        }
    }

    #[test]
    fn tail_after_the_hop_grid_is_analyzed() {
        // Silence on the hop grid, a tone only in the final 2000 samples
        let mut samples = vec![0.0; 12_096];
        samples.extend(harmonic_tone(440.0, &[0.5, 0.25], 2000, SR));
        let result = analyze(&AudioFrame::new(samples, SR));
        let pitch = &result.pitch;
        assert_eq!(pitch.data_point_count(), 4);
        assert!(pitch.confidences()[3] > 0.0);
        assert!(pitch.time_stamps().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn arrays_stay_parallel() {
        let audio = AudioFrame::new(harmonic_tone(220.0, &[0.5, 0.25], SR as usize, SR), SR);
        let result = analyze(&audio);
        let pitch = &result.pitch;
        assert_eq!(pitch.data_point_count(), 12);
        assert_eq!(pitch.frequencies().len(), pitch.data_point_count());
        assert_eq!(pitch.confidences().len(), pitch.data_point_count());
        assert_eq!(pitch.time_stamps().len(), pitch.data_point_count());
        assert_eq!(pitch.target_notes().len(), pitch.data_point_count());
        assert!(pitch.time_stamps().windows(2).all(|w| w[0] < w[1]));
        assert!(pitch.target_notes().iter().all(Option::is_none));
    }

    #[test]
    fn spectrogram_shape() {
        let audio = AudioFrame::new(harmonic_tone(440.0, &[0.5], SR as usize, SR), SR);
        let spectrogram = analyze(&audio).spectrogram;
        assert_eq!(spectrogram.frequency_bins().len(), 128);
        assert_eq!(spectrogram.magnitudes().len(), spectrogram.time_stamps().len());
        assert_eq!(spectrogram.time_stamps().len(), 12);
        assert!(spectrogram.magnitudes().iter().all(|row| row.len() == 128));
        assert!(spectrogram.frequency_bins().windows(2).all(|w| w[0] < w[1]));

        // Energy sits in the band around 440 Hz (bins are 31.25 Hz wide)
        let row = &spectrogram.magnitudes()[3];
        let loudest = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(loudest, 14);
    }

    #[test]
    fn silence_yields_unvoiced_points() {
        let audio = AudioFrame::new(vec![0.0; 3 * 4096], SR);
        let result = analyze(&audio);
        assert!(result.pitch.confidences().iter().all(|&c| c == 0.0));
        assert!(result.pitch.frequencies().iter().all(|&f| f == 0.0));
        assert!(result.spectrogram.magnitudes().iter().flatten().all(|&m| m == 0.0));
    }

    #[test]
    fn short_audio_gets_one_window() {
        let audio = AudioFrame::new(harmonic_tone(300.0, &[0.5, 0.2], 2000, SR), SR);
        let result = analyze(&audio);
        assert_eq!(result.pitch.data_point_count(), 1);
    }

    #[test]
    fn targets_follow_the_schedule() {
        let notes: Vec<MidiNote> = ["C4", "E4"].iter().map(|n| n.parse().unwrap()).collect();
        let schedule = ScaleSchedule::new(&notes, 60.0).unwrap();
        let audio = AudioFrame::new(harmonic_tone(261.63, &[0.5], 2 * SR as usize, SR), SR);
        let result = FileAnalyzer::wav()
            .with_targets(schedule)
            .analyze_frame(&audio, |_| {}, &CancelToken::new())
            .unwrap();

        let pitch = &result.pitch;
        let early = pitch.nearest_index(0.5).unwrap();
        let late = pitch.nearest_index(1.5).unwrap();
        assert_eq!(pitch.target_notes()[early], Some(notes[0]));
        assert_eq!(pitch.target_notes()[late], Some(notes[1]));
    }

    #[test]
    fn cancellation_is_checked_per_window() {
        let audio = AudioFrame::new(vec![0.1; 10 * SR as usize], SR);
        let cancel = CancelToken::new();
        let mut calls = 0;
        let result = FileAnalyzer::wav().analyze_frame(
            &audio,
            |_| {
                calls += 1;
                if calls == 3 {
                    cancel.cancel();
                }
            },
            &cancel,
        );
        assert!(matches!(result, Err(PitchError::Cancelled)));
        assert_eq!(calls, 3);
    }
}
