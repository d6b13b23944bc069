//! # Realtime Detection Module
//!
//! Streaming pitch detection on live audio.
//!
//! ## Architecture
//! - **Capture thread**: every frame is analyzed in-line by a
//!   [`SpectralAnalyzer`] owned by the sink closure, then published. The
//!   analyzer is built when the source reports its rate, before frames flow
//! - **Publication**: an immutable [`DetectionSnapshot`] behind an `Arc` in a
//!   single-slot cell. The slot lock only guards the pointer swap
//! - **Observers**: any number of [`PitchObserver`]s read the latest snapshot;
//!   the detector is the only writer

use crate::audio::{AudioFrame, CaptureSource, FrameSink, SinkFactory};
use crate::config::DetectorConfig;
use crate::decoder::{AudioDecoder, WavDecoder};
use crate::error::Result;
use crate::pitch::SpectralAnalyzer;
use crate::DetectedPitch;
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What the detector saw in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSnapshot {
    /// Position of the frame in arrival order within its session.
    pub sequence: u64,
    /// The detection; unvoiced for silent or pitchless frames.
    pub pitch: DetectedPitch,
    /// Magnitude spectrum of the frame, up to the Nyquist frequency.
    pub spectrum: Vec<f32>,
    pub sample_rate: u32,
}

/// Single-slot "latest value" cell.
#[derive(Debug, Default)]
struct SnapshotSlot {
    latest: Mutex<Option<Arc<DetectionSnapshot>>>,
}

impl SnapshotSlot {
    fn guard(&self) -> MutexGuard<'_, Option<Arc<DetectionSnapshot>>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the latest snapshot unless the producing session has ended.
    /// Returns whichever snapshot did not end up in the slot.
    fn publish(&self, session: &AtomicBool, snapshot: Arc<DetectionSnapshot>) -> Option<Arc<DetectionSnapshot>> {
        let mut latest = self.guard();
        if session.load(Ordering::Acquire) {
            latest.replace(snapshot)
        } else {
            Some(snapshot)
        }
    }

    fn get(&self) -> Option<Arc<DetectionSnapshot>> {
        self.guard().clone()
    }

    fn clear(&self) {
        *self.guard() = None;
    }
}

/// Read-only handle to the detector's latest output.
#[derive(Debug, Clone)]
pub struct PitchObserver {
    slot: Arc<SnapshotSlot>,
}

impl PitchObserver {
    pub fn snapshot(&self) -> Option<Arc<DetectionSnapshot>> {
        self.slot.get()
    }

    pub fn detected_pitch(&self) -> Option<DetectedPitch> {
        self.slot.get().map(|s| s.pitch.clone())
    }
}

/// Per-session frame handler living on the capture thread.
struct FrameProcessor {
    analyzer: SpectralAnalyzer,
    /// Spectrum buffer reclaimed from a snapshot no observer holds any more.
    spare_spectrum: Vec<f32>,
    sequence: u64,
    slot: Arc<SnapshotSlot>,
    session: Arc<AtomicBool>,
}

impl FrameProcessor {
    fn new(sample_rate: u32, config: &DetectorConfig, slot: Arc<SnapshotSlot>, session: Arc<AtomicBool>) -> Self {
        Self {
            analyzer: SpectralAnalyzer::new(sample_rate, config),
            spare_spectrum: Vec::with_capacity(config.frame_size / 2),
            sequence: 0,
            slot,
            session,
        }
    }

    fn process(&mut self, frame: AudioFrame) {
        if !self.session.load(Ordering::Acquire) {
            return;
        }

        let pitch = DetectedPitch::from_option(self.analyzer.analyze(&frame.samples));
        let mut spectrum = std::mem::take(&mut self.spare_spectrum);
        spectrum.clear();
        spectrum.extend(self.analyzer.magnitudes().iter().map(|&m| m as f32));
        trace!(sequence = self.sequence, frequency = pitch.frequency, confidence = pitch.confidence, "frame analyzed");

        let snapshot = Arc::new(DetectionSnapshot {
            sequence: self.sequence,
            pitch,
            spectrum,
            sample_rate: self.analyzer.sample_rate(),
        });
        self.sequence += 1;

        if let Some(displaced) = self.slot.publish(&self.session, snapshot) {
            if let Ok(displaced) = Arc::try_unwrap(displaced) {
                self.spare_spectrum = displaced.spectrum;
            }
        }
    }
}

/// Live pitch detector with an `Idle -> Detecting -> Idle` lifecycle.
pub struct RealtimeDetector {
    config: DetectorConfig,
    source: Box<dyn CaptureSource>,
    decoder: Arc<dyn AudioDecoder>,
    slot: Arc<SnapshotSlot>,
    /// Present while detecting; cleared to retire in-flight frames.
    session: Option<Arc<AtomicBool>>,
}

impl RealtimeDetector {
    pub fn new(source: impl CaptureSource + 'static, config: DetectorConfig) -> Self {
        Self {
            config,
            source: Box::new(source),
            decoder: Arc::new(WavDecoder),
            slot: Arc::new(SnapshotSlot::default()),
            session: None,
        }
    }

    /// Uses `decoder` for single-shot file queries instead of the WAV decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_detecting(&self) -> bool {
        self.session.is_some()
    }

    /// Starts capturing and analyzing. Does nothing if already detecting.
    ///
    /// # Errors
    /// `PitchError::CaptureUnavailable` when the capture source cannot start.
    pub fn start(&mut self) -> Result<()> {
        if self.is_detecting() {
            debug!("[DETECTOR] start() while detecting, ignoring");
            return Ok(());
        }

        let session = Arc::new(AtomicBool::new(true));
        let config = self.config.clone();
        let slot = Arc::clone(&self.slot);
        let session_flag = Arc::clone(&session);
        let make_sink: SinkFactory = Box::new(move |sample_rate: u32| -> FrameSink {
            let mut processor = FrameProcessor::new(sample_rate, &config, slot, session_flag);
            Box::new(move |frame| processor.process(frame))
        });

        match self.source.open(make_sink) {
            Ok(sample_rate) => {
                info!("[DETECTOR] Detection started at {} Hz", sample_rate);
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                session.store(false, Ordering::Release);
                warn!("[DETECTOR] Could not start capture: {}", e);
                Err(e)
            }
        }
    }

    /// Stops detection and clears the exposed state. Always succeeds.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.store(false, Ordering::Release);
            self.source.close();
            info!("[DETECTOR] Detection stopped");
        }
        self.slot.clear();
    }

    /// The latest detection, or `None` when idle or before the first frame.
    pub fn detected_pitch(&self) -> Option<DetectedPitch> {
        self.observer().detected_pitch()
    }

    /// The latest magnitude spectrum, empty when idle.
    pub fn spectrum(&self) -> Vec<f32> {
        self.slot.get().map(|s| s.spectrum.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<Arc<DetectionSnapshot>> {
        self.slot.get()
    }

    /// A cloneable read-only handle for other threads.
    pub fn observer(&self) -> PitchObserver {
        PitchObserver {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Analyzes one frame of `path` centred at `at_time` seconds, off-thread.
    ///
    /// Unreadable files and timestamps outside the file resolve to an
    /// unvoiced pitch rather than an error. The query owns everything it
    /// needs, so it completes even if the detector is stopped or dropped.
    pub fn analyze_pitch_from_file(&self, path: impl AsRef<Path>, at_time: f64) -> PitchQuery {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let path = path.as_ref().to_path_buf();
        let decoder = Arc::clone(&self.decoder);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("pitch-query".into())
            .spawn(move || {
                let pitch = single_shot(decoder.as_ref(), &path, at_time, &config);
                let _ = tx.send(pitch);
            });
        if let Err(e) = spawned {
            warn!("[DETECTOR] Could not spawn file query: {}", e);
        }
        PitchQuery { rx }
    }
}

impl Drop for RealtimeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RealtimeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeDetector")
            .field("config", &self.config)
            .field("detecting", &self.is_detecting())
            .finish()
    }
}

fn single_shot(decoder: &dyn AudioDecoder, path: &Path, at_time: f64, config: &DetectorConfig) -> DetectedPitch {
    let audio = match decoder.decode(path) {
        Ok(audio) => audio,
        Err(e) => {
            warn!("[DETECTOR] File query on unreadable file: {}", e);
            return DetectedPitch::unvoiced();
        }
    };

    if !(at_time >= 0.0) || at_time > audio.duration() {
        debug!("[DETECTOR] File query at {at_time}s is outside {:.3}s of audio", audio.duration());
        return DetectedPitch::unvoiced();
    }

    let center = (at_time * audio.sample_rate as f64).round() as usize;
    let start = center.saturating_sub(config.frame_size / 2);
    let mut analyzer = SpectralAnalyzer::new(audio.sample_rate, config);
    DetectedPitch::from_option(analyzer.analyze(audio.window(start, config.frame_size)))
}

/// Pending result of [`RealtimeDetector::analyze_pitch_from_file`].
#[derive(Debug)]
pub struct PitchQuery {
    rx: Receiver<DetectedPitch>,
}

impl PitchQuery {
    /// Blocks until the analysis completes.
    pub fn wait(self) -> DetectedPitch {
        self.rx.recv().unwrap_or_else(|_| DetectedPitch::unvoiced())
    }

    /// Blocks for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DetectedPitch> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The result if it is already available.
    pub fn try_get(&self) -> Option<DetectedPitch> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ReplaySource;
    use crate::synth::harmonic_tone;
    use crate::tuning::cents_between;
    use std::time::Instant;

    const SR: u32 = 44_100;

    fn replay(freq: f64, seconds: f64) -> ReplaySource {
        let len = (seconds * SR as f64) as usize;
        let audio = AudioFrame::new(harmonic_tone(freq, &[0.5, 0.25, 0.125], len, SR), SR);
        ReplaySource::new(audio, 4096).looping(true).with_pace(Duration::from_millis(2))
    }

    fn wait_for_pitch(detector: &RealtimeDetector) -> DetectedPitch {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(pitch) = detector.detected_pitch() {
                return pitch;
            }
            assert!(Instant::now() < deadline, "no detection published");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn detects_live_tone() {
        let mut detector = RealtimeDetector::new(replay(329.63, 0.5), DetectorConfig::default());
        detector.start().unwrap();
        assert!(detector.is_detecting());

        let pitch = wait_for_pitch(&detector);
        assert!(cents_between(pitch.frequency, 329.63).abs() < 50.0, "{:?}", pitch);
        assert!(pitch.confidence > 0.5);
        assert_eq!(pitch.note_name, "E4");
        assert_eq!(detector.spectrum().len(), 2048);
        detector.stop();
    }

    #[test]
    fn spectrum_buffer_is_reused_once_released() {
        let slot = Arc::new(SnapshotSlot::default());
        let session = Arc::new(AtomicBool::new(true));
        let mut processor =
            FrameProcessor::new(SR, &DetectorConfig::default(), Arc::clone(&slot), Arc::clone(&session));
        let frame = || AudioFrame::new(harmonic_tone(261.63, &[0.5, 0.25], 4096, SR), SR);

        processor.process(frame());
        let first_buffer = slot.get().unwrap().spectrum.as_ptr() as usize;
        processor.process(frame());
        processor.process(frame());
        let third = slot.get().unwrap();
        assert_eq!(third.sequence, 2);
        assert_eq!(third.spectrum.as_ptr() as usize, first_buffer);
        assert_eq!(third.spectrum.len(), 2048);
    }

    #[test]
    fn held_snapshots_are_never_overwritten() {
        let slot = Arc::new(SnapshotSlot::default());
        let session = Arc::new(AtomicBool::new(true));
        let mut processor =
            FrameProcessor::new(SR, &DetectorConfig::default(), Arc::clone(&slot), Arc::clone(&session));

        processor.process(AudioFrame::new(harmonic_tone(440.0, &[0.5], 4096, SR), SR));
        let held = slot.get().unwrap();
        let held_spectrum = held.spectrum.clone();
        for _ in 0..3 {
            processor.process(AudioFrame::new(vec![0.0; 4096], SR));
        }
        assert_eq!(held.sequence, 0);
        assert_eq!(held.spectrum, held_spectrum);
        assert_eq!(slot.get().unwrap().sequence, 3);

        // Frames after the session ends are dropped
        session.store(false, Ordering::Release);
        processor.process(AudioFrame::new(vec![0.0; 4096], SR));
        assert_eq!(slot.get().unwrap().sequence, 3);
    }

    #[test]
    fn start_is_idempotent() {
        let mut detector = RealtimeDetector::new(replay(220.0, 0.2), DetectorConfig::default());
        detector.start().unwrap();
        detector.start().unwrap();
        assert!(detector.is_detecting());
        detector.stop();
        assert!(!detector.is_detecting());
    }

    #[test]
    fn stop_twice_leaves_state_empty() {
        let mut detector = RealtimeDetector::new(replay(440.0, 0.2), DetectorConfig::default());
        detector.stop();
        assert!(detector.detected_pitch().is_none());

        detector.start().unwrap();
        wait_for_pitch(&detector);
        detector.stop();
        assert!(detector.detected_pitch().is_none());
        assert!(detector.spectrum().is_empty());
        detector.stop();
        assert!(detector.detected_pitch().is_none());
        assert!(detector.spectrum().is_empty());
    }

    #[test]
    fn capture_failure_is_reported() {
        let source = ReplaySource::new(AudioFrame::new(Vec::new(), SR), 4096);
        let mut detector = RealtimeDetector::new(source, DetectorConfig::default());
        let err = detector.start().unwrap_err();
        assert!(err.is_configuration_error());
        assert!(!detector.is_detecting());
    }

    #[test]
    fn sequence_numbers_never_go_backwards() {
        let mut detector = RealtimeDetector::new(replay(261.63, 0.3), DetectorConfig::default());
        let observer = detector.observer();
        detector.start().unwrap();

        let mut last = None;
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            if let Some(snapshot) = observer.snapshot() {
                if let Some(prev) = last {
                    assert!(snapshot.sequence >= prev);
                }
                last = Some(snapshot.sequence);
            }
            thread::sleep(Duration::from_millis(1));
        }
        detector.stop();
        assert!(last.is_some());
        assert!(observer.snapshot().is_none());
    }

    #[test]
    fn file_query_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a4.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SR,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in harmonic_tone(440.0, &[0.5, 0.25], SR as usize, SR) {
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut detector = RealtimeDetector::new(replay(220.0, 0.1), DetectorConfig::default());

        let pitch = detector.analyze_pitch_from_file(&path, 0.5).wait();
        assert!(cents_between(pitch.frequency, 440.0).abs() < 50.0);
        assert_eq!(pitch.note_name, "A4");

        assert!(!detector.analyze_pitch_from_file(&path, 3.0).wait().is_voiced());
        assert!(!detector.analyze_pitch_from_file(&path, -1.0).wait().is_voiced());
        let missing = dir.path().join("missing.wav");
        assert_eq!(detector.analyze_pitch_from_file(&missing, 0.1).wait(), DetectedPitch::unvoiced());

        // A query issued before stop still completes afterwards
        detector.start().unwrap();
        let query = detector.analyze_pitch_from_file(&path, 0.25);
        detector.stop();
        drop(detector);
        assert!(query.wait().is_voiced());
    }
}
