//! # Accuracy Evaluation Module
//!
//! Scores a scale-practice session by sampling the expected note and the
//! detected pitch side by side.
//!
//! ## Architecture
//! - **Caller thread**: `start_evaluation` / `stop_evaluation`
//! - **Sampling thread**: ticks every `sample_interval`, reads the player's
//!   current note and the detector's latest snapshot, appends samples
//! - **Communication**: a shutdown channel in, the finished
//!   [`EvaluationSession`] back out through the thread's join handle
//!
//! ## Metrics
//! - **GPE**: fraction of samples off by more than `gross_error_cents`
//! - **FPE**: mean absolute cents error over the remaining samples
//! - **Octave error rate**: fraction of samples within `octave_tolerance_cents`
//!   of exactly one octave away, counted independently of GPE

use crate::config::EvaluatorConfig;
use crate::error::{PitchError, Result};
use crate::realtime::{PitchObserver, RealtimeDetector};
use crate::scale::{ScalePlayer, ScaleSchedule};
use crate::tuning::{MidiNote, cents_between};
use crate::DetectedPitch;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Aggregate accuracy of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Gross pitch error rate, 0..1.
    pub gpe: f64,
    /// Fine pitch error in cents, >= 0.
    pub fpe: f64,
    /// Octave error rate, 0..1.
    pub octave_error_rate: f64,
    /// Distinct expected-note segments observed.
    pub total_notes: usize,
    pub average_confidence: f64,
    /// Number of samples the metrics were computed from.
    pub sample_count: usize,
}

/// One paired observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchSample {
    pub expected_frequency: f64,
    pub detected_frequency: f64,
    pub confidence: f64,
}

impl PitchSample {
    pub fn error_cents(&self) -> f64 {
        cents_between(self.detected_frequency, self.expected_frequency)
    }
}

/// Accumulates samples for one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationSession {
    config: EvaluatorConfig,
    samples: Vec<PitchSample>,
    segments: usize,
    last_index: Option<usize>,
}

impl EvaluationSession {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            samples: Vec::new(),
            segments: 0,
            last_index: None,
        }
    }

    pub fn samples(&self) -> &[PitchSample] {
        &self.samples
    }

    /// Records one tick: the exercise position that should be sounding and
    /// what was heard.
    ///
    /// A change of position starts a new segment, so repeated notes count
    /// once each; a gap with no expected note ends the current one. Only
    /// voiced detections with an expected note become samples.
    pub fn observe(&mut self, expected: Option<(usize, MidiNote)>, detected: Option<&DetectedPitch>) {
        let index = expected.map(|(index, _)| index);
        if index.is_some() && index != self.last_index {
            self.segments += 1;
        }
        self.last_index = index;

        if let (Some((_, note)), Some(pitch)) = (expected, detected) {
            if pitch.is_voiced() {
                self.record(note.frequency(), pitch.frequency, pitch.confidence);
            }
        }
    }

    /// Appends a raw `(expected, detected, confidence)` sample.
    pub fn record(&mut self, expected_frequency: f64, detected_frequency: f64, confidence: f64) {
        if expected_frequency > 0.0 && detected_frequency > 0.0 && confidence > 0.0 {
            self.samples.push(PitchSample {
                expected_frequency,
                detected_frequency,
                confidence: confidence.min(1.0),
            });
        }
    }

    /// Reduces the samples to metrics; `None` if nothing was sampled.
    pub fn finalize(&self) -> Option<EvaluationResult> {
        if self.samples.is_empty() {
            return None;
        }

        let count = self.samples.len() as f64;
        let mut gross = 0usize;
        let mut octave = 0usize;
        let mut fine_sum = 0.0;
        let mut fine_count = 0usize;

        for sample in &self.samples {
            let error = sample.error_cents().abs();
            if error > self.config.gross_error_cents {
                gross += 1;
            } else {
                fine_sum += error;
                fine_count += 1;
            }
            if (error - 1200.0).abs() <= self.config.octave_tolerance_cents {
                octave += 1;
            }
        }

        Some(EvaluationResult {
            gpe: gross as f64 / count,
            fpe: if fine_count > 0 { fine_sum / fine_count as f64 } else { 0.0 },
            octave_error_rate: octave as f64 / count,
            total_notes: self.segments,
            average_confidence: self.samples.iter().map(|s| s.confidence).sum::<f64>() / count,
            sample_count: self.samples.len(),
        })
    }
}

/// A running evaluation's sampling thread.
#[derive(Debug)]
struct SamplingTask {
    shutdown_tx: Sender<()>,
    thread_handle: JoinHandle<EvaluationSession>,
}

/// Drives a scale exercise against live detection, `Idle -> Evaluating -> Idle`.
pub struct AccuracyEvaluator {
    detector: RealtimeDetector,
    player: Arc<dyn ScalePlayer>,
    config: EvaluatorConfig,
    task: Option<SamplingTask>,
    last_result: Option<EvaluationResult>,
}

impl AccuracyEvaluator {
    pub fn new(detector: RealtimeDetector, player: Arc<dyn ScalePlayer>, config: EvaluatorConfig) -> Self {
        Self {
            detector,
            player,
            config,
            task: None,
            last_result: None,
        }
    }

    pub fn is_evaluating(&self) -> bool {
        self.task.is_some()
    }

    pub fn detector(&self) -> &RealtimeDetector {
        &self.detector
    }

    /// The result of the most recently stopped session that collected samples.
    pub fn last_result(&self) -> Option<&EvaluationResult> {
        self.last_result.as_ref()
    }

    /// Starts playback, detection and sampling.
    ///
    /// # Errors
    /// - `AlreadyEvaluating` if a session is running
    /// - `EmptyScale` / `InvalidTempo` for an unusable exercise
    /// - whatever the player or the capture source report on start
    pub fn start_evaluation(&mut self, notes: &[MidiNote], tempo: f64) -> Result<()> {
        if self.is_evaluating() {
            return Err(PitchError::AlreadyEvaluating);
        }
        ScaleSchedule::new(notes, tempo)?;

        self.player.start(notes, tempo)?;
        if let Err(e) = self.detector.start() {
            self.player.stop();
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let player = Arc::clone(&self.player);
        let observer = self.detector.observer();
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("evaluation-sampler".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(config.sample_interval);
                let mut session = EvaluationSession::new(config);
                loop {
                    crossbeam_channel::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if !player.is_playing() {
                                debug!("[EVALUATOR] Playback finished, sampling ends");
                                break;
                            }
                            sample_once(&mut session, player.as_ref(), &observer);
                        }
                    }
                }
                session
            });

        match spawned {
            Ok(thread_handle) => {
                info!("[EVALUATOR] Evaluating {} notes at {} BPM", notes.len(), tempo);
                self.task = Some(SamplingTask {
                    shutdown_tx,
                    thread_handle,
                });
                Ok(())
            }
            Err(e) => {
                self.player.stop();
                self.detector.stop();
                Err(e.into())
            }
        }
    }

    /// Ends the session and computes its result.
    ///
    /// Returns `None` when idle or when no voiced sample was collected.
    pub fn stop_evaluation(&mut self) -> Option<EvaluationResult> {
        let task = self.task.take()?;

        let _ = task.shutdown_tx.send(());
        let session = task.thread_handle.join();
        self.player.stop();
        self.detector.stop();

        let session = match session {
            Ok(session) => session,
            Err(_) => {
                warn!("[EVALUATOR] Sampling thread panicked, discarding session");
                return None;
            }
        };

        let result = session.finalize();
        match &result {
            Some(r) => info!(
                "[EVALUATOR] Session finished: {} samples, GPE {:.3}, FPE {:.1} cents, octave errors {:.3}",
                r.sample_count, r.gpe, r.fpe, r.octave_error_rate
            ),
            None => info!("[EVALUATOR] Session finished without voiced samples"),
        }
        if result.is_some() {
            self.last_result = result.clone();
        }
        result
    }
}

fn sample_once(session: &mut EvaluationSession, player: &dyn ScalePlayer, observer: &PitchObserver) {
    let expected = player.current_position();
    let detected = observer.detected_pitch();
    session.observe(expected, detected.as_ref());
}

impl Drop for AccuracyEvaluator {
    fn drop(&mut self) {
        if self.is_evaluating() {
            self.stop_evaluation();
        }
    }
}

impl std::fmt::Debug for AccuracyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccuracyEvaluator")
            .field("detector", &self.detector)
            .field("evaluating", &self.is_evaluating())
            .field("last_result", &self.last_result)
            .finish()
    }
}
