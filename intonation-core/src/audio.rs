//! # Audio Capture Module
//!
//! Sources of live audio for the realtime detector. A [`CaptureSource`]
//! delivers fixed-size mono [`AudioFrame`]s to a sink closure on its own
//! thread until it is closed.
//!
//! ## Sources
//! - [`CpalCapture`]: the default input device via CPAL (Cross-Platform Audio Library)
//! - [`ReplaySource`]: replays decoded audio as if it were arriving live

use crate::error::{PitchError, Result};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Preferred capture rate.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// A block of mono samples. Moved, never shared, from producer to consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn rms(&self) -> f64 {
        crate::pitch::rms(&self.samples)
    }

    /// Up to `len` samples starting at `start`; shorter near the end.
    pub fn window(&self, start: usize, len: usize) -> &[f32] {
        let start = start.min(self.samples.len());
        let end = start.saturating_add(len).min(self.samples.len());
        &self.samples[start..end]
    }
}

/// Receives every captured frame, on the capture thread.
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Builds the sink once the capture rate is known, before the first frame.
pub type SinkFactory = Box<dyn FnOnce(u32) -> FrameSink + Send + 'static>;

/// A live audio source.
pub trait CaptureSource: Send {
    /// Negotiates a sample rate, builds the sink with `make_sink` and starts
    /// delivering frames to it. Returns the sample rate.
    fn open(&mut self, make_sink: SinkFactory) -> Result<u32>;

    /// Stops delivery. Once this returns the sink has been dropped.
    /// Closing a source that is not open does nothing.
    fn close(&mut self);
}

/// Worker thread management shared by the sources.
#[derive(Debug)]
struct CaptureWorker {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("[CAPTURE] Capture thread panicked");
            }
        }
    }
}

/// Captures the default input device.
///
/// CPAL streams are not `Send` on every backend, so the stream is built and
/// owned by a dedicated thread that lives until [`close`](CaptureSource::close).
#[derive(Debug)]
pub struct CpalCapture {
    frame_size: usize,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size, worker: None }
    }
}

impl CaptureSource for CpalCapture {
    fn open(&mut self, make_sink: SinkFactory) -> Result<u32> {
        self.close();

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let frame_size = self.frame_size;

        let thread_handle = thread::Builder::new()
            .name("cpal-capture".into())
            .spawn(move || match start_audio_capture(make_sink, frame_size) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    // Either a shutdown message or a dropped sender ends the stream.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("[CAPTURE] Input stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let worker = CaptureWorker {
            shutdown_tx,
            thread_handle: Some(thread_handle),
        };
        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => {
                self.worker = Some(worker);
                Ok(sample_rate)
            }
            Ok(Err(e)) => {
                worker.shutdown();
                Err(e)
            }
            Err(_) => {
                worker.shutdown();
                Err(PitchError::CaptureUnavailable("capture thread exited during setup".into()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_error(e: impl std::fmt::Display) -> PitchError {
    PitchError::CaptureUnavailable(e.to_string())
}

/// Starts audio capture from the default input device.
///
/// This function:
/// 1. Selects the default audio input device
/// 2. Picks an f32 configuration, preferring mono at 44.1 kHz
/// 3. Builds the sink for the chosen rate, outside the audio callback
/// 4. Sets up a callback that downmixes to mono and hands out `frame_size` frames
fn start_audio_capture(make_sink: SinkFactory, frame_size: usize) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| PitchError::CaptureUnavailable("No input device available".into()))?;

    info!("[CAPTURE] Using audio input device: {}", device.name().map_err(capture_error)?);

    let configs = device
        .supported_input_configs()
        .map_err(capture_error)?
        .collect::<Vec<_>>();
    let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
        .ok_or_else(|| PitchError::CaptureUnavailable("No suitable f32 input format found".into()))?;

    let rate = TARGET_SAMPLE_RATE.clamp(
        supported_config.min_sample_rate().0,
        supported_config.max_sample_rate().0,
    );
    let config = supported_config.with_sample_rate(cpal::SampleRate(rate));
    let sample_rate = config.sample_rate().0;
    let channels = config.channels().max(1) as usize;
    let config: cpal::StreamConfig = config.into();

    info!("[CAPTURE] Selected sample rate: {} Hz, {} channel(s)", sample_rate, channels);

    let err_fn = |err: cpal::StreamError| warn!("[CAPTURE] An error occurred on the audio stream: {}", err);

    let mut sink = make_sink(sample_rate);

    // This buffer accumulates mono audio from the callback.
    let mut audio_buffer: Vec<f32> = Vec::with_capacity(frame_size * 2);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                audio_buffer.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );

                // While we have enough data for a full frame, hand it over.
                while audio_buffer.len() >= frame_size {
                    let samples = audio_buffer[..frame_size].to_vec();
                    audio_buffer.drain(..frame_size);
                    sink(AudioFrame::new(samples, sample_rate));
                }
            },
            err_fn,
            None,
        )
        .map_err(capture_error)?;

    stream.play().map_err(capture_error)?;

    Ok((stream, sample_rate))
}

/// Finds the best supported f32 input configuration.
///
/// Mono is preferred over multichannel, then the range closest to the
/// target sample rate.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let in_range = c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0;
            let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
            let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
            let rate_cost = if in_range { 0 } else { min_diff.min(max_diff) };
            (c.channels() != 1, rate_cost)
        })
}

/// Replays recorded audio through the capture interface.
///
/// Frames are delivered from a worker thread, one every `pace` (real time
/// by default), optionally looping. Useful for practicing against a
/// recording and for exercising the realtime path without a microphone.
#[derive(Debug)]
pub struct ReplaySource {
    audio: Arc<AudioFrame>,
    frame_size: usize,
    pace: Option<Duration>,
    looping: bool,
    stop: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(audio: AudioFrame, frame_size: usize) -> Self {
        Self {
            audio: Arc::new(audio),
            frame_size: frame_size.max(1),
            pace: None,
            looping: false,
            stop: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Delivers one frame every `pace` instead of in real time.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Starts over from the beginning after the last frame.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    fn frame_interval(&self) -> Duration {
        self.pace.unwrap_or_else(|| {
            Duration::from_secs_f64(self.frame_size as f64 / self.audio.sample_rate.max(1) as f64)
        })
    }
}

impl CaptureSource for ReplaySource {
    fn open(&mut self, make_sink: SinkFactory) -> Result<u32> {
        self.close();
        if self.audio.is_empty() || self.audio.sample_rate == 0 {
            return Err(PitchError::CaptureUnavailable("replay source has no audio".into()));
        }
        let mut sink = make_sink(self.audio.sample_rate);

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        let audio = Arc::clone(&self.audio);
        let frame_size = self.frame_size;
        let interval = self.frame_interval();
        let looping = self.looping;

        let handle = thread::Builder::new().name("replay-capture".into()).spawn(move || {
            loop {
                for chunk in audio.samples.chunks(frame_size) {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    sink(AudioFrame::new(chunk.to_vec(), audio.sample_rate));
                    thread::sleep(interval);
                }
                if !looping {
                    debug!("[CAPTURE] Replay finished");
                    return;
                }
            }
        })?;

        self.thread_handle = Some(handle);
        Ok(self.audio.sample_rate)
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("[CAPTURE] Replay thread panicked");
            }
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.close();
    }
}
