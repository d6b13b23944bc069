//! # Intonation - singing practice from the command line
//!
//! Thin front end over `intonation-core`:
//! - `analyze`: pitch overlay and spectrogram for a recorded take
//! - `probe`: the pitch at one instant of a file
//! - `listen`: live detection from the default input device
//! - `evaluate`: score a scale exercise, live or against a recording

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use intonation_core::{
    AccuracyEvaluator, AudioDecoder, CaptureSource, ClockedScale, CpalCapture, EngineConfig, FileAnalysis,
    FileAnalyzer, MidiNote, RealtimeDetector, ReplaySource, ScalePlayer, ScaleSchedule, WavDecoder,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often live output is refreshed.
const DISPLAY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "intonation", version, about = "Pitch detection and intonation scoring for singing practice")]
struct Cli {
    /// Engine settings as JSON (defaults are used for missing fields)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a whole WAV recording
    Analyze {
        input: PathBuf,

        /// Print the full analysis as JSON
        #[arg(long)]
        json: bool,

        /// Exercise sung in the recording, e.g. C4,D4,E4
        #[arg(long, value_delimiter = ',')]
        notes: Vec<MidiNote>,

        /// Exercise tempo in BPM
        #[arg(long, default_value_t = 60.0)]
        tempo: f64,
    },
    /// Detect the pitch at one instant of a WAV recording
    Probe {
        input: PathBuf,

        /// Time in seconds
        #[arg(long)]
        at: f64,
    },
    /// Show live detections from the default input device
    Listen {
        /// How long to listen, in seconds
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },
    /// Score a scale exercise
    Evaluate {
        /// Notes of the exercise, e.g. C4,D4,E4
        #[arg(long, value_delimiter = ',', required = true)]
        notes: Vec<MidiNote>,

        /// Tempo in BPM, one note per beat
        #[arg(long, default_value_t = 60.0)]
        tempo: f64,

        /// Sing along with a recording instead of the microphone
        #[arg(long)]
        replay: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            input,
            json,
            notes,
            tempo,
        } => analyze(&config, &input, json, &notes, tempo),
        Commands::Probe { input, at } => probe(&config, &input, at),
        Commands::Listen { seconds } => listen(&config, seconds),
        Commands::Evaluate { notes, tempo, replay } => evaluate(&config, &notes, tempo, replay.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            EngineConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn analyze(config: &EngineConfig, input: &Path, json: bool, notes: &[MidiNote], tempo: f64) -> Result<()> {
    let mut analyzer = FileAnalyzer::new(Arc::new(WavDecoder), config.detector.clone(), config.analysis.clone());
    if !notes.is_empty() {
        analyzer = analyzer.with_targets(ScaleSchedule::new(notes, tempo)?);
    }

    let job = analyzer.spawn(input);
    for progress in job.progress().iter() {
        eprint!("\rAnalyzing {}: {:>3.0}%", input.display(), progress * 100.0);
        let _ = std::io::stderr().flush();
    }
    eprintln!();

    let analysis = job
        .join()
        .with_context(|| format!("Failed to analyze {}", input.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print_overlay(&analysis);
    }
    Ok(())
}

fn print_overlay(analysis: &FileAnalysis) {
    let pitch = &analysis.pitch;
    println!(
        "{:.2}s at {} Hz, {} pitch points, {} spectrogram rows",
        analysis.duration,
        analysis.sample_rate,
        pitch.data_point_count(),
        analysis.spectrogram.time_stamps().len()
    );
    println!("{:>8}  {:>9}  {:>6}  {:>5}  {:>6}", "time", "freq", "note", "conf", "target");

    for i in 0..pitch.data_point_count() {
        let frequency = pitch.frequencies()[i];
        let confidence = pitch.confidences()[i];
        let note = intonation_core::tuning::classify(frequency)
            .ok()
            .filter(|_| confidence > 0.0)
            .map(|c| c.name)
            .unwrap_or_else(|| "-".into());
        let target = pitch.target_notes()[i].map(|n| n.name()).unwrap_or_else(|| "-".into());
        println!(
            "{:>7.2}s  {:>7.2}Hz  {:>6}  {:>5.2}  {:>6}",
            pitch.time_stamps()[i],
            frequency,
            note,
            confidence,
            target
        );
    }
}

fn probe(config: &EngineConfig, input: &Path, at: f64) -> Result<()> {
    // The capture device is never opened for a file query
    let capture = CpalCapture::new(config.detector.frame_size);
    let detector = RealtimeDetector::new(capture, config.detector.clone());
    let pitch = detector.analyze_pitch_from_file(input, at).wait();
    println!("{}", serde_json::to_string_pretty(&pitch)?);
    Ok(())
}

fn listen(config: &EngineConfig, seconds: f64) -> Result<()> {
    if !(seconds > 0.0) {
        bail!("--seconds must be positive, got {seconds}");
    }

    let capture = CpalCapture::new(config.detector.frame_size);
    let mut detector = RealtimeDetector::new(capture, config.detector.clone());
    detector.start().context("Failed to start audio capture")?;
    info!("Listening for {seconds} seconds");

    let observer = detector.observer();
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let ticker = crossbeam_channel::tick(DISPLAY_INTERVAL);
    let mut last_sequence = None;

    while Instant::now() < deadline {
        let _ = ticker.recv();
        let Some(snapshot) = observer.snapshot() else {
            continue;
        };
        if last_sequence == Some(snapshot.sequence) {
            continue;
        }
        last_sequence = Some(snapshot.sequence);

        let pitch = &snapshot.pitch;
        if pitch.is_voiced() {
            println!("{:>8.2} Hz  {:>4}  confidence {:.2}", pitch.frequency, pitch.note_name, pitch.confidence);
        }
    }

    detector.stop();
    Ok(())
}

fn evaluate(config: &EngineConfig, notes: &[MidiNote], tempo: f64, replay: Option<&Path>) -> Result<()> {
    let schedule = ScaleSchedule::new(notes, tempo)?;
    let frame_size = config.detector.frame_size;

    let detector = match replay {
        Some(path) => {
            let audio = WavDecoder
                .decode(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            detector_with(ReplaySource::new(audio, frame_size), config)
        }
        None => detector_with(CpalCapture::new(frame_size), config),
    };

    let player = Arc::new(ClockedScale::new());
    let mut evaluator = AccuracyEvaluator::new(detector, player.clone(), config.evaluator.clone());
    evaluator.start_evaluation(notes, tempo)?;

    // Follow the exercise so the singer knows what to sing
    let ticker = crossbeam_channel::tick(DISPLAY_INTERVAL);
    let deadline = Instant::now() + Duration::from_secs_f64(schedule.duration());
    let mut shown = None;
    while Instant::now() < deadline {
        let _ = ticker.recv();
        let current = player.current_position();
        if current != shown {
            if let Some((_, note)) = current {
                println!("Sing {note} ({:.2} Hz)", note.frequency());
            }
            shown = current;
        }
    }

    match evaluator.stop_evaluation() {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => bail!("No voiced singing was detected during the exercise"),
    }
    Ok(())
}

fn detector_with(source: impl CaptureSource + 'static, config: &EngineConfig) -> RealtimeDetector {
    RealtimeDetector::new(source, config.detector.clone())
}
