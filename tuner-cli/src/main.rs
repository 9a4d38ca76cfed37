// tuner-cli/src/main.rs

//! Terminal front end for the tuner core.
//!
//! Starts the pipeline, prints every stable reading with a cent meter and
//! restarts capture with exponential backoff when the stream fails.

mod cent_meter;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tuner_core::tuning;
use tuner_core::{
    Diagnostics, Estimator, InputSource, StableReading, StringTarget, TrackerEvent, Tuner,
    TunerConfig, list_input_devices,
};

use cent_meter::Zone;

/// How long the main loop waits for an event before checking the stream.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(8);
const MAX_START_ATTEMPTS: u32 = 6;

#[derive(Parser, Debug)]
#[command(name = "tuner", version, about = "Real-time instrument tuner")]
struct Cli {
    /// JSON configuration file; command-line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Input device (substring of its name)
    #[arg(short, long)]
    device: Option<String>,

    /// Analyze a synthetic tone instead of a device, given as a note (A4, C#3) or in Hz
    #[arg(long, value_name = "NOTE|HZ", conflicts_with = "device")]
    tone: Option<String>,

    /// Requested sample rate (44100 or 48000)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Analysis window in samples (power of two)
    #[arg(long)]
    window: Option<usize>,

    /// Samples between consecutive windows
    #[arg(long)]
    hop: Option<usize>,

    /// Frequency of A4 in Hz
    #[arg(long, value_name = "HZ")]
    reference: Option<f32>,

    #[arg(long, value_enum)]
    estimator: Option<EstimatorArg>,

    /// Open strings to tune against, low to high (e.g. D2,A2,D3,G3,B3,E4); "none" disables
    #[arg(long, value_delimiter = ',', value_name = "NOTES")]
    strings: Option<Vec<String>>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EstimatorArg {
    Autocorrelation,
    Yin,
}

impl From<EstimatorArg> for Estimator {
    fn from(arg: EstimatorArg) -> Self {
        match arg {
            EstimatorArg::Autocorrelation => Estimator::Autocorrelation,
            EstimatorArg::Yin => Estimator::Yin,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list_devices {
        let devices = list_input_devices().context("Failed to list input devices")?;
        if devices.is_empty() {
            println!("No input devices found");
        }
        for name in devices {
            println!("{name}");
        }
        return Ok(());
    }

    let config = build_config(&cli)?;

    if let Some(path) = &cli.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        println!("Configuration saved to {}", path.display());
        return Ok(());
    }

    run(config, cli.duration.map(Duration::from_secs_f64))
}

/// Loads the config file (or defaults) and applies command-line overrides.
fn build_config(cli: &Cli) -> Result<TunerConfig> {
    let mut config = match &cli.config {
        Some(path) => TunerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TunerConfig::default(),
    };

    if let Some(rate) = cli.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(window) = cli.window {
        config.window_size = window;
    }
    if let Some(hop) = cli.hop {
        config.hop_size = hop;
    }
    if let Some(reference) = cli.reference {
        config.reference_pitch_hz = reference;
    }
    if let Some(estimator) = cli.estimator {
        config.estimator = estimator.into();
    }
    if let Some(strings) = &cli.strings {
        config.strings = match strings.as_slice() {
            [only] if only.eq_ignore_ascii_case("none") => Vec::new(),
            _ => strings.clone(),
        };
    }
    if let Some(name) = &cli.device {
        config.input = InputSource::Device {
            name: Some(name.clone()),
        };
    }
    if let Some(tone) = &cli.tone {
        config.input = InputSource::Tone {
            frequency_hz: parse_tone(tone, config.reference_pitch_hz)?,
            amplitude: 0.5,
        };
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Accepts either a frequency in Hz or a note name with octave.
fn parse_tone(tone: &str, reference_pitch_hz: f32) -> Result<f32> {
    if let Ok(hz) = tone.trim().parse::<f32>() {
        return Ok(hz);
    }
    let midi = tuning::parse_note(tone)
        .ok_or_else(|| anyhow!("'{tone}' is neither a frequency nor a note name"))?;
    Ok(tuning::note_frequency(midi, reference_pitch_hz))
}

fn run(config: TunerConfig, duration: Option<Duration>) -> Result<()> {
    let deadline = duration.map(|d| Instant::now() + d);
    let mut tuner = start_with_backoff(&config)?;
    if let Some(info) = tuner.capture_info() {
        println!(
            "Listening on {} at {} Hz (A4 = {} Hz)",
            info.device_name,
            info.sample_rate,
            config.reference_pitch_hz
        );
    }
    let mut events = tuner.events();

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if !pump_events(&events) {
            log::warn!("Analysis stopped");
            break;
        }

        if let Err(e) = tuner.check_stream() {
            log::warn!("{e}; restarting");
            print_diagnostics(&tuner.diagnostics());
            tuner.stop();
            tuner = start_with_backoff(&config)?;
            events = tuner.events();
        }
    }

    tuner.stop();
    print_diagnostics(&tuner.diagnostics());
    Ok(())
}

/// Prints whatever arrives within one poll interval. Returns `false` once the
/// channel is disconnected.
fn pump_events(events: &Receiver<TrackerEvent>) -> bool {
    match events.recv_timeout(POLL_INTERVAL) {
        Ok(event) => {
            print_event(&event);
            for event in events.try_iter() {
                print_event(&event);
            }
            true
        }
        Err(RecvTimeoutError::Timeout) => true,
        Err(RecvTimeoutError::Disconnected) => false,
    }
}

fn start_with_backoff(config: &TunerConfig) -> Result<Tuner> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match Tuner::start(config.clone()) {
            Ok(tuner) => return Ok(tuner),
            Err(e) if e.is_transient() && attempt < MAX_START_ATTEMPTS => {
                log::warn!("Start attempt {attempt} failed: {e}; retrying in {backoff:?}");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e).context("Failed to start the tuner"),
        }
    }
}

fn print_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::Reading(reading) => print_reading(reading),
        TrackerEvent::Silence { .. } => println!("  --  silence"),
    }
}

fn print_reading(reading: &StableReading) {
    let note = format!("{}{}", reading.note, reading.octave);
    println!(
        "{:<4} {:>+6.1} cents {:>9.2} Hz  {}  {:<5} ({:.0}%, {:.0} dB){}",
        note,
        reading.cents,
        reading.frequency_hz,
        cent_meter::render(reading.cents),
        Zone::from_cents(reading.cents).label(),
        reading.confidence * 100.0,
        reading.amplitude_db,
        reading
            .target
            .map(|target| format!("  {}", describe_target(&target)))
            .unwrap_or_default()
    );
}

/// "string 5 A2 +3.2", numbering strings from the highest down as guitarists do.
fn describe_target(target: &StringTarget) -> String {
    format!(
        "string {} {}{} {:+.1}",
        target.number,
        target.note,
        target.octave,
        target.cents
    )
}

fn print_diagnostics(diagnostics: &Diagnostics) {
    println!(
        "{} frames analyzed at {} Hz; {} overruns ({} samples dropped), {} underruns, {} events dropped{}",
        diagnostics.frames_analyzed,
        diagnostics.sample_rate,
        diagnostics.overruns,
        diagnostics.dropped_samples,
        diagnostics.underruns,
        diagnostics.dropped_events,
        if diagnostics.stream_failed {
            "; stream failed"
        } else {
            ""
        }
    );
}
