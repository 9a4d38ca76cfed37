//! # Audio Capture Module
//!
//! Real-time audio capture using CPAL (Cross-Platform Audio Library).
//! Captured samples are downmixed to mono, converted to `f32` and pushed
//! straight into the sample ring; nothing else happens on the audio thread.
//!
//! ## Features
//! - Input device selection by name, or the default device
//! - Format negotiation with a fallback between 44.1 kHz and 48 kHz
//! - `f32`, `i16`, `i32` and `u16` device formats, any channel count
//! - Synthetic tone input delivered at real-time pace
//!
//! `cpal::Stream` is not `Send`, so each stream is built, played and dropped
//! on a dedicated capture thread that lives as long as the [`AudioCapture`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, PlayStreamError, Sample, SampleFormat, SampleRate,
    SizedSample, Stream, StreamConfig, SupportedStreamConfigRange,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{InputSource, SUPPORTED_SAMPLE_RATES, TunerConfig};
use crate::error::{Result, TunerError};
use crate::ring::RingProducer;

/// Samples per block written by the synthetic tone source.
const TONE_BLOCK_SIZE: usize = 512;

/// What the capture side actually runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureInfo {
    pub device_name: String,
    /// Negotiated rate; may differ from the requested one.
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// A running capture source feeding a sample ring.
///
/// Stopping (or dropping) the capture releases the device.
pub struct AudioCapture {
    info: CaptureInfo,
    stop_tx: Sender<()>,
    stream_failed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Opens the configured input and starts delivering samples to `producer`.
    ///
    /// Returns once the stream is playing. The window is re-validated against
    /// the negotiated rate before any stream is built.
    pub fn start(config: &TunerConfig, producer: RingProducer) -> Result<Self> {
        match &config.input {
            InputSource::Device { name } => start_device(config, name.as_deref(), producer),
            InputSource::Tone {
                frequency_hz,
                amplitude,
            } => start_tone(config, *frequency_hz, *amplitude, producer),
        }
    }

    pub fn info(&self) -> &CaptureInfo {
        &self.info
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Set by the stream's error callback when the device reports a failure.
    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        self.stream_failed.clone()
    }

    pub fn stream_failed(&self) -> bool {
        self.stream_failed.load(Ordering::Acquire)
    }

    /// Sender that ends delivery when signalled, from any thread. The
    /// capture thread drops its stream (or stops the tone) on the first signal.
    pub fn stop_sender(&self) -> Sender<()> {
        self.stop_tx.clone()
    }

    /// Whether the capture thread is still delivering samples.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops the stream and waits for the capture thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
            log::info!("Capture from '{}' stopped", self.info.device_name);
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Names of all available input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| TunerError::Device(format!("cannot enumerate input devices: {e}")))?;
    Ok(devices
        .map(|device| device.name().unwrap_or_else(|_| "Unknown".to_string()))
        .collect())
}

fn start_device(
    config: &TunerConfig,
    name: Option<&str>,
    producer: RingProducer,
) -> Result<AudioCapture> {
    let host = cpal::default_host();
    let device = select_device(&host, name)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio input device: {}", device_name);

    let supported: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| TunerError::Device(format!("{device_name}: {e}")))?
        .collect();
    let negotiated = negotiate(&supported, config.sample_rate).ok_or_else(|| {
        TunerError::UnsupportedFormat(format!(
            "{device_name} supports none of {:?} Hz in a usable sample format",
            SUPPORTED_SAMPLE_RATES
        ))
    })?;
    if negotiated.sample_rate != config.sample_rate {
        log::warn!(
            "{} Hz is not supported by {}, falling back to {} Hz",
            config.sample_rate,
            device_name,
            negotiated.sample_rate
        );
    }
    config.validate_for_rate(negotiated.sample_rate)?;

    let stream_config = StreamConfig {
        channels: negotiated.channels,
        sample_rate: SampleRate(negotiated.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    log::debug!(
        "Stream config: {} Hz, {} channels, {:?}",
        negotiated.sample_rate,
        negotiated.channels,
        negotiated.sample_format
    );

    let stream_failed = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let sample_format = negotiated.sample_format;
    let failed = stream_failed.clone();

    let thread = thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            run_capture_thread(
                device,
                stream_config,
                sample_format,
                producer,
                failed,
                ready_tx,
                stop_rx,
            );
        })
        .map_err(|e| TunerError::Stream(format!("failed to spawn capture thread: {e}")))?;

    let ready = ready_rx
        .recv()
        .unwrap_or_else(|_| Err(TunerError::Stream("capture thread exited".to_string())));
    if let Err(e) = ready {
        let _ = thread.join();
        return Err(e);
    }

    log::info!(
        "Capturing at {} Hz ({} channels, {:?})",
        negotiated.sample_rate,
        negotiated.channels,
        negotiated.sample_format
    );
    Ok(AudioCapture {
        info: CaptureInfo {
            device_name,
            sample_rate: negotiated.sample_rate,
            channels: negotiated.channels,
            sample_format,
        },
        stop_tx,
        stream_failed,
        thread: Some(thread),
    })
}

fn start_tone(
    config: &TunerConfig,
    frequency_hz: f32,
    amplitude: f32,
    producer: RingProducer,
) -> Result<AudioCapture> {
    config.validate_for_rate(config.sample_rate)?;
    let sample_rate = config.sample_rate;
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let thread = thread::Builder::new()
        .name("tone-source".to_string())
        .spawn(move || run_tone_thread(frequency_hz, amplitude, sample_rate, producer, stop_rx))
        .map_err(|e| TunerError::Stream(format!("failed to spawn tone thread: {e}")))?;

    log::info!("Using synthetic {frequency_hz:.2} Hz tone at {sample_rate} Hz");
    Ok(AudioCapture {
        info: CaptureInfo {
            device_name: format!("tone {frequency_hz:.2} Hz"),
            sample_rate,
            channels: 1,
            sample_format: SampleFormat::F32,
        },
        stop_tx,
        stream_failed: Arc::new(AtomicBool::new(false)),
        thread: Some(thread),
    })
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device> {
    let Some(name) = name else {
        return host
            .default_input_device()
            .ok_or_else(|| TunerError::Device("no default input device".to_string()));
    };

    let mut devices = host
        .input_devices()
        .map_err(|e| TunerError::Device(format!("cannot enumerate input devices: {e}")))?;
    devices
        .find(|device| {
            device
                .name()
                .map(|device_name| device_name.contains(name))
                .unwrap_or(false)
        })
        .ok_or_else(|| TunerError::Device(format!("no input device matching '{name}'")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Negotiated {
    sample_rate: u32,
    channels: u16,
    sample_format: SampleFormat,
}

/// Lower is better; `None` for formats the capture callback does not handle.
fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::F32 => Some(0),
        SampleFormat::I16 => Some(1),
        SampleFormat::I32 => Some(2),
        SampleFormat::U16 => Some(3),
        _ => None,
    }
}

/// Picks a rate, format and channel count from what the device supports.
///
/// The requested rate is tried first, then the other supported rates. For a
/// given rate `f32` beats the integer formats and fewer channels beat more.
fn negotiate(supported: &[SupportedStreamConfigRange], requested: u32) -> Option<Negotiated> {
    let rates = std::iter::once(requested).chain(
        SUPPORTED_SAMPLE_RATES
            .iter()
            .copied()
            .filter(move |&rate| rate != requested),
    );

    rates
        .filter(|rate| SUPPORTED_SAMPLE_RATES.contains(rate))
        .find_map(|rate| {
            supported
                .iter()
                .filter(|range| {
                    range.channels() > 0
                        && range.min_sample_rate().0 <= rate
                        && rate <= range.max_sample_rate().0
                })
                .filter_map(|range| {
                    format_rank(range.sample_format()).map(|rank| (rank, range))
                })
                .min_by_key(|(rank, range)| (*rank, range.channels()))
                .map(|(_, range)| Negotiated {
                    sample_rate: rate,
                    channels: range.channels(),
                    sample_format: range.sample_format(),
                })
        })
}

fn map_build_error(err: BuildStreamError) -> TunerError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            TunerError::Device("device is no longer available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported => {
            TunerError::UnsupportedFormat("stream configuration rejected by device".to_string())
        }
        other => TunerError::Stream(format!("failed to build input stream: {other}")),
    }
}

fn map_play_error(err: PlayStreamError) -> TunerError {
    match err {
        PlayStreamError::DeviceNotAvailable => {
            TunerError::Device("device is no longer available".to_string())
        }
        other => TunerError::Stream(format!("failed to start input stream: {other}")),
    }
}

/// Builds, plays and finally drops the stream on the capture thread.
fn run_capture_thread(
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    producer: RingProducer,
    stream_failed: Arc<AtomicBool>,
    ready_tx: Sender<Result<()>>,
    stop_rx: Receiver<()>,
) {
    let stream = build_input_stream(&device, &config, sample_format, producer, stream_failed)
        .and_then(|stream| stream.play().map(|()| stream).map_err(map_play_error));
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("Failed to start audio stream: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    log::debug!("Audio capture thread started");
    let _ = stop_rx.recv();
    log::debug!("Audio capture thread stopping");
    drop(stream);
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    producer: RingProducer,
    stream_failed: Arc<AtomicBool>,
) -> Result<Stream> {
    match sample_format {
        SampleFormat::F32 => build_typed_stream::<f32>(device, config, producer, stream_failed),
        SampleFormat::I16 => build_typed_stream::<i16>(device, config, producer, stream_failed),
        SampleFormat::I32 => build_typed_stream::<i32>(device, config, producer, stream_failed),
        SampleFormat::U16 => build_typed_stream::<u16>(device, config, producer, stream_failed),
        other => Err(TunerError::UnsupportedFormat(format!(
            "sample format {other:?}"
        ))),
    }
}

/// The data callback downmixes each interleaved frame by averaging its
/// channels and writes the block to the ring in one piece.
fn build_typed_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: RingProducer,
    stream_failed: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let scale = 1.0 / channels as f32;

    let err_fn = move |err: cpal::StreamError| {
        log::warn!("Audio stream error: {}", err);
        stream_failed.store(true, Ordering::Release);
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = data.chunks_exact(channels).map(|frame| {
                    frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() * scale
                });
                producer.write_iter(mono);
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

/// Writes sine blocks into the ring at the pace a device would.
fn run_tone_thread(
    frequency_hz: f32,
    amplitude: f32,
    sample_rate: u32,
    mut producer: RingProducer,
    stop_rx: Receiver<()>,
) {
    let block_duration = Duration::from_secs_f64(TONE_BLOCK_SIZE as f64 / sample_rate as f64);
    let step = std::f64::consts::TAU * frequency_hz as f64 / sample_rate as f64;
    let mut phase = 0.0f64;
    let mut block = vec![0.0f32; TONE_BLOCK_SIZE];
    let mut deadline = Instant::now();

    loop {
        for sample in block.iter_mut() {
            *sample = amplitude * phase.sin() as f32;
            phase = (phase + step) % std::f64::consts::TAU;
        }
        producer.write(&block);

        deadline += block_duration;
        let wait = deadline.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    log::debug!("Tone source stopping");
}
