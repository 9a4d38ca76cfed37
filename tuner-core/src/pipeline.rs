//! # Pipeline Module
//!
//! Wires capture, ring, analyzer and tracker together.
//!
//! ```text
//! capture thread --ring--> analysis thread --channel--> presenter
//!                                          \--latest reading slot
//! ```
//!
//! The analysis thread forms overlapping frames (one full window, then one
//! hop at a time), estimates their pitch and feeds the tracker. Tracker events
//! go out over a bounded channel; when nobody drains it, new events are
//! counted and dropped. The newest reading is also kept in a lock-free slot
//! for presenters that poll instead.

use arc_swap::ArcSwapOption;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::AudioFrame;
use crate::audio::{AudioCapture, CaptureInfo};
use crate::config::TunerConfig;
use crate::error::{Result, TunerError};
use crate::pitch::FrameAnalyzer;
use crate::ring::{RingConsumer, RingStats, ring_buffer};
use crate::tracker::{PitchTracker, StableReading, TrackerEvent};

/// Events held for the presenter before new ones are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Counters describing the health of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    pub sample_rate: u32,
    /// Capture blocks dropped because the ring was full.
    pub overruns: u64,
    /// Times the analysis thread found less than a hop waiting.
    pub underruns: u64,
    pub dropped_samples: u64,
    pub frames_analyzed: u64,
    /// Events dropped because the event queue was full.
    pub dropped_events: u64,
    /// The device reported a stream failure.
    pub stream_failed: bool,
}

/// Stops capture and analysis from any thread.
///
/// The capture thread drops its stream on the signal, so no sample is
/// delivered after the current buffer. Once the analysis thread has stopped
/// the event channel disconnects, which ends any loop blocked on it. Joining
/// the threads is left to [`Tuner::stop`] or drop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    analysis_tx: Sender<()>,
    capture_tx: Option<Sender<()>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if let Some(capture_tx) = &self.capture_tx {
            let _ = capture_tx.try_send(());
        }
        let _ = self.analysis_tx.try_send(());
    }
}

/// Analysis thread management.
#[derive(Debug)]
struct AnalysisWorker {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

/// A running tuner: capture plus analysis.
pub struct Tuner {
    config: TunerConfig,
    capture: Option<AudioCapture>,
    worker: Option<AnalysisWorker>,
    events_rx: Receiver<TrackerEvent>,
    latest: Arc<ArcSwapOption<StableReading>>,
    stats: Arc<RingStats>,
    frames_analyzed: Arc<AtomicU64>,
    dropped_events: Arc<AtomicU64>,
    stream_failed: Arc<AtomicBool>,
    sample_rate: u32,
}

impl Tuner {
    /// Validates `config`, opens the input and starts analysis.
    ///
    /// Every buffer the pipeline needs is allocated before this returns.
    pub fn start(config: TunerConfig) -> Result<Self> {
        config.validate()?;

        let (producer, consumer) = ring_buffer(config.ring_capacity());
        let stats = producer.stats();
        let capture = AudioCapture::start(&config, producer)?;
        let sample_rate = capture.sample_rate();
        let analyzer = FrameAnalyzer::new(&config, sample_rate)?;
        let tracker = PitchTracker::new(&config);

        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let latest = Arc::new(ArcSwapOption::empty());
        let frames_analyzed = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let analysis = AnalysisLoop::new(
            consumer,
            analyzer,
            tracker,
            config.hop_size,
            Publisher {
                events_tx,
                latest: latest.clone(),
                dropped_events: dropped_events.clone(),
            },
            frames_analyzed.clone(),
        );

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let idle_wait = config.hop_duration(sample_rate) / 2;
        let thread_handle = thread::Builder::new()
            .name("tuner-analysis".to_string())
            .spawn(move || analysis.run(shutdown_rx, idle_wait))
            .map_err(|e| TunerError::Stream(format!("failed to spawn analysis thread: {e}")))?;

        log::info!(
            "Tuner started: {} Hz, window {}, hop {}, {:?}",
            sample_rate,
            config.window_size,
            config.hop_size,
            config.estimator
        );

        Ok(Self {
            stream_failed: capture.failure_flag(),
            config,
            capture: Some(capture),
            worker: Some(AnalysisWorker {
                shutdown_tx,
                thread_handle: Some(thread_handle),
            }),
            events_rx,
            latest,
            stats,
            frames_analyzed,
            dropped_events,
            sample_rate,
        })
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Negotiated sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn capture_info(&self) -> Option<&CaptureInfo> {
        self.capture.as_ref().map(AudioCapture::info)
    }

    /// Tracker events in frame order. Disconnects when analysis stops.
    ///
    /// At most [`EVENT_QUEUE_CAPACITY`] events wait in the queue; later ones
    /// are dropped until it is drained, while [`Tuner::latest`] stays current.
    pub fn events(&self) -> Receiver<TrackerEvent> {
        self.events_rx.clone()
    }

    /// The newest reading, or `None` while silent.
    pub fn latest(&self) -> Option<StableReading> {
        self.latest.load_full().map(|reading| *reading)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            analysis_tx: self.worker.as_ref().map_or_else(
                || bounded(1).0,
                |worker| worker.shutdown_tx.clone(),
            ),
            capture_tx: self.capture.as_ref().map(AudioCapture::stop_sender),
        }
    }

    /// Whether the analysis thread is still running.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .and_then(|worker| worker.thread_handle.as_ref())
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Whether the capture thread is still delivering samples.
    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(AudioCapture::is_running)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            sample_rate: self.sample_rate,
            overruns: self.stats.overruns(),
            underruns: self.stats.underruns(),
            dropped_samples: self.stats.dropped_samples(),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            stream_failed: self.stream_failed.load(Ordering::Acquire),
        }
    }

    /// Surfaces a runtime stream failure reported by the device.
    pub fn check_stream(&self) -> Result<()> {
        if self.stream_failed.load(Ordering::Acquire) {
            return Err(TunerError::Stream(
                "the input stream was interrupted".to_string(),
            ));
        }
        Ok(())
    }

    /// Stops analysis and capture and releases the device. Idempotent.
    pub fn stop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown_tx.try_send(());
        if let Some(handle) = worker.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Analysis thread panicked");
            }
        }
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.latest.store(None);
        log::info!("Tuner stopped after {} frames", self.diagnostics().frames_analyzed);
    }

    /// Stops and starts again with the same configuration.
    ///
    /// The event channel is replaced; receivers obtained earlier disconnect.
    pub fn restart(&mut self) -> Result<()> {
        let config = self.config.clone();
        self.restart_with(config)
    }

    /// Stops and starts again with a new configuration.
    pub fn restart_with(&mut self, config: TunerConfig) -> Result<()> {
        self.stop();
        *self = Tuner::start(config)?;
        Ok(())
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hands tracker events to the presenter without ever blocking analysis.
struct Publisher {
    events_tx: Sender<TrackerEvent>,
    latest: Arc<ArcSwapOption<StableReading>>,
    dropped_events: Arc<AtomicU64>,
}

impl Publisher {
    fn publish(&self, event: TrackerEvent) {
        match &event {
            TrackerEvent::Reading(reading) => self.latest.store(Some(Arc::new(*reading))),
            TrackerEvent::Silence { .. } => self.latest.store(None),
        }
        match self.events_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("Event queue full; {dropped} events dropped so far");
                }
            }
        }
    }
}

/// State owned by the analysis thread.
struct AnalysisLoop {
    consumer: RingConsumer,
    analyzer: FrameAnalyzer,
    tracker: PitchTracker,
    hop_size: usize,
    frame: Option<AudioFrame>,
    publisher: Publisher,
    frames_analyzed: Arc<AtomicU64>,
}

impl AnalysisLoop {
    fn new(
        consumer: RingConsumer,
        analyzer: FrameAnalyzer,
        tracker: PitchTracker,
        hop_size: usize,
        publisher: Publisher,
        frames_analyzed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            consumer,
            analyzer,
            tracker,
            hop_size,
            frame: None,
            publisher,
            frames_analyzed,
        }
    }

    fn run(mut self, shutdown_rx: Receiver<()>, idle_wait: Duration) {
        log::debug!("Analysis thread started");
        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }
            if self.poll() {
                continue;
            }
            match shutdown_rx.recv_timeout(idle_wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
        log::debug!("Analysis thread stopping");
    }

    /// Analyzes the next frame if enough samples are buffered.
    fn poll(&mut self) -> bool {
        let sample_rate = self.analyzer.sample_rate();
        match self.frame.as_mut() {
            None => {
                let Some(samples) = self.consumer.read(self.analyzer.window_size()) else {
                    return false;
                };
                self.frame = Some(AudioFrame::new(samples.to_vec(), sample_rate, 0));
            }
            Some(frame) => {
                let Some(hop) = self.consumer.read(self.hop_size) else {
                    return false;
                };
                frame.slide(hop);
            }
        }

        let Some(frame) = self.frame.as_ref() else {
            return false;
        };
        let estimate = self.analyzer.analyze(frame);
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "frame {}: {:.2} Hz, confidence {:.2}, {:.1} dB",
            estimate.frame_index,
            estimate.frequency_hz,
            estimate.confidence,
            estimate.amplitude_db
        );

        if let Some(event) = self.tracker.update(&estimate) {
            self.publisher.publish(event);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingProducer;
    use crate::tuning::NoteName;

    struct Harness {
        producer: RingProducer,
        analysis: AnalysisLoop,
        events_rx: Receiver<TrackerEvent>,
        latest: Arc<ArcSwapOption<StableReading>>,
        frames_analyzed: Arc<AtomicU64>,
        dropped_events: Arc<AtomicU64>,
    }

    fn harness(config: &TunerConfig) -> Harness {
        harness_with_queue(config, EVENT_QUEUE_CAPACITY)
    }

    fn harness_with_queue(config: &TunerConfig, queue_capacity: usize) -> Harness {
        let (producer, consumer) = ring_buffer(config.ring_capacity());
        let (events_tx, events_rx) = bounded(queue_capacity);
        let latest = Arc::new(ArcSwapOption::empty());
        let frames_analyzed = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let analysis = AnalysisLoop::new(
            consumer,
            FrameAnalyzer::new(config, config.sample_rate).unwrap(),
            PitchTracker::new(config),
            config.hop_size,
            Publisher {
                events_tx,
                latest: latest.clone(),
                dropped_events: dropped_events.clone(),
            },
            frames_analyzed.clone(),
        );
        Harness {
            producer,
            analysis,
            events_rx,
            latest,
            frames_analyzed,
            dropped_events,
        }
    }

    fn sine(freq: f32, sample_rate: u32, start: usize, len: usize) -> Vec<f32> {
        (start..start + len)
            .map(|i| {
                0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin()
            })
            .collect()
    }

    impl Harness {
        fn drain(&mut self) -> usize {
            let mut analyzed = 0;
            while self.analysis.poll() {
                analyzed += 1;
            }
            analyzed
        }
    }

    #[test]
    fn first_frame_waits_for_a_full_window() {
        let config = TunerConfig::default();
        let mut h = harness(&config);
        assert!(h.producer.write(&sine(440.0, 44100, 0, config.window_size - 1)));
        assert!(!h.analysis.poll());
        assert!(h.producer.write(&[0.0]));
        assert!(h.analysis.poll());
        assert!(!h.analysis.poll());
        assert_eq!(h.frames_analyzed.load(Ordering::Relaxed), 1);
        assert!(h.producer.stats().underruns() >= 2);
    }

    #[test]
    fn buffered_tone_produces_a4_reading() {
        let config = TunerConfig::default();
        let mut h = harness(&config);
        let total = config.ring_capacity();
        assert!(h.producer.write(&sine(440.0, 44100, 0, total)));

        let analyzed = h.drain();
        assert_eq!(analyzed, 1 + (total - config.window_size) / config.hop_size);

        let events: Vec<TrackerEvent> = h.events_rx.try_iter().collect();
        let TrackerEvent::Reading(first) = events[0] else {
            panic!("expected a reading first, got {:?}", events[0]);
        };
        assert_eq!((first.note, first.octave), (NoteName::A, 4));
        assert!(first.cents.abs() < 1.0);
        assert_eq!(first.frame_index, 0);
        for pair in events.windows(2) {
            assert!(pair[1].frame_index() > pair[0].frame_index());
        }

        let latest = h.latest.load_full().expect("latest reading");
        assert_eq!(latest.note, NoteName::A);
    }

    #[test]
    fn silence_clears_latest() {
        let config = TunerConfig::default();
        let mut h = harness(&config);
        let tone_len = config.window_size + 4 * config.hop_size;
        assert!(h.producer.write(&sine(329.63, 44100, 0, tone_len)));
        h.drain();
        assert!(h.latest.load().is_some());

        // Flush the tone out of the window, then stay silent long enough.
        let silent_hops = config.window_size / config.hop_size
            + config.tracker.silence_frames as usize
            + 2;
        for _ in 0..silent_hops {
            assert!(h.producer.write(&vec![0.0; config.hop_size]));
            h.drain();
        }

        assert!(h.latest.load().is_none());
        let last = h.events_rx.try_iter().last().unwrap();
        assert!(matches!(last, TrackerEvent::Silence { .. }));
    }

    #[test]
    fn run_exits_on_shutdown() {
        let config = TunerConfig::default();
        let h = harness(&config);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let analysis = h.analysis;
        let thread = std::thread::spawn(move || {
            analysis.run(shutdown_rx, Duration::from_millis(5));
        });
        std::thread::sleep(Duration::from_millis(20));
        shutdown_tx.send(()).unwrap();
        thread.join().unwrap();
        // The sender side of the event channel went away with the loop.
        assert!(h.events_rx.recv().is_err());
    }

    #[test]
    fn undrained_events_are_bounded() {
        let config = TunerConfig::default();
        let queue_capacity = 16;
        let mut h = harness_with_queue(&config, queue_capacity);

        // Phase-continuous glide from 200 Hz to 280 Hz, fed one hop at a time.
        let hops = 400;
        let mut phase = 0.0f64;
        let mut next_block = |len: usize, freq: f64| -> Vec<f32> {
            (0..len)
                .map(|_| {
                    phase += std::f64::consts::TAU * freq / 44100.0;
                    (0.5 * phase.sin()) as f32
                })
                .collect()
        };
        assert!(h.producer.write(&next_block(config.window_size, 200.0)));
        h.drain();
        for hop in 1..=hops {
            let freq = 200.0 + 80.0 * hop as f64 / hops as f64;
            assert!(h.producer.write(&next_block(config.hop_size, freq)));
            h.drain();
        }

        assert!(h.events_rx.len() <= queue_capacity);
        assert!(h.dropped_events.load(Ordering::Relaxed) > 0);
        // The slot keeps following the glide even though the queue is full.
        let latest = h.latest.load_full().expect("latest reading");
        assert!(latest.frequency_hz > 260.0, "latest {} Hz", latest.frequency_hz);
    }

    #[test]
    fn stop_handle_signals_both_threads_once() {
        let (analysis_tx, analysis_rx) = bounded(1);
        let (capture_tx, capture_rx) = bounded(1);
        let handle = StopHandle {
            analysis_tx,
            capture_tx: Some(capture_tx),
        };
        handle.stop();
        handle.clone().stop();
        assert!(analysis_rx.try_recv().is_ok());
        assert!(analysis_rx.try_recv().is_err());
        assert!(capture_rx.try_recv().is_ok());
        assert!(capture_rx.try_recv().is_err());
    }
}
