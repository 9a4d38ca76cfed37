//! # Sample Ring Module
//!
//! Lock-free single-producer/single-consumer ring of mono samples that
//! decouples the real-time capture callback from the analysis thread.
//!
//! Built on `ringbuf::HeapRb<f32>`: both halves are wait-free and the
//! capacity is fixed when the ring is created. Writes are all-or-nothing so a
//! capture block is either stored whole or dropped and counted as an overrun;
//! reads are exact so the analysis thread only ever sees complete hops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Overrun/underrun counters shared by both halves of a ring.
#[derive(Debug, Default)]
pub struct RingStats {
    overruns: AtomicU64,
    underruns: AtomicU64,
    dropped_samples: AtomicU64,
}

impl RingStats {
    /// Writes rejected because the ring was too full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Reads that found fewer samples than requested.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples lost to overruns.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}

/// Writing half, owned by the capture thread.
pub struct RingProducer {
    inner: HeapProd<f32>,
    stats: Arc<RingStats>,
}

/// Reading half, owned by the analysis thread.
pub struct RingConsumer {
    inner: HeapCons<f32>,
    scratch: Vec<f32>,
    stats: Arc<RingStats>,
}

/// Creates a ring holding `capacity` samples and splits it into its two halves.
///
/// All memory, including the consumer's read buffer, is allocated here.
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    let capacity = capacity.max(1);
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
    let stats = Arc::new(RingStats::default());
    (
        RingProducer {
            inner: producer,
            stats: stats.clone(),
        },
        RingConsumer {
            inner: consumer,
            scratch: vec![0.0; capacity],
            stats,
        },
    )
}

impl RingProducer {
    /// Appends `samples` if they all fit.
    ///
    /// Returns `false` and counts an overrun otherwise; nothing is written in
    /// that case. Never blocks.
    pub fn write(&mut self, samples: &[f32]) -> bool {
        if self.inner.vacant_len() < samples.len() {
            self.record_overrun(samples.len());
            return false;
        }
        self.inner.push_slice(samples);
        true
    }

    /// Same contract as [`write`](Self::write) for samples produced on the fly,
    /// e.g. converted and downmixed straight out of a device buffer.
    pub fn write_iter<I>(&mut self, samples: I) -> bool
    where
        I: ExactSizeIterator<Item = f32>,
    {
        let len = samples.len();
        if self.inner.vacant_len() < len {
            self.record_overrun(len);
            return false;
        }
        self.inner.push_iter(samples);
        true
    }

    /// Free space in samples.
    pub fn vacant(&self) -> usize {
        self.inner.vacant_len()
    }

    pub fn stats(&self) -> Arc<RingStats> {
        self.stats.clone()
    }

    fn record_overrun(&self, len: usize) {
        self.stats.overruns.fetch_add(1, Ordering::Relaxed);
        self.stats
            .dropped_samples
            .fetch_add(len as u64, Ordering::Relaxed);
    }
}

impl RingConsumer {
    /// Removes exactly `count` samples, oldest first.
    ///
    /// Returns `None` and counts an underrun when fewer are available. The
    /// returned slice stays valid until the next call.
    pub fn read(&mut self, count: usize) -> Option<&[f32]> {
        if count > self.scratch.len() || self.inner.occupied_len() < count {
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let read = self.inner.pop_slice(&mut self.scratch[..count]);
        Some(&self.scratch[..read])
    }

    /// Samples waiting to be read.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn stats(&self) -> Arc<RingStats> {
        self.stats.clone()
    }
}
