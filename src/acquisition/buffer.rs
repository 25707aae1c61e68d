//! Displacement-gated sample buffer.
//!
//! Every mutation happens under one lock. A sample is kept only when the axis
//! has moved more than the precision threshold since the last kept sample,
//! which bounds growth to about one sample per threshold-sized step no matter
//! how often the engine polls.

use crate::acquisition::sample::SensorSample;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    samples: Vec<SensorSample>,
    last_recorded: f64,
}

/// Append-only sample store shared by the collectors and the orchestrator.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    inner: Mutex<Inner>,
}

impl SampleBuffer {
    /// Empty buffer; the gate reference starts at position zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `sample` if it moved more than `threshold` from the last kept one.
    ///
    /// Gate check and append happen under the same lock.
    pub fn record_if_moved(&self, sample: SensorSample, threshold: f64) -> bool {
        let mut inner = self.inner.lock();
        if (sample.position - inner.last_recorded).abs() <= threshold {
            return false;
        }
        inner.last_recorded = sample.position;
        inner.samples.push(sample);
        true
    }

    /// Copy of the buffered samples.
    pub fn snapshot(&self) -> Vec<SensorSample> {
        self.inner.lock().samples.clone()
    }

    /// Most recent kept sample.
    pub fn last(&self) -> Option<SensorSample> {
        self.inner.lock().samples.last().cloned()
    }

    /// Drop all samples and rearm the gate at zero.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.last_recorded = 0.0;
    }

    /// Number of kept samples.
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Whether nothing has been kept.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
