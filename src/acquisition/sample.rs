//! Position-correlated sensor readings.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Where a sample's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Read from the physical sensor
    Good,
    /// Synthesized by the simulated sensor
    Simulated,
}

/// One recorded reading. Immutable once buffered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Axis position in physical units
    pub position: f64,
    /// Sensor value
    pub value: f64,
    /// Wall-clock time of the reading
    pub timestamp: DateTime<Utc>,
    /// Origin of the value
    pub quality: QualityFlag,
}

impl SensorSample {
    /// Sample stamped with `timestamp`.
    pub fn new(position: f64, value: f64, timestamp: DateTime<Utc>, quality: QualityFlag) -> Self {
        Self {
            position,
            value,
            timestamp,
            quality,
        }
    }
}

/// Wall-clock timestamps driven by the tokio clock.
///
/// The wall time is captured once; later stamps add the monotonic elapsed
/// time, so stamps never go backwards and follow a paused test clock.
#[derive(Debug, Clone, Copy)]
pub struct SampleClock {
    epoch: DateTime<Utc>,
    started: Instant,
}

impl SampleClock {
    /// Clock anchored at the current time.
    pub fn new() -> Self {
        Self {
            epoch: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Current timestamp.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.started.elapsed()).unwrap_or_default();
        self.epoch + elapsed
    }
}

impl Default for SampleClock {
    fn default() -> Self {
        Self::new()
    }
}
