//! Position-correlated data acquisition.
//!
//! The engine reads the sensor (or its simulation), stamps each reading with
//! the axis position and pushes it through the [`SampleBuffer`] gate. Read
//! failures of any kind come back as `None` and never disturb the buffer.

use crate::acquisition::buffer::SampleBuffer;
use crate::acquisition::sample::{QualityFlag, SampleClock, SensorSample};
use crate::config::{RegisterWrite, SensorConfig};
use crate::error::{RigError, RigResult};
use crate::events::{EventBus, RigEvent};
use crate::motion::MotionController;
use crate::sensor::ModbusSensorLink;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Software stand-in for the force sensor.
///
/// The value is a smooth function of position plus seeded noise, so runs
/// are repeatable for a given seed.
#[derive(Debug)]
pub struct SimulatedSensor {
    rng: Mutex<StdRng>,
    noise: f64,
}

impl SimulatedSensor {
    /// Sensor with a fixed noise seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            noise: 0.1,
        }
    }

    /// Reading at `position`.
    pub fn value_at(&self, position: f64) -> f64 {
        let jitter: f64 = self.rng.lock().gen_range(-1.0..1.0);
        (position * 0.1).sin() + jitter * self.noise
    }
}

/// Where readings come from.
pub enum SensorSource {
    /// Synthesized values
    Simulated(SimulatedSensor),
    /// Modbus RTU sensor on a serial line
    Modbus {
        /// Link to the device
        link: ModbusSensorLink,
        /// First register of the f32 value
        register: u16,
    },
}

impl SensorSource {
    fn quality(&self) -> QualityFlag {
        match self {
            SensorSource::Simulated(_) => QualityFlag::Simulated,
            SensorSource::Modbus { .. } => QualityFlag::Good,
        }
    }
}

struct CollectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sensor reader and owner of the sample buffer.
pub struct DataAcquisitionEngine {
    source: SensorSource,
    controller: Arc<MotionController>,
    buffer: SampleBuffer,
    clock: SampleClock,
    events: EventBus,
    threshold: Mutex<f64>,
    sampling_rate_hz: u32,
    latest: Mutex<Option<SensorSample>>,
    continuous: Mutex<Option<CollectTask>>,
}

impl DataAcquisitionEngine {
    /// Engine reading from `source`.
    pub fn new(
        source: SensorSource,
        controller: Arc<MotionController>,
        config: &SensorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            controller,
            buffer: SampleBuffer::new(),
            clock: SampleClock::new(),
            events,
            threshold: Mutex::new(config.precision_threshold),
            sampling_rate_hz: config.effective_sampling_rate(),
            latest: Mutex::new(None),
            continuous: Mutex::new(None),
        }
    }

    /// Engine over the simulated sensor.
    pub fn simulated(
        controller: Arc<MotionController>,
        config: &SensorConfig,
        events: EventBus,
        seed: u64,
    ) -> Self {
        Self::new(
            SensorSource::Simulated(SimulatedSensor::new(seed)),
            controller,
            config,
            events,
        )
    }

    /// Engine over a Modbus sensor link.
    pub fn with_link(
        link: ModbusSensorLink,
        controller: Arc<MotionController>,
        config: &SensorConfig,
        events: EventBus,
    ) -> Self {
        let register = config.value_register;
        Self::new(
            SensorSource::Modbus { link, register },
            controller,
            config,
            events,
        )
    }

    /// Whether values are synthesized.
    pub fn is_simulated(&self) -> bool {
        matches!(self.source, SensorSource::Simulated(_))
    }

    /// Current displacement gate.
    pub fn threshold(&self) -> f64 {
        *self.threshold.lock()
    }

    /// Change the displacement gate.
    pub fn set_threshold(&self, threshold: f64) -> RigResult<()> {
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(RigError::InvalidCommand(format!(
                "precision threshold must be positive, got {threshold}"
            )));
        }
        *self.threshold.lock() = threshold;
        Ok(())
    }

    /// Change the sensor station address and the displacement gate.
    pub fn configure(&self, station: u8, threshold: f64) -> RigResult<()> {
        self.set_threshold(threshold)?;
        if let SensorSource::Modbus { link, .. } = &self.source {
            link.set_station(station);
        }
        debug!(station, threshold, "Acquisition configured");
        Ok(())
    }

    /// Write the bring-up registers. Returns how many were accepted.
    pub async fn initialize_sensor(&self, setup: &[RegisterWrite]) -> usize {
        match &self.source {
            SensorSource::Simulated(_) => {
                debug!("Simulated sensor needs no setup");
                0
            }
            SensorSource::Modbus { link, .. } => link.configure(setup).await,
        }
    }

    async fn read_at(&self, position: f64) -> RigResult<f64> {
        match &self.source {
            SensorSource::Simulated(sensor) => Ok(sensor.value_at(position)),
            SensorSource::Modbus { link, register } => {
                link.read_f32(*register).await.map(f64::from)
            }
        }
    }

    /// Raw sensor value at the current axis position.
    pub async fn read_value(&self) -> RigResult<f64> {
        let position = self.controller.get_current_position().await;
        self.read_at(position).await
    }

    /// Read the sensor and stamp the value with `position`.
    ///
    /// The reading is returned even when the gate drops it; only gated
    /// samples are buffered and announced. `None` means the read failed.
    pub async fn collect_at_position(&self, position: f64) -> Option<SensorSample> {
        let value = match self.read_at(position).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, position, "Sensor read failed, sample dropped");
                return None;
            }
        };

        let sample = SensorSample::new(position, value, self.clock.now(), self.source.quality());
        *self.latest.lock() = Some(sample.clone());
        if self.buffer.record_if_moved(sample.clone(), self.threshold()) {
            self.events.emit(RigEvent::DataCollected(sample.clone()));
        }
        Some(sample)
    }

    /// Most recent successful reading, gated or not.
    pub fn latest_sample(&self) -> Option<SensorSample> {
        self.latest.lock().clone()
    }

    /// Copy of the buffered samples.
    pub fn buffer(&self) -> Vec<SensorSample> {
        self.buffer.snapshot()
    }

    /// Number of buffered samples.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Empty the buffer and rearm the gate.
    pub fn clear_buffer(&self) {
        self.buffer.clear();
    }

    /// Collection rate of the continuous task.
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(1) / self.sampling_rate_hz.max(1)
    }

    /// Whether the continuous task is running.
    pub fn is_collecting(&self) -> bool {
        self.continuous
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Sample at the controller's position on a fixed cadence until stopped.
    pub fn start_continuous(self: &Arc<Self>) {
        let mut slot = self.continuous.lock();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(engine.sampling_period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let position = engine.controller.get_current_position().await;
                engine.collect_at_position(position).await;
            }
            debug!("Continuous collection stopped");
        });
        *slot = Some(CollectTask { cancel, handle });
        info!(rate_hz = self.sampling_rate_hz, "Continuous collection started");
    }

    /// Stop the continuous task, if running.
    pub fn stop_continuous(&self) {
        if let Some(task) = self.continuous.lock().take() {
            task.cancel.cancel();
        }
    }

    /// Stop collecting and release the sensor.
    pub fn close(&self) {
        self.stop_continuous();
        info!("Acquisition closed");
    }
}

impl Drop for DataAcquisitionEngine {
    fn drop(&mut self) {
        if let Some(task) = self.continuous.get_mut().take() {
            task.cancel.cancel();
        }
    }
}
