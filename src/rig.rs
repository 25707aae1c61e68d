//! Wiring of the rig's components.
//!
//! [`Rig`] owns one of each collaborator and shares them by `Arc`: the
//! controller and the safety monitor share the [`SafetyState`] latch, the
//! acquisition engine reads positions from the controller, and the
//! orchestrator drives both.

use crate::acquisition::{DataAcquisitionEngine, SensorSource, SimulatedSensor};
use crate::config::RigConfig;
use crate::error::RigResult;
use crate::events::EventBus;
use crate::hardware::{MotionPort, SignalLight, SimulatedPort};
use crate::motion::MotionController;
use crate::persistence::TestStore;
use crate::safety::{SafetyMonitor, SafetyState, TripReason};
use crate::test_run::{TestOrchestrator, TestStateManager};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Noise seed of the simulated sensor.
pub const SIMULATION_SEED: u64 = 7;

/// The assembled rig.
pub struct Rig {
    config: RigConfig,
    controller: Arc<MotionController>,
    monitor: Arc<SafetyMonitor>,
    acquisition: Arc<DataAcquisitionEngine>,
    orchestrator: Arc<TestOrchestrator>,
    events: EventBus,
}

impl Rig {
    /// Assemble the rig over `port`, reading values from `source`.
    pub fn assemble(
        config: RigConfig,
        port: Arc<dyn MotionPort>,
        source: SensorSource,
        store: Arc<dyn TestStore>,
    ) -> Self {
        let events = EventBus::default();
        let safety = Arc::new(SafetyState::new());
        let controller = Arc::new(MotionController::new(port, Arc::clone(&safety), &config));
        let monitor = SafetyMonitor::new(
            Arc::clone(&controller),
            safety,
            config.safety.clone(),
            events.clone(),
        );
        let acquisition = Arc::new(DataAcquisitionEngine::new(
            source,
            Arc::clone(&controller),
            &config.sensor,
            events.clone(),
        ));
        let orchestrator = Arc::new(TestOrchestrator::new(
            Arc::clone(&controller),
            Arc::clone(&acquisition),
            store,
            TestStateManager::new(),
            events.clone(),
            &config,
        ));

        Self {
            config,
            controller,
            monitor,
            acquisition,
            orchestrator,
            events,
        }
    }

    /// Rig over the simulated card and sensor.
    ///
    /// The port is returned as well for fault injection.
    pub fn simulated(config: RigConfig, store: Arc<dyn TestStore>) -> (Self, Arc<SimulatedPort>) {
        let port = Arc::new(SimulatedPort::new());
        let source = SensorSource::Simulated(SimulatedSensor::new(SIMULATION_SEED));
        let rig = Self::assemble(config, port.clone(), source, store);
        (rig, port)
    }

    /// Bring up the card, arm the safety monitor and configure the sensor.
    ///
    /// A card that fails to come up leaves the rig disabled and unmonitored;
    /// the error is returned for the caller to report.
    pub async fn initialize(&self) -> RigResult<()> {
        if let Err(err) = self.controller.initialize().await {
            error!(%err, "Motion card unavailable, rig stays disabled");
            return Err(err);
        }
        self.monitor.start();

        let setup = &self.config.sensor.device_setup;
        if !setup.is_empty() {
            let accepted = self.acquisition.initialize_sensor(setup).await;
            if accepted < setup.len() {
                warn!(accepted, total = setup.len(), "Sensor runs partly on defaults");
            }
        }

        if let Err(err) = self.controller.set_signal_light(SignalLight::Green).await {
            warn!(%err, "Ready indicator could not be set");
        }
        info!(name = %self.config.application.name, "Rig ready");
        Ok(())
    }

    /// Operator E-stop through the safety path.
    pub async fn emergency_stop(&self) {
        self.monitor.trip(TripReason::Operator).await;
    }

    /// Run the ordered safety reset.
    pub async fn reset_safety(&self) -> RigResult<()> {
        self.monitor.reset().await
    }

    /// Stop everything and de-energize the axis.
    pub async fn shutdown(&self) {
        if self.orchestrator.is_test_in_progress() {
            if let Err(err) = self.orchestrator.stop_test().await {
                warn!(%err, "Running test could not be stopped cleanly");
            }
        }
        self.acquisition.close();
        self.monitor.stop();
        if let Err(err) = self.controller.port().axis_off().await {
            warn!(%err, "Axis could not be disabled");
        }
        if let Err(err) = self.controller.set_signal_light(SignalLight::Off).await {
            warn!(%err, "Signal tower could not be cleared");
        }
        info!("Rig shut down");
    }

    /// Configuration in use.
    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Motion controller.
    pub fn controller(&self) -> &Arc<MotionController> {
        &self.controller
    }

    /// Safety monitor.
    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    /// Acquisition engine.
    pub fn acquisition(&self) -> &Arc<DataAcquisitionEngine> {
        &self.acquisition
    }

    /// Test orchestrator.
    pub fn orchestrator(&self) -> &Arc<TestOrchestrator> {
        &self.orchestrator
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Sensor source for `config`: the serial sensor when a port is configured
/// and serial support is built in, the simulation otherwise.
pub async fn sensor_source(config: &RigConfig) -> RigResult<SensorSource> {
    #[cfg(feature = "serial")]
    if config.sensor.port.is_some() {
        let link = crate::sensor::ModbusSensorLink::open(&config.sensor).await?;
        return Ok(SensorSource::Modbus {
            link,
            register: config.sensor.value_register,
        });
    }

    if let Some(port) = &config.sensor.port {
        warn!(%port, "Serial support is not built in; simulating the sensor");
    }
    Ok(SensorSource::Simulated(SimulatedSensor::new(SIMULATION_SEED)))
}
