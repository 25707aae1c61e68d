//! Automatic test sequencing.
//!
//! A test moves to the start position, then runs the measured leg to the end
//! position in a spawned task while the orchestrator samples the sensor on
//! the motion poll cadence. One test runs at a time system-wide; the slot is
//! held by a [`TestActivityGuard`] and every exit path goes through the same
//! teardown.

use crate::acquisition::{DataAcquisitionEngine, SensorSample};
use crate::config::RigConfig;
use crate::error::{RigError, RigResult};
use crate::events::{EventBus, RigEvent, TestOutcome};
use crate::motion::{ExternalSignal, MotionController, OperatingMode};
use crate::persistence::{TestRun, TestRunId, TestStore};
use crate::test_run::state::{TestActivityGuard, TestStateManager};
use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Inputs of one automatic test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestParameters {
    /// Velocity of both legs (units/s)
    pub velocity: f64,
    /// Acceleration of both legs (units/s²)
    pub acceleration: f64,
    /// Where sampling starts
    pub start_position: f64,
    /// Where sampling ends
    pub end_position: f64,
    /// Prefix of the run name
    pub label: String,
}

impl TestParameters {
    /// Parameters for a `start` → `end` test.
    pub fn new(start_position: f64, end_position: f64, velocity: f64, acceleration: f64) -> Self {
        Self {
            velocity,
            acceleration,
            start_position,
            end_position,
            label: "test".to_string(),
        }
    }

    /// Set the run label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Reject values no move could honor.
    pub fn validate(&self) -> RigResult<()> {
        let finite = [
            self.velocity,
            self.acceleration,
            self.start_position,
            self.end_position,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(RigError::InvalidCommand(
                "test parameters must be finite".to_string(),
            ));
        }
        if self.velocity <= 0.0 || self.acceleration <= 0.0 {
            return Err(RigError::InvalidCommand(format!(
                "velocity {} and acceleration {} must be positive",
                self.velocity, self.acceleration
            )));
        }
        if self.label.trim().is_empty() {
            return Err(RigError::InvalidCommand("test label is empty".to_string()));
        }
        Ok(())
    }

    fn run_name(&self) -> String {
        format!("{}_{}", self.label.trim(), Local::now().format("%Y%m%d%H%M%S"))
    }
}

/// What an automatic test produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    /// Run name
    pub name: String,
    /// Saved header; `None` when nothing was sampled
    pub run: Option<TestRun>,
    /// Id assigned by the store
    pub run_id: Option<TestRunId>,
    /// Whether the sample batch reached the store
    pub samples_saved: bool,
}

impl TestReport {
    fn outcome(&self) -> TestOutcome {
        TestOutcome::Completed {
            run_id: self.run_id,
            sample_count: self.run.as_ref().map_or(0, |run| run.sample_count),
        }
    }
}

struct ActiveTest {
    id: u64,
    guard: TestActivityGuard,
    token: CancellationToken,
    name: String,
}

/// Runs automatic, speed and reset sequences against the controller.
pub struct TestOrchestrator {
    controller: Arc<MotionController>,
    acquisition: Arc<DataAcquisitionEngine>,
    store: Arc<dyn TestStore>,
    tests: TestStateManager,
    events: EventBus,
    sample_interval: Duration,
    reset_timeout: Duration,
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl TestOrchestrator {
    /// Orchestrator over the shared rig components.
    pub fn new(
        controller: Arc<MotionController>,
        acquisition: Arc<DataAcquisitionEngine>,
        store: Arc<dyn TestStore>,
        tests: TestStateManager,
        events: EventBus,
        config: &RigConfig,
    ) -> Self {
        Self {
            controller,
            acquisition,
            store,
            tests,
            events,
            sample_interval: config.motion.poll_interval(),
            reset_timeout: config.motion.reset_timeout(),
            current: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Shared activity counter.
    pub fn tests(&self) -> &TestStateManager {
        &self.tests
    }

    /// Whether a test holds the slot.
    pub fn is_test_in_progress(&self) -> bool {
        self.tests.is_test_in_progress()
    }

    fn begin(&self, params: &TestParameters) -> RigResult<ActiveTest> {
        params.validate()?;
        let mode = self.controller.mode();
        if mode != OperatingMode::Automatic {
            warn!(%mode, "Test refused");
            return Err(RigError::ModeConflict {
                requested: OperatingMode::Automatic,
                active: mode,
            });
        }
        let Some(guard) = self.tests.try_begin() else {
            warn!("Test refused: another test is running");
            return Err(RigError::TestInProgress);
        };

        let (id, token) = self.track();
        let name = params.run_name();
        self.events.emit(RigEvent::TestStarted { name: name.clone() });
        Ok(ActiveTest {
            id,
            guard,
            token,
            name,
        })
    }

    /// Register a fresh token as the one `stop_test` cancels.
    fn track(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *self.current.lock() = Some((id, token.clone()));
        (id, token)
    }

    fn untrack(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|(tracked, _)| *tracked == id) {
            *current = None;
        }
    }

    fn finish(&self, test: ActiveTest, outcome: TestOutcome) {
        self.untrack(test.id);
        self.acquisition.clear_buffer();
        self.events.emit(RigEvent::TestCompleted {
            name: test.name,
            outcome,
        });
        drop(test.guard);
    }

    fn outcome_of<T>(result: &RigResult<T>, completed: impl FnOnce(&T) -> TestOutcome) -> TestOutcome {
        match result {
            Ok(value) => completed(value),
            Err(err) if err.is_cancellation() => {
                info!("Test cancelled");
                TestOutcome::Cancelled
            }
            Err(err) => {
                error!(%err, "Test failed");
                TestOutcome::Failed(err.to_string())
            }
        }
    }

    /// Run `start` → `end` with sampling and persist the result.
    ///
    /// Refused with `ModeConflict` outside `Automatic` and with
    /// `TestInProgress` while another test runs; refusals have no side
    /// effects. Stop and E-stop end the test with `OperationCancelled`.
    #[instrument(skip(self, params), fields(label = %params.label))]
    pub async fn start_automatic_test(&self, params: TestParameters) -> RigResult<TestReport> {
        let test = self.begin(&params)?;
        info!(
            name = %test.name,
            start = params.start_position,
            end = params.end_position,
            velocity = params.velocity,
            "Automatic test started"
        );

        let result = self.run_automatic(&test.name, &params, &test.token).await;
        let outcome = Self::outcome_of(&result, TestReport::outcome);
        self.finish(test, outcome);
        result
    }

    async fn run_automatic(
        &self,
        name: &str,
        params: &TestParameters,
        token: &CancellationToken,
    ) -> RigResult<TestReport> {
        self.acquisition.clear_buffer();
        self.controller.signal(ExternalSignal::Moving).await;

        self.controller
            .move_to(params.start_position, params.velocity, params.acceleration, token)
            .await?;
        // only the measured leg is recorded
        self.acquisition.clear_buffer();

        self.sample_leg(params, token).await?;
        let samples = self.acquisition.buffer();
        self.controller.signal(ExternalSignal::Done).await;

        if samples.is_empty() {
            warn!(name, "No samples passed the gate, nothing persisted");
            return Ok(TestReport {
                name: name.to_string(),
                run: None,
                run_id: None,
                samples_saved: false,
            });
        }
        self.persist(name, params, &samples).await
    }

    async fn sample_leg(&self, params: &TestParameters, token: &CancellationToken) -> RigResult<()> {
        let leg_token = token.child_token();
        let _leg_guard = leg_token.clone().drop_guard();

        let controller = Arc::clone(&self.controller);
        let (target, velocity, acceleration) =
            (params.end_position, params.velocity, params.acceleration);
        let mut leg = tokio::spawn(async move {
            controller
                .move_to(target, velocity, acceleration, &leg_token)
                .await
        });

        let mut ticker = interval(self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let moved = loop {
            tokio::select! {
                biased;
                joined = &mut leg => break joined?,
                _ = ticker.tick() => {
                    let position = self.controller.get_current_position().await;
                    self.acquisition.collect_at_position(position).await;
                }
            }
        };
        moved?;

        let position = self.controller.get_current_position().await;
        self.acquisition.collect_at_position(position).await;
        Ok(())
    }

    async fn persist(
        &self,
        name: &str,
        params: &TestParameters,
        samples: &[SensorSample],
    ) -> RigResult<TestReport> {
        let duration_secs = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        };
        let run = TestRun {
            name: name.to_string(),
            label: params.label.clone(),
            velocity: params.velocity,
            acceleration: params.acceleration,
            start_position: params.start_position,
            end_position: params.end_position,
            distance: params.end_position - params.start_position,
            duration_secs,
            sample_count: samples.len(),
        };

        let run_id = self.store.save_test_run(&run).await.map_err(|err| {
            error!(%err, name, "Test run could not be saved");
            err
        })?;
        let samples_saved = match self.store.save_samples(run_id, samples).await {
            Ok(()) => true,
            Err(err) => {
                error!(%err, run_id, "Samples could not be saved; run header kept");
                false
            }
        };
        info!(run_id, samples = run.sample_count, duration_secs, "Test run saved");

        Ok(TestReport {
            name: name.to_string(),
            run: Some(run),
            run_id: Some(run_id),
            samples_saved,
        })
    }

    /// Abort the running test: cancel it, halt the axis and drop its samples.
    pub async fn stop_test(&self) -> RigResult<()> {
        if let Some((_, token)) = self.current.lock().take() {
            token.cancel();
            debug!("Test token cancelled");
        }
        let result = self.controller.stop().await;
        self.controller.signal(ExternalSignal::Done).await;
        self.acquisition.clear_buffer();
        result
    }

    /// Drive `work` (a test or speed test on this orchestrator) to its end,
    /// stopping it if `interrupt` resolves first. The test still runs its
    /// own teardown, so completion is reported and the buffer cleared.
    pub async fn run_until_interrupted<T>(
        &self,
        work: impl Future<Output = RigResult<T>>,
        interrupt: impl Future<Output = ()>,
    ) -> RigResult<T> {
        tokio::pin!(work);
        tokio::select! {
            result = &mut work => result,
            () = interrupt => {
                warn!("Interrupted, stopping the test");
                if let Err(err) = self.stop_test().await {
                    error!(%err, "Stopping the interrupted test failed");
                }
                work.await
            }
        }
    }

    /// Back-and-forth cycles between start and end without sampling.
    ///
    /// Returns the number of completed cycles.
    #[instrument(skip(self, params), fields(label = %params.label))]
    pub async fn speed_test(&self, params: TestParameters, repetitions: u32) -> RigResult<u32> {
        let test = self.begin(&params)?;
        info!(name = %test.name, repetitions, "Speed test started");

        let result = self.run_cycles(&params, repetitions, &test.token).await;
        let outcome = Self::outcome_of(&result, |_| TestOutcome::Completed {
            run_id: None,
            sample_count: 0,
        });
        self.finish(test, outcome);
        result
    }

    async fn run_cycles(
        &self,
        params: &TestParameters,
        repetitions: u32,
        token: &CancellationToken,
    ) -> RigResult<u32> {
        self.controller.signal(ExternalSignal::Moving).await;
        self.controller
            .move_to(params.start_position, params.velocity, params.acceleration, token)
            .await?;

        let mut completed = 0;
        while completed < repetitions {
            for target in [params.end_position, params.start_position] {
                self.controller
                    .move_to(target, params.velocity, params.acceleration, token)
                    .await?;
            }
            completed += 1;
            debug!(completed, repetitions, "Speed cycle done");
        }
        self.controller.signal(ExternalSignal::Done).await;
        Ok(completed)
    }

    /// Bounded move back to zero at the home-return speed.
    ///
    /// An axis in `Alarm` is cleared and re-enabled first. Any failure raises
    /// the stopped signal. Refused without side effects while a test or
    /// another move owns the axis; holds the test slot until it returns.
    #[instrument(skip(self), err)]
    pub async fn reset_to_origin(&self) -> RigResult<()> {
        let Some(_slot) = self.tests.try_begin() else {
            warn!("Reset to origin refused: a test is in progress");
            return Err(RigError::TestInProgress);
        };
        if self.controller.is_move_active() {
            warn!("Reset to origin refused: a move is in progress");
            return Err(RigError::InvalidCommand(
                "a move is already in progress".to_string(),
            ));
        }

        match self.return_to_origin().await {
            Ok(()) => {
                self.controller.signal(ExternalSignal::Done).await;
                info!("Axis back at origin");
                Ok(())
            }
            Err(err) => {
                self.controller.signal(ExternalSignal::Stopped).await;
                Err(err)
            }
        }
    }

    async fn return_to_origin(&self) -> RigResult<()> {
        if self.controller.mode() == OperatingMode::Alarm {
            info!("Clearing axis alarm before returning to origin");
            self.controller.clear_alarm().await?;
            self.controller.enable_axis().await?;
        }

        let axis = self.controller.axis_config();
        let (id, token) = self.track();
        let homed = timeout(
            self.reset_timeout,
            self.controller.move_to(
                0.0,
                axis.home_return_speed,
                axis.home_return_acceleration,
                &token,
            ),
        )
        .await;
        self.untrack(id);

        match homed {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                if let Err(err) = self.controller.stop().await {
                    warn!(%err, "Halt after reset timeout failed");
                }
                Err(RigError::Timeout(self.reset_timeout))
            }
        }
    }
}
