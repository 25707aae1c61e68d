//! E-stop and link-health monitor.
//!
//! Runs on its own timer, independent of any move, and reads only the latch
//! and the peripheral count so a slow or stuck motion command can never mask
//! a trip. On detection it stops polling, latches [`SafetyState`], calls the
//! controller's unconditional `e_stop`, lights the tower red and broadcasts
//! [`RigEvent::EStopTriggered`].

use crate::config::SafetyConfig;
use crate::error::{RigError, RigResult};
use crate::events::{EventBus, RigEvent};
use crate::hardware::{MotionPort, SignalLight};
use crate::motion::MotionController;
use crate::safety::state::{SafetyState, TripReason};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One step of the reset sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    /// Clear the hardware latch and confirm it stays clear
    ClearLatch,
    /// Wait for the drive to settle
    Settle,
    /// Clear axis alarm status
    ClearAlarm,
    /// Re-energize the axis
    EnableAxis,
    /// Resume latch polling
    ResumePolling,
}

impl ResetStep {
    /// All steps in order.
    pub const SEQUENCE: [ResetStep; 5] = [
        ResetStep::ClearLatch,
        ResetStep::Settle,
        ResetStep::ClearAlarm,
        ResetStep::EnableAxis,
        ResetStep::ResumePolling,
    ];
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-interval safety poll loop.
pub struct SafetyMonitor {
    port: Arc<dyn MotionPort>,
    controller: Arc<MotionController>,
    state: Arc<SafetyState>,
    config: SafetyConfig,
    events: EventBus,
    task: Mutex<Option<PollTask>>,
}

impl SafetyMonitor {
    /// Monitor reading `port` and tripping `controller`.
    pub fn new(
        controller: Arc<MotionController>,
        state: Arc<SafetyState>,
        config: SafetyConfig,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            port: Arc::clone(controller.port()),
            controller,
            state,
            config,
            events,
            task: Mutex::new(None),
        })
    }

    /// Shared latch read by the controller.
    pub fn state(&self) -> &Arc<SafetyState> {
        &self.state
    }

    /// Whether the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start polling. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(monitor.poll_loop(cancel.clone()));
        *task = Some(PollTask { cancel, handle });
        info!(
            interval_ms = self.config.poll_interval_ms,
            "Safety monitor polling"
        );
    }

    /// Stop polling without tripping.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            debug!("Safety monitor stopped");
        }
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let verdict = self.check_once().await;
            self.state.mark_polled(Instant::now());
            if let Some(reason) = verdict {
                // stop polling before acting so the trip cannot re-enter
                self.engage(reason).await;
                return;
            }
        }
    }

    /// One poll: the trip reason, if any.
    pub async fn check_once(&self) -> Option<TripReason> {
        match self.port.get_latched_estop().await {
            Ok(true) => return Some(TripReason::EStopLatched),
            Ok(false) => {}
            Err(err) => {
                if self.config.trip_on_link_loss {
                    return Some(TripReason::LinkFault(err.to_string()));
                }
                warn!(%err, "E-stop latch read failed");
            }
        }

        if self.config.trip_on_link_loss {
            match self.port.online_slave_count().await {
                Ok(online) if online < self.config.required_peripherals => {
                    return Some(TripReason::LinkLost {
                        online,
                        required: self.config.required_peripherals,
                    });
                }
                Ok(_) => {}
                Err(err) => return Some(TripReason::LinkFault(err.to_string())),
            }
        }
        None
    }

    /// Operator-initiated E-stop through the same path as a detected trip.
    pub async fn trip(&self, reason: TripReason) {
        self.stop();
        self.engage(reason).await;
    }

    async fn engage(&self, reason: TripReason) {
        if !self.state.latch(reason.clone()) {
            debug!(%reason, "Safety already latched");
            return;
        }
        error!(%reason, "Safety trip: forcing safe state");

        if let Err(err) = self.controller.e_stop().await {
            error!(%err, "E-stop command reported an error");
        }
        if let Err(err) = self.controller.set_signal_light(SignalLight::Red).await {
            warn!(%err, "Safe-state indicator could not be set");
        }
        self.events.emit(RigEvent::EStopTriggered(reason));
    }

    /// Ordered reset: clear latch, settle, clear alarm, enable axis, resume polling.
    ///
    /// Any failing step aborts the reset; the rig stays in `EStopped`.
    #[instrument(skip(self), err)]
    pub async fn reset(self: &Arc<Self>) -> RigResult<()> {
        for step in ResetStep::SEQUENCE {
            debug!(?step, "Reset step");
            let result = match step {
                ResetStep::ClearLatch => self.clear_latch().await,
                ResetStep::Settle => {
                    sleep(self.config.reset_settle()).await;
                    Ok(())
                }
                ResetStep::ClearAlarm => self.port.clear_alarm().await,
                ResetStep::EnableAxis => self.port.axis_on().await,
                ResetStep::ResumePolling => {
                    self.state.clear();
                    self.controller.release_estop();
                    self.start();
                    Ok(())
                }
            };
            if let Err(err) = result {
                error!(?step, %err, "Safety reset aborted");
                return Err(err);
            }
        }

        if let Err(err) = self.controller.set_signal_light(SignalLight::Green).await {
            warn!(%err, "Ready indicator could not be set");
        }
        self.events.emit(RigEvent::SafetyReset);
        info!("Safety reset complete");
        Ok(())
    }

    async fn clear_latch(&self) -> RigResult<()> {
        self.port.clear_estop_latch().await?;
        if self.port.get_latched_estop().await? {
            return Err(RigError::SafetyTrip(
                "E-stop still engaged after clearing the latch".to_string(),
            ));
        }
        Ok(())
    }
}
