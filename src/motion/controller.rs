//! Mode-arbitrated motion controller.
//!
//! `MotionController` is the only component that commands the axis. Every
//! request passes the operating-mode gate first:
//!
//! - automatic moves are cancellable futures polling the card's arrival bit
//! - manual modes (jog, handwheel, joystick) own the axis exclusively
//! - `e_stop` bypasses the gate, cancels whatever is in flight and leaves the
//!   axis de-energized in `EStopped` until the safety reset releases it
//!
//! Position and velocity arguments are in physical units (units, units/s,
//! units/s^2); conversion to card pulses happens here and nowhere else.

use crate::config::{AxisConfig, MotionConfig, RigConfig};
use crate::error::{RigError, RigResult};
use crate::hardware::{AxisStatus, EStopIo, HomingParams, MotionPort, ProfileMode, SignalLight};
use crate::motion::joystick::{self, JoystickSettings};
use crate::motion::mode::{ModeArbiter, ModeChange, OperatingMode};
use crate::motion::profile::TrapezoidalProfile;
use crate::safety::SafetyState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A single absolute move request. Consumed by [`MotionController::execute`].
#[derive(Debug, Clone)]
pub struct MotionCommand {
    /// Target position (units)
    pub target: f64,
    /// Velocity limit (units/s)
    pub max_velocity: f64,
    /// Acceleration and deceleration (units/s^2)
    pub acceleration: f64,
    /// Parent token; the move runs under a child of it
    pub cancel: Option<CancellationToken>,
}

/// A [`MotionCommand`] in card units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseCommand {
    /// Target (pulses)
    pub target: i64,
    /// Velocity (pulses/ms)
    pub velocity: f64,
    /// Acceleration (pulses/ms^2)
    pub acceleration: f64,
}

impl MotionCommand {
    /// Move without an external cancellation handle.
    pub fn new(target: f64, max_velocity: f64, acceleration: f64) -> Self {
        Self {
            target,
            max_velocity,
            acceleration,
            cancel: None,
        }
    }

    /// Attach a parent cancellation token.
    pub fn with_cancel(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    /// Reject non-finite positions and non-positive limits.
    pub fn validate(&self) -> RigResult<()> {
        if !self.target.is_finite() {
            return Err(RigError::InvalidCommand(format!(
                "target {} is not a finite position",
                self.target
            )));
        }
        if !(self.max_velocity.is_finite() && self.max_velocity > 0.0) {
            return Err(RigError::InvalidCommand(format!(
                "velocity {} must be positive",
                self.max_velocity
            )));
        }
        if !(self.acceleration.is_finite() && self.acceleration > 0.0) {
            return Err(RigError::InvalidCommand(format!(
                "acceleration {} must be positive",
                self.acceleration
            )));
        }
        Ok(())
    }

    /// Scale into card units.
    pub fn to_pulses(&self, pulses_per_unit: f64) -> PulseCommand {
        PulseCommand {
            target: (self.target * pulses_per_unit).round() as i64,
            velocity: self.max_velocity * pulses_per_unit / 1_000.0,
            acceleration: self.acceleration * pulses_per_unit / 1_000_000.0,
        }
    }
}

/// Jog direction while a jog button is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Towards positive positions
    Positive,
    /// Towards negative positions
    Negative,
}

impl JogDirection {
    fn sign(self) -> f64 {
        match self {
            JogDirection::Positive => 1.0,
            JogDirection::Negative => -1.0,
        }
    }
}

/// State announced to the operator through the signal tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSignal {
    /// Stopped or faulted: red
    Stopped,
    /// Moving: yellow
    Moving,
    /// Finished and ready: green
    Done,
}

impl From<ExternalSignal> for SignalLight {
    fn from(signal: ExternalSignal) -> Self {
        match signal {
            ExternalSignal::Stopped => SignalLight::Red,
            ExternalSignal::Moving => SignalLight::Yellow,
            ExternalSignal::Done => SignalLight::Green,
        }
    }
}

struct ActiveMove {
    id: u64,
    token: CancellationToken,
}

struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct ControllerState {
    arbiter: ModeArbiter,
    active_move: Option<ActiveMove>,
    next_move_id: u64,
    joystick: Option<BackgroundTask>,
    homing: Option<BackgroundTask>,
    last_position: f64,
}

impl ControllerState {
    fn cancel_active_move(&mut self) {
        if let Some(active) = &self.active_move {
            active.token.cancel();
        }
    }
}

/// Releases the automatic-move claim when the move future finishes or is dropped.
struct MoveClaim<'a> {
    state: &'a Mutex<ControllerState>,
    id: u64,
}

impl Drop for MoveClaim<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.active_move.as_ref().map(|m| m.id) == Some(self.id) {
            state.active_move = None;
            state.arbiter.end_move();
        }
    }
}

/// Sole gatekeeper of the motion port.
pub struct MotionController {
    port: Arc<dyn MotionPort>,
    safety: Arc<SafetyState>,
    axis: AxisConfig,
    motion: MotionConfig,
    estop_io: Option<EStopIo>,
    state: Arc<Mutex<ControllerState>>,
}

impl MotionController {
    /// Controller over `port`, refusing motion while `safety` is latched.
    pub fn new(port: Arc<dyn MotionPort>, safety: Arc<SafetyState>, config: &RigConfig) -> Self {
        let estop_io = config.axis.estop_enabled.then(|| EStopIo {
            card: config.safety.estop_card,
            io: config.safety.estop_io,
            sense: config.safety.estop_sense,
            debounce_ms: config.safety.estop_debounce_ms,
        });

        Self {
            port,
            safety,
            axis: config.axis.clone(),
            motion: config.motion.clone(),
            estop_io,
            state: Arc::new(Mutex::new(ControllerState {
                arbiter: ModeArbiter::default(),
                active_move: None,
                next_move_id: 0,
                joystick: None,
                homing: None,
                last_position: 0.0,
            })),
        }
    }

    /// The port this controller drives.
    pub fn port(&self) -> &Arc<dyn MotionPort> {
        &self.port
    }

    /// Axis configuration in use.
    pub fn axis_config(&self) -> &AxisConfig {
        &self.axis
    }

    /// Current operating mode.
    pub fn mode(&self) -> OperatingMode {
        self.state.lock().arbiter.mode()
    }

    /// Whether an automatic move currently holds the axis.
    pub fn is_move_active(&self) -> bool {
        self.state.lock().arbiter.move_active()
    }

    /// Last successfully read position (units).
    pub fn last_position(&self) -> f64 {
        self.state.lock().last_position
    }

    /// Bring the card up, arm the E-stop input and apply the configured limits.
    ///
    /// A failure leaves the controller usable in a disabled state; the caller
    /// decides whether to continue.
    #[instrument(skip(self), fields(axis = self.axis.axis_number), err)]
    pub async fn initialize(&self) -> RigResult<()> {
        self.port.initialize().await.map_err(|err| match err {
            RigError::HardwareInit(_) => err,
            other => RigError::HardwareInit(other.to_string()),
        })?;

        if let Some(io) = self.estop_io {
            self.port.set_estop_io(io).await?;
            debug!(card = io.card, io = io.io, "E-stop input armed");
        }
        self.apply_limits().await?;

        let position = self.get_current_position().await;
        info!(position, "Motion controller initialized");
        Ok(())
    }

    /// Apply soft and hardware limits from the axis configuration.
    pub async fn apply_limits(&self) -> RigResult<()> {
        let (positive, negative) = if self.axis.hard_limit_enabled {
            (self.axis.soft_limit_max, self.axis.soft_limit_min)
        } else {
            (i64::from(i32::MAX), i64::from(i32::MIN))
        };
        self.port.set_soft_limits(positive, negative).await?;
        self.port
            .set_hard_limits(self.axis.hard_limit_enabled, self.axis.hard_limit_io)
            .await?;
        debug!(positive, negative, "Axis limits applied");
        Ok(())
    }

    /// Absolute move to `position`, cancellable through `cancel`.
    ///
    /// Cancelling stops the completion poll only; it does not halt the axis.
    pub async fn move_to(
        &self,
        position: f64,
        max_velocity: f64,
        acceleration: f64,
        cancel: &CancellationToken,
    ) -> RigResult<()> {
        self.execute(MotionCommand::new(position, max_velocity, acceleration).with_cancel(cancel))
            .await
    }

    /// Run a [`MotionCommand`] to arrival, cancellation or failure.
    #[instrument(skip(self, command), fields(axis = self.axis.axis_number, target = command.target))]
    pub async fn execute(&self, command: MotionCommand) -> RigResult<()> {
        command.validate()?;
        if let Err(err) = self.safety.ensure_clear() {
            warn!(%err, "Move refused");
            return Err(err);
        }

        let (id, token) = {
            let mut state = self.state.lock();
            if let Err(err) = state.arbiter.begin_move() {
                warn!(%err, "Move refused");
                return Err(err);
            }
            if state.active_move.is_some() {
                debug!("Superseding the move in flight");
                state.cancel_active_move();
            }
            let token = command
                .cancel
                .as_ref()
                .map_or_else(CancellationToken::new, CancellationToken::child_token);
            state.next_move_id += 1;
            let id = state.next_move_id;
            state.active_move = Some(ActiveMove {
                id,
                token: token.clone(),
            });
            (id, token)
        };
        let _claim = MoveClaim {
            state: self.state.as_ref(),
            id,
        };

        if token.is_cancelled() {
            debug!("Move cancelled before start");
            return Err(RigError::OperationCancelled);
        }

        let pulses = command.to_pulses(self.axis.pulses_per_unit);
        let profile = TrapezoidalProfile::plan(
            command.target - self.last_position(),
            command.max_velocity,
            command.acceleration,
        );
        debug!(
            pulses = pulses.target,
            expected_secs = profile.total_secs(),
            peak_velocity = profile.peak_velocity(),
            "Move planned"
        );

        match self.issue_trapezoidal(&pulses, id, &token).await {
            Ok(()) => {}
            Err(RigError::OperationCancelled) => {
                debug!("Move cancelled during setup");
                return Err(RigError::OperationCancelled);
            }
            Err(err) => {
                error!(%err, "Move aborted");
                return Err(err);
            }
        }

        self.await_arrival(&token).await
    }

    /// Stage and commit move `id`. A cancel that lands while staging leaves
    /// the axis uncommitted; one that lands during `commit` halts it again,
    /// unless a newer move has already taken over the axis.
    async fn issue_trapezoidal(
        &self,
        pulses: &PulseCommand,
        id: u64,
        token: &CancellationToken,
    ) -> RigResult<()> {
        self.port.set_profile(ProfileMode::Trapezoidal).await?;
        self.port.set_acceleration(pulses.acceleration).await?;
        self.port.set_velocity(pulses.velocity).await?;
        self.port.set_target_position(pulses.target).await?;

        if token.is_cancelled() {
            return Err(RigError::OperationCancelled);
        }
        let committed = self.port.commit().await;
        if let Err(err) = committed {
            // an E-stop that lands mid-commit de-energizes the axis first
            return Err(if token.is_cancelled() {
                RigError::OperationCancelled
            } else {
                err
            });
        }
        if token.is_cancelled() {
            let superseded = self
                .state
                .lock()
                .active_move
                .as_ref()
                .is_some_and(|active| active.id != id);
            if superseded {
                return Err(RigError::OperationCancelled);
            }
            if let Err(err) = self.port.stop().await {
                error!(%err, "Halt after a cancelled commit failed");
            }
            return Err(RigError::OperationCancelled);
        }
        Ok(())
    }

    async fn await_arrival(&self, token: &CancellationToken) -> RigResult<()> {
        let mut ticker = interval(self.motion.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Move cancelled");
                    return Err(RigError::OperationCancelled);
                }
                _ = ticker.tick() => {}
            }

            match self.port.get_status_bits().await {
                Ok(status) if status.has_fault() => {
                    self.enter_alarm(status);
                    return Err(RigError::AxisAlarm("move_to"));
                }
                Ok(status) if status.contains(AxisStatus::ARRIVE) => {
                    let position = self.get_current_position().await;
                    debug!(position, "Move arrived");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "Status poll failed during move"),
            }
        }
    }

    /// Decelerate to a halt and cancel any in-flight move.
    ///
    /// Refused while a manual mode owns the axis.
    pub async fn stop(&self) -> RigResult<()> {
        let homing = {
            let mut state = self.state.lock();
            let mode = state.arbiter.mode();
            if mode.is_manual() {
                warn!(%mode, "Stop ignored: axis owned by a manual mode");
                return Err(RigError::ModeConflict {
                    requested: OperatingMode::Automatic,
                    active: mode,
                });
            }
            state.cancel_active_move();
            if mode == OperatingMode::Homing {
                state.arbiter.leave(OperatingMode::Homing);
                if let Some(task) = state.homing.take() {
                    task.stop();
                }
                true
            } else {
                false
            }
        };

        let result = if homing {
            self.port.home_stop().await
        } else {
            self.port.stop().await
        };
        match &result {
            Ok(()) => info!(homing, "Axis stopped"),
            Err(err) => error!(%err, "Stop command failed"),
        }
        result
    }

    /// Halt abruptly and de-energize the axis, whatever the mode.
    ///
    /// Leaves the controller in `EStopped` until [`MotionController::release_estop`].
    pub async fn e_stop(&self) -> RigResult<()> {
        let (joystick, homing) = {
            let mut state = self.state.lock();
            state.cancel_active_move();
            state.arbiter.estop();
            (state.joystick.take(), state.homing.take())
        };
        for task in [joystick, homing].into_iter().flatten() {
            task.stop();
        }

        let halted = self.port.emergency_stop().await;
        let disabled = self.port.axis_off().await;
        warn!("Emergency stop: axis halted and de-energized");

        for err in [&halted, &disabled].into_iter().filter_map(|r| r.as_ref().err()) {
            error!(%err, "Emergency stop command failed");
        }
        halted.and(disabled)
    }

    /// Leave `EStopped`; called by the safety reset once the axis is re-enabled.
    pub(crate) fn release_estop(&self) -> ModeChange {
        let change = self.state.lock().arbiter.release_estop();
        if change == ModeChange::Changed {
            info!("E-stop released, back to automatic");
        }
        change
    }

    fn enter_alarm(&self, status: AxisStatus) {
        let mut state = self.state.lock();
        if state.arbiter.alarm() == ModeChange::Changed {
            state.cancel_active_move();
            if let Some(task) = state.joystick.take() {
                task.stop();
            }
            warn!(?status, "Axis alarm");
        }
    }

    /// Clear the card's alarm status and return from `Alarm` to `Automatic`.
    pub async fn clear_alarm(&self) -> RigResult<()> {
        self.port.clear_alarm().await?;
        if self.state.lock().arbiter.leave(OperatingMode::Alarm) == ModeChange::Changed {
            info!("Axis alarm cleared");
        }
        Ok(())
    }

    /// Energize the axis.
    pub async fn enable_axis(&self) -> RigResult<()> {
        self.port.axis_on().await
    }

    fn claim(&self, mode: OperatingMode) -> RigResult<ModeChange> {
        let result = self.state.lock().arbiter.enter(mode);
        if let Err(err) = &result {
            warn!(%err, "Mode change refused");
        }
        result
    }

    fn settle_claim(&self, mode: OperatingMode, result: RigResult<()>) -> RigResult<ModeChange> {
        match result {
            Ok(()) => {
                info!(%mode, "Entered manual mode");
                Ok(ModeChange::Changed)
            }
            Err(err) => {
                self.state.lock().arbiter.leave(mode);
                error!(%err, %mode, "Could not enter mode");
                Err(err)
            }
        }
    }

    fn jog_velocity_pulses(&self) -> f64 {
        self.motion.jog_velocity * self.axis.pulses_per_unit / 1_000.0
    }

    fn jog_acceleration_pulses(&self) -> f64 {
        self.motion.jog_acceleration * self.axis.pulses_per_unit / 1_000_000.0
    }

    async fn prepare_jog(&self) -> RigResult<()> {
        self.port.axis_on().await?;
        self.port.set_profile(ProfileMode::Jog).await?;
        let acceleration = self.jog_acceleration_pulses();
        self.port.set_jog_params(acceleration, acceleration).await
    }

    async fn restore_trapezoidal(&self, halt: bool) -> RigResult<()> {
        let halted = if halt { self.port.stop().await } else { Ok(()) };
        let profile = self.port.set_profile(ProfileMode::Trapezoidal).await;
        halted.and(profile)
    }

    fn leave_manual(&self, mode: OperatingMode, result: RigResult<()>) -> RigResult<ModeChange> {
        self.state.lock().arbiter.leave(mode);
        match result {
            Ok(()) => {
                info!(%mode, "Left manual mode");
                Ok(ModeChange::Changed)
            }
            Err(err) => {
                error!(%err, %mode, "Leaving mode did not complete cleanly");
                Err(err)
            }
        }
    }

    /// Couple the axis to the handwheel.
    pub async fn start_handwheel(&self) -> RigResult<ModeChange> {
        if self.claim(OperatingMode::Handwheel)? == ModeChange::Unchanged {
            return Ok(ModeChange::Unchanged);
        }
        let result = async {
            self.port.axis_on().await?;
            self.port.set_profile(ProfileMode::Handwheel).await
        }
        .await;
        self.settle_claim(OperatingMode::Handwheel, result)
    }

    /// Release the handwheel and return to automatic.
    pub async fn end_handwheel(&self) -> RigResult<ModeChange> {
        if self.mode() != OperatingMode::Handwheel {
            return Ok(ModeChange::Unchanged);
        }
        let result = self.restore_trapezoidal(false).await;
        self.leave_manual(OperatingMode::Handwheel, result)
    }

    /// Jog in `direction` until [`MotionController::end_jog`].
    pub async fn start_jog(&self, direction: JogDirection) -> RigResult<ModeChange> {
        if self.claim(OperatingMode::Jogging)? == ModeChange::Unchanged {
            return Ok(ModeChange::Unchanged);
        }
        let velocity = direction.sign() * self.jog_velocity_pulses();
        let result = async {
            self.prepare_jog().await?;
            self.port.set_velocity(velocity).await?;
            self.port.commit().await
        }
        .await;
        self.settle_claim(OperatingMode::Jogging, result)
    }

    /// Stop jogging and return to automatic.
    pub async fn end_jog(&self) -> RigResult<ModeChange> {
        if self.mode() != OperatingMode::Jogging {
            return Ok(ModeChange::Unchanged);
        }
        let result = self.restore_trapezoidal(true).await;
        self.leave_manual(OperatingMode::Jogging, result)
    }

    /// Hand the axis to the joystick inputs.
    pub async fn start_joystick(&self) -> RigResult<ModeChange> {
        if self.claim(OperatingMode::Joystick)? == ModeChange::Unchanged {
            return Ok(ModeChange::Unchanged);
        }
        if let Err(err) = self.prepare_jog().await {
            return self.settle_claim(OperatingMode::Joystick, Err(err));
        }

        let settings = JoystickSettings {
            positive_input: self.motion.joystick_positive_input,
            negative_input: self.motion.joystick_negative_input,
            velocity: self.jog_velocity_pulses(),
            poll: self.motion.joystick_poll(),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(joystick::run(
            Arc::clone(&self.port),
            settings,
            cancel.clone(),
        ));

        let mut state = self.state.lock();
        if state.arbiter.mode() != OperatingMode::Joystick {
            // an E-stop landed while the loop was starting
            cancel.cancel();
            handle.abort();
            return Err(RigError::ModeConflict {
                requested: OperatingMode::Joystick,
                active: state.arbiter.mode(),
            });
        }
        if let Some(previous) = state.joystick.replace(BackgroundTask { cancel, handle }) {
            previous.stop();
        }
        info!("Entered manual mode joystick");
        Ok(ModeChange::Changed)
    }

    /// Stop the joystick loop and return to automatic.
    pub async fn end_joystick(&self) -> RigResult<ModeChange> {
        let task = {
            let mut state = self.state.lock();
            if state.arbiter.mode() != OperatingMode::Joystick {
                return Ok(ModeChange::Unchanged);
            }
            state.joystick.take()
        };
        if let Some(task) = task {
            task.stop();
        }
        let result = self.restore_trapezoidal(true).await;
        self.leave_manual(OperatingMode::Joystick, result)
    }

    /// Profiled position in units, or the last known value if the read fails.
    pub async fn get_current_position(&self) -> f64 {
        match self.port.get_profiled_position().await {
            Ok(pulses) => {
                let position = pulses / self.axis.pulses_per_unit;
                self.state.lock().last_position = position;
                position
            }
            Err(err) => {
                let last = self.last_position();
                warn!(%err, last, "Position read failed, reporting last known position");
                last
            }
        }
    }

    /// Start the card's homing sequence.
    ///
    /// The controller stays in `Homing` until the card reports the sequence
    /// finished. On failure the mode is left unchanged and the error returned.
    pub async fn home_axis(&self) -> RigResult<()> {
        if self.claim(OperatingMode::Homing)? == ModeChange::Unchanged {
            return Ok(());
        }

        let params = HomingParams::from(&self.axis);
        if let Err(err) = self.port.home_start(&params).await {
            self.state.lock().arbiter.leave(OperatingMode::Homing);
            error!(%err, "Homing could not start");
            return Err(err);
        }
        info!(direction = params.direction, "Homing started");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_homing(
            Arc::clone(&self.port),
            Arc::clone(&self.state),
            self.motion.poll_interval(),
            cancel.clone(),
        ));
        if let Some(previous) = self
            .state
            .lock()
            .homing
            .replace(BackgroundTask { cancel, handle })
        {
            previous.stop();
        }
        Ok(())
    }

    /// Declare the current position as zero.
    pub async fn set_origin(&self) -> RigResult<()> {
        {
            let state = self.state.lock();
            if !state.arbiter.is_idle() {
                return Err(RigError::ModeConflict {
                    requested: OperatingMode::Automatic,
                    active: state.arbiter.mode(),
                });
            }
        }
        self.port.set_origin().await?;
        self.state.lock().last_position = 0.0;
        info!("Origin set at current position");
        Ok(())
    }

    /// Read the status word, entering `Alarm` if it reports a drive fault.
    pub async fn axis_status(&self) -> RigResult<AxisStatus> {
        let status = self.port.get_status_bits().await?;
        if status.has_fault() {
            self.enter_alarm(status);
        }
        Ok(status)
    }

    /// Operator-facing axis status.
    pub async fn status_text(&self) -> String {
        match self.port.get_status_bits().await {
            Ok(status) => status.describe().to_string(),
            Err(err) => {
                warn!(%err, "Status read failed");
                "Unknown".to_string()
            }
        }
    }

    /// Whether the card reports the commanded position reached.
    pub async fn is_movement_done(&self) -> bool {
        match self.port.get_status_bits().await {
            Ok(status) => {
                status.contains(AxisStatus::ARRIVE) && !status.contains(AxisStatus::RUNNING)
            }
            Err(err) => {
                warn!(%err, "Status read failed");
                false
            }
        }
    }

    /// Drive the signal tower.
    pub async fn set_signal_light(&self, light: SignalLight) -> RigResult<()> {
        for (channel, level) in SignalLight::CHANNELS.into_iter().zip(light.levels()) {
            if let Err(err) = self.port.set_digital_output(channel, level).await {
                warn!(%err, channel, ?light, "Signal light update failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Announce a state on the signal tower. Failures are logged only.
    pub async fn signal(&self, signal: ExternalSignal) {
        let _ = self.set_signal_light(signal.into()).await;
    }
}

async fn watch_homing(
    port: Arc<dyn MotionPort>,
    state: Arc<Mutex<ControllerState>>,
    poll: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let succeeded = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match port.home_status().await {
            Ok(status) if !status.contains(AxisStatus::HOME_RUNNING) => {
                break status.contains(AxisStatus::HOME_SUCCESS);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "Homing status poll failed"),
        }
    };

    let mut state = state.lock();
    if state.arbiter.leave(OperatingMode::Homing) == ModeChange::Changed {
        state.homing = None;
        state.last_position = 0.0;
        if succeeded {
            info!("Homing completed");
        } else {
            warn!("Homing finished without finding home");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_scales_to_card_units() {
        let pulses = MotionCommand::new(100.0, 50.0, 10.0).to_pulses(1000.0);
        assert_eq!(pulses.target, 100_000);
        assert_eq!(pulses.velocity, 50.0);
        assert_eq!(pulses.acceleration, 0.01);
    }

    #[test]
    fn command_rejects_bad_limits() {
        assert!(MotionCommand::new(1.0, 0.0, 1.0).validate().is_err());
        assert!(MotionCommand::new(1.0, 1.0, -1.0).validate().is_err());
        assert!(MotionCommand::new(f64::NAN, 1.0, 1.0).validate().is_err());
        assert!(MotionCommand::new(-5.0, 1.0, 1.0).validate().is_ok());
    }

    #[test]
    fn signals_map_to_lamps() {
        assert_eq!(SignalLight::from(ExternalSignal::Stopped), SignalLight::Red);
        assert_eq!(SignalLight::from(ExternalSignal::Moving), SignalLight::Yellow);
        assert_eq!(SignalLight::from(ExternalSignal::Done), SignalLight::Green);
    }
}
