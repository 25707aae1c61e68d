//! Simulated motion card.
//!
//! Implements the full [`MotionPort`] surface in software so the rig can run
//! end to end without hardware. Kinematics are evaluated lazily against the
//! tokio clock, which lets tests drive whole moves under a paused runtime.
//!
//! Fault injection helpers (`press_estop`, `raise_alarm`, `set_online_slaves`,
//! `fail_next`) model the conditions the safety monitor and controller must
//! react to.

use crate::error::{RigError, RigResult};
use crate::hardware::port::{AxisStatus, EStopIo, HomingParams, MotionPort, ProfileMode};
use crate::motion::TrapezoidalProfile;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info};

/// Vendor code returned when a command is refused by the simulated card.
pub const REFUSED: i32 = 1;

#[derive(Debug, Clone, Copy)]
enum Motion {
    Trap {
        origin: f64,
        profile: TrapezoidalProfile,
        started: Instant,
        homing: bool,
    },
    Jog {
        origin: f64,
        velocity: f64,
        started: Instant,
    },
}

#[derive(Debug)]
struct SimState {
    initialized: bool,
    enabled: bool,
    profile: ProfileMode,
    target: i64,
    velocity: f64,
    acceleration: f64,
    jog_acceleration: f64,
    position: f64,
    motion: Option<Motion>,
    arrived: bool,
    alarm: bool,
    estop_pressed: bool,
    estop_latched: bool,
    estop_io: Option<EStopIo>,
    home_success: bool,
    outputs: HashMap<u16, bool>,
    inputs: HashMap<u16, bool>,
    slaves_online: u16,
    soft_limits: Option<(i64, i64)>,
    hard_limits: Option<u16>,
    fail_next: HashMap<&'static str, i32>,
    fail_initialize: bool,
    commits: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            initialized: false,
            enabled: false,
            profile: ProfileMode::Trapezoidal,
            target: 0,
            velocity: 0.0,
            acceleration: 0.0,
            jog_acceleration: 0.0,
            position: 0.0,
            motion: None,
            arrived: true,
            alarm: false,
            estop_pressed: false,
            estop_latched: false,
            estop_io: None,
            home_success: false,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
            slaves_online: 1,
            soft_limits: None,
            hard_limits: None,
            fail_next: HashMap::new(),
            fail_initialize: false,
            commits: 0,
        }
    }

    /// Position at `now`, settling any motion that has finished.
    fn advance(&mut self, now: Instant) -> f64 {
        match self.motion {
            Some(Motion::Trap {
                origin,
                profile,
                started,
                homing,
            }) => {
                let t = now.saturating_duration_since(started).as_secs_f64();
                if t >= profile.total_secs() {
                    self.motion = None;
                    if homing {
                        // The home switch position becomes the new zero
                        self.position = 0.0;
                        self.home_success = true;
                    } else {
                        self.position = origin + profile.distance();
                    }
                    self.arrived = true;
                } else {
                    self.position = origin + profile.position_at(t);
                }
            }
            Some(Motion::Jog {
                origin,
                velocity,
                started,
            }) => {
                let t = now.saturating_duration_since(started).as_secs_f64();
                self.position = origin + velocity * t;
            }
            None => {}
        }
        self.position
    }

    fn halt(&mut self, now: Instant) {
        self.advance(now);
        self.motion = None;
    }

    fn check(&mut self, operation: &'static str) -> RigResult<()> {
        match self.fail_next.remove(operation) {
            Some(code) => Err(RigError::command(operation, code)),
            None => Ok(()),
        }
    }

    fn status(&mut self, now: Instant) -> AxisStatus {
        self.advance(now);
        let mut status = AxisStatus::empty();
        status.set(AxisStatus::ESTOP, self.estop_latched);
        status.set(AxisStatus::IO_EMG_STOP, self.estop_pressed);
        status.set(AxisStatus::SV_ALARM, self.alarm);
        status.set(AxisStatus::ENABLE, self.enabled);
        status.set(AxisStatus::ARRIVE, self.arrived);
        status.set(AxisStatus::HOME_SUCCESS, self.home_success);
        match self.motion {
            Some(Motion::Trap { homing: true, .. }) => status.insert(AxisStatus::HOME_RUNNING),
            Some(_) => status.insert(AxisStatus::RUNNING),
            None => {}
        }
        status
    }
}

/// Software stand-in for the motion card.
#[derive(Debug)]
pub struct SimulatedPort {
    state: Mutex<SimState>,
}

impl Default for SimulatedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPort {
    /// A powered-off card with one online peripheral.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }

    /// Press the E-stop button: motion halts and the latch sets.
    pub fn press_estop(&self) {
        let mut state = self.state.lock();
        state.halt(Instant::now());
        state.estop_pressed = true;
        state.estop_latched = true;
        info!("Simulated E-stop pressed");
    }

    /// Release the E-stop button. The latch stays set until cleared.
    pub fn release_estop(&self) {
        self.state.lock().estop_pressed = false;
    }

    /// Raise a servo alarm: motion halts.
    pub fn raise_alarm(&self) {
        let mut state = self.state.lock();
        state.halt(Instant::now());
        state.alarm = true;
    }

    /// Set the number of online fieldbus peripherals.
    pub fn set_online_slaves(&self, count: u16) {
        self.state.lock().slaves_online = count;
    }

    /// Drive a digital input as seen by the card.
    pub fn set_input(&self, channel: u16, level: bool) {
        self.state.lock().inputs.insert(channel, level);
    }

    /// Current level of a digital output.
    pub fn output(&self, channel: u16) -> bool {
        self.state.lock().outputs.get(&channel).copied().unwrap_or(false)
    }

    /// Make the next call to `operation` fail with `code`.
    pub fn fail_next(&self, operation: &'static str, code: i32) {
        self.state.lock().fail_next.insert(operation, code);
    }

    /// Make `initialize` fail until cleared.
    pub fn fail_initialize(&self, fail: bool) {
        self.state.lock().fail_initialize = fail;
    }

    /// Whether the axis is energized.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Currently selected profile.
    pub fn profile(&self) -> ProfileMode {
        self.state.lock().profile
    }

    /// Last staged velocity (pulses/ms).
    pub fn staged_velocity(&self) -> f64 {
        self.state.lock().velocity
    }

    /// Whether any motion is in progress.
    pub fn is_moving(&self) -> bool {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.motion.is_some()
    }

    /// Number of accepted `commit` calls.
    pub fn commit_count(&self) -> u32 {
        self.state.lock().commits
    }

    /// E-stop wiring set by the controller, if any.
    pub fn estop_io(&self) -> Option<EStopIo> {
        self.state.lock().estop_io
    }

    /// Soft limits applied by the controller (positive, negative).
    pub fn soft_limits(&self) -> Option<(i64, i64)> {
        self.state.lock().soft_limits
    }

    /// Hardware limit input, when enabled.
    pub fn hard_limits(&self) -> Option<u16> {
        self.state.lock().hard_limits
    }
}

#[async_trait]
impl MotionPort for SimulatedPort {
    async fn initialize(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        if state.fail_initialize {
            return Err(RigError::HardwareInit(
                "simulated card did not answer".to_string(),
            ));
        }
        state.check("initialize")?;
        state.initialized = true;
        state.enabled = true;
        debug!("Simulated card initialized");
        Ok(())
    }

    async fn axis_on(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("axis_on")?;
        if state.estop_latched || state.alarm {
            return Err(RigError::command("axis_on", REFUSED));
        }
        state.enabled = true;
        Ok(())
    }

    async fn axis_off(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("axis_off")?;
        state.halt(Instant::now());
        state.enabled = false;
        Ok(())
    }

    async fn set_profile(&self, mode: ProfileMode) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_profile")?;
        state.halt(Instant::now());
        state.profile = mode;
        Ok(())
    }

    async fn set_target_position(&self, pulses: i64) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_target_position")?;
        state.target = pulses;
        Ok(())
    }

    async fn set_velocity(&self, pulses_per_ms: f64) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_velocity")?;
        state.velocity = pulses_per_ms;
        Ok(())
    }

    async fn set_acceleration(&self, pulses_per_ms2: f64) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_acceleration")?;
        state.acceleration = pulses_per_ms2;
        Ok(())
    }

    async fn set_jog_params(&self, acceleration: f64, _deceleration: f64) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_jog_params")?;
        state.jog_acceleration = acceleration;
        Ok(())
    }

    async fn commit(&self) -> RigResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("commit")?;
        if !state.enabled || state.estop_latched || state.alarm {
            return Err(RigError::command("commit", REFUSED));
        }

        let origin = state.advance(now);
        match state.profile {
            ProfileMode::Trapezoidal => {
                let distance = state.target as f64 - origin;
                // card units are per millisecond
                let profile = TrapezoidalProfile::plan(
                    distance,
                    state.velocity * 1_000.0,
                    state.acceleration * 1_000_000.0,
                );
                state.arrived = false;
                state.motion = Some(Motion::Trap {
                    origin,
                    profile,
                    started: now,
                    homing: false,
                });
            }
            ProfileMode::Jog => {
                state.arrived = false;
                state.motion = Some(Motion::Jog {
                    origin,
                    velocity: state.velocity * 1_000.0,
                    started: now,
                });
            }
            ProfileMode::Handwheel => {}
        }
        state.commits += 1;
        Ok(())
    }

    async fn get_status_bits(&self) -> RigResult<AxisStatus> {
        let mut state = self.state.lock();
        state.check("get_status_bits")?;
        Ok(state.status(Instant::now()))
    }

    async fn get_profiled_position(&self) -> RigResult<f64> {
        let mut state = self.state.lock();
        state.check("get_profiled_position")?;
        Ok(state.advance(Instant::now()))
    }

    async fn stop(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("stop")?;
        state.halt(Instant::now());
        Ok(())
    }

    async fn emergency_stop(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("emergency_stop")?;
        state.halt(Instant::now());
        Ok(())
    }

    async fn set_digital_output(&self, channel: u16, level: bool) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_digital_output")?;
        state.outputs.insert(channel, level);
        Ok(())
    }

    async fn get_digital_input(&self, channel: u16) -> RigResult<bool> {
        let mut state = self.state.lock();
        state.check("get_digital_input")?;
        Ok(state.inputs.get(&channel).copied().unwrap_or(false))
    }

    async fn set_estop_io(&self, io: EStopIo) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_estop_io")?;
        state.estop_io = Some(io);
        Ok(())
    }

    async fn get_latched_estop(&self) -> RigResult<bool> {
        let mut state = self.state.lock();
        state.check("get_latched_estop")?;
        Ok(state.estop_latched)
    }

    async fn clear_estop_latch(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("clear_estop_latch")?;
        // a held button re-latches immediately
        state.estop_latched = state.estop_pressed;
        Ok(())
    }

    async fn clear_alarm(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("clear_alarm")?;
        state.alarm = false;
        Ok(())
    }

    async fn online_slave_count(&self) -> RigResult<u16> {
        let mut state = self.state.lock();
        state.check("online_slave_count")?;
        Ok(state.slaves_online)
    }

    async fn set_origin(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_origin")?;
        state.halt(Instant::now());
        state.position = 0.0;
        Ok(())
    }

    async fn home_start(&self, params: &HomingParams) -> RigResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("home_start")?;
        if !state.enabled || state.estop_latched || state.alarm {
            return Err(RigError::command("home_start", REFUSED));
        }
        let origin = state.advance(now);
        let profile = TrapezoidalProfile::plan(
            params.offset as f64 - origin,
            params.rapid_velocity * 1_000.0,
            params.acceleration * 1_000_000.0,
        );
        state.home_success = false;
        state.arrived = false;
        state.motion = Some(Motion::Trap {
            origin,
            profile,
            started: now,
            homing: true,
        });
        Ok(())
    }

    async fn home_stop(&self) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("home_stop")?;
        state.halt(Instant::now());
        Ok(())
    }

    async fn set_soft_limits(&self, positive: i64, negative: i64) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_soft_limits")?;
        state.soft_limits = Some((positive, negative));
        Ok(())
    }

    async fn set_hard_limits(&self, enabled: bool, io: u16) -> RigResult<()> {
        let mut state = self.state.lock();
        state.check("set_hard_limits")?;
        state.hard_limits = enabled.then_some(io);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn staged_move(port: &SimulatedPort, target: i64) {
        port.set_profile(ProfileMode::Trapezoidal).await.unwrap();
        port.set_target_position(target).await.unwrap();
        port.set_velocity(10.0).await.unwrap(); // 10_000 pulses/s
        port.set_acceleration(0.1).await.unwrap(); // 100_000 pulses/s^2
        port.commit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trapezoidal_move_arrives() {
        let port = SimulatedPort::new();
        port.initialize().await.unwrap();
        staged_move(&port, 5_000).await;

        let status = port.get_status_bits().await.unwrap();
        assert!(status.contains(AxisStatus::RUNNING));
        assert!(!status.contains(AxisStatus::ARRIVE));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = port.get_status_bits().await.unwrap();
        assert!(status.contains(AxisStatus::ARRIVE));
        assert_eq!(port.get_profiled_position().await.unwrap(), 5_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn estop_freezes_motion_and_latches() {
        let port = SimulatedPort::new();
        port.initialize().await.unwrap();
        staged_move(&port, 50_000).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        port.press_estop();
        let frozen = port.get_profiled_position().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(port.get_profiled_position().await.unwrap(), frozen);
        assert!(port.get_latched_estop().await.unwrap());
        assert!(port.commit().await.is_err());

        // held button keeps the latch
        port.clear_estop_latch().await.unwrap();
        assert!(port.get_latched_estop().await.unwrap());
        port.release_estop();
        port.clear_estop_latch().await.unwrap();
        assert!(!port.get_latched_estop().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn jog_runs_until_stopped() {
        let port = SimulatedPort::new();
        port.initialize().await.unwrap();
        port.set_profile(ProfileMode::Jog).await.unwrap();
        port.set_velocity(-2.0).await.unwrap();
        port.commit().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        port.stop().await.unwrap();
        assert_eq!(port.get_profiled_position().await.unwrap(), -1_000.0);
        assert!(!port.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn homing_sets_zero_and_success() {
        let port = SimulatedPort::new();
        port.initialize().await.unwrap();
        staged_move(&port, 2_000).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let params = HomingParams {
            direction: -1,
            rapid_velocity: 10.0,
            locate_velocity: 1.0,
            acceleration: 0.1,
            offset: 0,
        };
        port.home_start(&params).await.unwrap();
        assert!(port
            .home_status()
            .await
            .unwrap()
            .contains(AxisStatus::HOME_RUNNING));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let home = port.home_status().await.unwrap();
        assert!(home.contains(AxisStatus::HOME_SUCCESS));
        assert!(!home.contains(AxisStatus::HOME_RUNNING));
        assert_eq!(port.get_profiled_position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let port = SimulatedPort::new();
        port.fail_next("set_velocity", -7);
        match port.set_velocity(1.0).await {
            Err(RigError::Command { operation, code }) => {
                assert_eq!(operation, "set_velocity");
                assert_eq!(code, -7);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(port.set_velocity(1.0).await.is_ok());
    }
}
