//! Motion port capability
//!
//! `MotionPort` is the register-level surface of a single-axis motion card:
//! enable, trapezoidal and jog profiles, status polling, homing, digital I/O
//! and the latched E-stop input. The controller is the only component that
//! issues motion commands through it; the safety monitor only reads the latch
//! and link-health signals.
//!
//! # Contract
//! - Positions are in controller pulses, velocities in pulses/ms and
//!   accelerations in pulses/ms^2 (the card's native units)
//! - Profile parameters are staged by the setters and take effect on `commit`
//! - Every call that reaches hardware returns `RigError::Command` with the
//!   vendor code when the card rejects it
//!
//! # Thread Safety
//! - All methods take `&self`; implementations use interior mutability
//! - Calls are short register operations and never wait on motion

use crate::config::{AxisConfig, EStopSense};
use crate::error::RigResult;
use async_trait::async_trait;
use bitflags::bitflags;

bitflags! {
    /// Axis status word as reported by the card.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AxisStatus: u32 {
        /// Latched emergency stop
        const ESTOP = 0x0001;
        /// Servo drive alarm
        const SV_ALARM = 0x0002;
        /// Positive soft limit reached
        const POS_SOFT_LIMIT = 0x0004;
        /// Negative soft limit reached
        const NEG_SOFT_LIMIT = 0x0008;
        /// Following error exceeded
        const FOLLOW_ERR = 0x0010;
        /// Positive hardware limit switch
        const POS_HARD_LIMIT = 0x0020;
        /// Negative hardware limit switch
        const NEG_HARD_LIMIT = 0x0040;
        /// Smooth-stop input active
        const IO_SMS_STOP = 0x0080;
        /// Emergency-stop input active
        const IO_EMG_STOP = 0x0100;
        /// Axis enabled
        const ENABLE = 0x0200;
        /// Profile generator running
        const RUNNING = 0x0400;
        /// Commanded position reached
        const ARRIVE = 0x0800;
        /// Homing sequence running
        const HOME_RUNNING = 0x1000;
        /// Last homing sequence succeeded
        const HOME_SUCCESS = 0x2000;
        /// Home switch active
        const HOME_SWITCH = 0x4000;
    }
}

impl AxisStatus {
    /// Any fault that requires `clear_alarm` before motion resumes.
    pub fn has_fault(self) -> bool {
        self.intersects(AxisStatus::SV_ALARM | AxisStatus::FOLLOW_ERR)
    }

    /// Operator-facing summary, most severe condition first.
    pub fn describe(self) -> &'static str {
        if self.contains(AxisStatus::ESTOP) {
            "Emergency stop"
        } else if self.contains(AxisStatus::SV_ALARM) {
            "Alarm"
        } else if self.contains(AxisStatus::RUNNING) {
            "Running"
        } else if self.contains(AxisStatus::HOME_RUNNING) {
            "Homing"
        } else if self.contains(AxisStatus::ENABLE) {
            "Enabled"
        } else {
            "Disabled"
        }
    }
}

/// Motion profile selected on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    /// Point-to-point trapezoidal positioning
    Trapezoidal,
    /// Continuous velocity motion
    Jog,
    /// Position follows the handwheel encoder
    Handwheel,
}

/// Wiring of the hardware E-stop input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EStopIo {
    /// Card carrying the input
    pub card: u16,
    /// Input index
    pub io: u16,
    /// Input polarity
    pub sense: EStopSense,
    /// Input filter in milliseconds
    pub debounce_ms: u32,
}

/// Parameters of the card's homing sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingParams {
    /// Search direction: 1 positive, -1 negative
    pub direction: i8,
    /// Search velocity (pulses/ms)
    pub rapid_velocity: f64,
    /// Locate velocity after the switch edge (pulses/ms)
    pub locate_velocity: f64,
    /// Acceleration (pulses/ms^2)
    pub acceleration: f64,
    /// Offset applied after the switch is found (pulses)
    pub offset: i64,
}

impl From<&AxisConfig> for HomingParams {
    fn from(axis: &AxisConfig) -> Self {
        Self {
            direction: axis.home_direction,
            rapid_velocity: axis.home_rapid_velocity,
            locate_velocity: axis.home_locate_velocity,
            acceleration: axis.home_acceleration,
            offset: axis.home_offset,
        }
    }
}

/// Signal tower lamp on the main card's digital outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLight {
    /// Stopped or faulted
    Red,
    /// Moving
    Yellow,
    /// Idle and ready
    Green,
    /// All lamps off
    Off,
}

impl SignalLight {
    /// Output channels of the red, yellow and green lamps.
    pub const CHANNELS: [u16; 3] = [0, 1, 2];

    /// Lamp levels in `CHANNELS` order.
    pub fn levels(self) -> [bool; 3] {
        match self {
            SignalLight::Red => [true, false, false],
            SignalLight::Yellow => [false, true, false],
            SignalLight::Green => [false, false, true],
            SignalLight::Off => [false, false, false],
        }
    }
}

/// Capability: single-axis motion card
#[async_trait]
pub trait MotionPort: Send + Sync {
    /// Open the card and bring the fieldbus up.
    async fn initialize(&self) -> RigResult<()>;

    /// Energize the axis.
    async fn axis_on(&self) -> RigResult<()>;

    /// De-energize the axis.
    async fn axis_off(&self) -> RigResult<()>;

    /// Select the motion profile.
    async fn set_profile(&self, mode: ProfileMode) -> RigResult<()>;

    /// Stage an absolute target (pulses).
    async fn set_target_position(&self, pulses: i64) -> RigResult<()>;

    /// Stage the velocity limit, or the signed jog velocity (pulses/ms).
    async fn set_velocity(&self, pulses_per_ms: f64) -> RigResult<()>;

    /// Stage the trapezoidal acceleration and deceleration (pulses/ms^2).
    async fn set_acceleration(&self, pulses_per_ms2: f64) -> RigResult<()>;

    /// Stage jog acceleration and deceleration (pulses/ms^2).
    async fn set_jog_params(&self, acceleration: f64, deceleration: f64) -> RigResult<()>;

    /// Start the staged motion.
    async fn commit(&self) -> RigResult<()>;

    /// Read the status word.
    async fn get_status_bits(&self) -> RigResult<AxisStatus>;

    /// Read the profile generator's position (pulses).
    async fn get_profiled_position(&self) -> RigResult<f64>;

    /// Decelerate to a halt.
    async fn stop(&self) -> RigResult<()>;

    /// Halt without deceleration.
    async fn emergency_stop(&self) -> RigResult<()>;

    /// Drive a digital output.
    async fn set_digital_output(&self, channel: u16, level: bool) -> RigResult<()>;

    /// Read a digital input.
    async fn get_digital_input(&self, channel: u16) -> RigResult<bool>;

    /// Arm the latched E-stop input.
    async fn set_estop_io(&self, io: EStopIo) -> RigResult<()>;

    /// Whether the E-stop latch is set.
    async fn get_latched_estop(&self) -> RigResult<bool>;

    /// Clear the E-stop latch.
    async fn clear_estop_latch(&self) -> RigResult<()>;

    /// Clear axis alarm and limit status.
    async fn clear_alarm(&self) -> RigResult<()>;

    /// Number of fieldbus peripherals currently online.
    async fn online_slave_count(&self) -> RigResult<u16>;

    /// Declare the current position as zero.
    async fn set_origin(&self) -> RigResult<()>;

    /// Start the homing sequence.
    async fn home_start(&self, params: &HomingParams) -> RigResult<()>;

    /// Abort the homing sequence.
    async fn home_stop(&self) -> RigResult<()>;

    /// Apply soft limits (pulses).
    async fn set_soft_limits(&self, positive: i64, negative: i64) -> RigResult<()>;

    /// Enable or disable the hardware limit inputs.
    async fn set_hard_limits(&self, enabled: bool, io: u16) -> RigResult<()>;

    /// Homing-related bits of the status word.
    async fn home_status(&self) -> RigResult<AxisStatus> {
        let status = self.get_status_bits().await?;
        Ok(status
            & (AxisStatus::HOME_RUNNING | AxisStatus::HOME_SUCCESS | AxisStatus::HOME_SWITCH))
    }
}
