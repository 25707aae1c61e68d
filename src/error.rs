//! Custom error types for the rig.
//!
//! This module defines the primary error type, `RigError`, used by every component
//! of the crate. Using the `thiserror` crate, it provides a single place where the
//! failure classes of the rig are named, from hardware bring-up problems to sensor
//! link corruption and safety trips.
//!
//! ## Error Hierarchy
//!
//! - **`HardwareInit`**: the motion port could not be opened or brought up. Callers
//!   degrade to a disabled state instead of aborting.
//! - **`Command`**: a motion primitive returned a nonzero vendor code. The current
//!   operation is aborted and the operating mode is left unchanged.
//! - **`Checksum`**, **`CommTimeout`**, **`Protocol`**: sensor link failures. The
//!   acquisition engine absorbs these and reports a missing sample.
//! - **`SafetyTrip`**: the safety latch is set. Motion is refused until the reset
//!   sequence completes.
//! - **`ModeConflict`**: the exclusive operating-mode invariant rejected a request.
//! - **`OperationCancelled`**: expected outcome of `stop()` or an E-stop during a move.
//!   Use [`RigError::is_cancellation`] to keep it out of user-facing error paths.
//! - **`Persistence`**, **`Configuration`**, **`Io`**: storage and configuration
//!   problems surfaced to the operator.

use crate::motion::OperatingMode;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Every failure the rig can report.
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Hardware initialization failed: {0}")]
    HardwareInit(String),

    #[error("Motion command '{operation}' failed with code {code}")]
    Command { operation: &'static str, code: i32 },

    #[error("Axis reported a servo alarm during '{0}'")]
    AxisAlarm(&'static str),

    #[error("Checksum mismatch: computed {computed:#06X}, frame carried {received:#06X}")]
    Checksum { computed: u16, received: u16 },

    #[error("Sensor link timed out: {0}")]
    CommTimeout(String),

    #[error("Malformed sensor frame: {0}")]
    Protocol(String),

    #[error("Safety trip active: {0}")]
    SafetyTrip(String),

    #[error("Cannot enter {requested} while {active} is active")]
    ModeConflict {
        requested: OperatingMode,
        active: OperatingMode,
    },

    #[error("Operation cancelled")]
    OperationCancelled,

    #[error("A test is already in progress")]
    TestInProgress,

    #[error("Invalid motion command: {0}")]
    InvalidCommand(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl RigError {
    /// Build a [`RigError::Command`] from a vendor return code.
    pub fn command(operation: &'static str, code: i32) -> Self {
        RigError::Command { operation, code }
    }

    /// True for the expected outcome of a stop or E-stop during a move.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RigError::OperationCancelled)
    }

    /// True when the error originates from the sensor link rather than the axis.
    pub fn is_sensor_link(&self) -> bool {
        matches!(
            self,
            RigError::Checksum { .. } | RigError::CommTimeout(_) | RigError::Protocol(_)
        )
    }
}

impl From<tokio::task::JoinError> for RigError {
    fn from(err: tokio::task::JoinError) -> Self {
        RigError::Task(err.to_string())
    }
}
