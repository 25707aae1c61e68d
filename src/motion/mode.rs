//! Operating-mode state machine.
//!
//! One mode is authoritative per axis. Manual modes and automatic moves
//! exclude each other; `EStopped` pre-empts everything and is only left
//! through the safety reset; `Alarm` is left through an alarm clear.

use crate::error::{RigError, RigResult};
use serde::Serialize;
use std::fmt;

/// Who currently owns the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperatingMode {
    /// Idle, or running an automatic move
    Automatic,
    /// Operator jog buttons
    Jogging,
    /// Handwheel encoder
    Handwheel,
    /// Two-input joystick
    Joystick,
    /// Card homing sequence
    Homing,
    /// Safety latch set; motion refused until reset
    EStopped,
    /// Drive fault; motion refused until cleared
    Alarm,
}

impl OperatingMode {
    /// The operator-driven modes that own the axis.
    pub const MANUAL: [OperatingMode; 3] = [
        OperatingMode::Jogging,
        OperatingMode::Handwheel,
        OperatingMode::Joystick,
    ];

    /// Jogging, Handwheel or Joystick.
    pub fn is_manual(self) -> bool {
        Self::MANUAL.contains(&self)
    }

    /// EStopped or Alarm.
    pub fn is_faulted(self) -> bool {
        matches!(self, OperatingMode::EStopped | OperatingMode::Alarm)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatingMode::Automatic => "automatic",
            OperatingMode::Jogging => "jogging",
            OperatingMode::Handwheel => "handwheel",
            OperatingMode::Joystick => "joystick",
            OperatingMode::Homing => "homing",
            OperatingMode::EStopped => "emergency stop",
            OperatingMode::Alarm => "alarm",
        };
        f.write_str(name)
    }
}

/// Result of a mode request that did not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// The mode was entered (or left).
    Changed,
    /// Already in the requested state; nothing done.
    Unchanged,
}

/// Mode plus the "automatic move in flight" flag, mutated under one lock.
#[derive(Debug, Clone)]
pub struct ModeArbiter {
    mode: OperatingMode,
    move_active: bool,
}

impl Default for ModeArbiter {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Automatic,
            move_active: false,
        }
    }
}

impl ModeArbiter {
    /// Current mode.
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Whether an automatic move holds the axis.
    pub fn move_active(&self) -> bool {
        self.move_active
    }

    /// Automatic and idle.
    pub fn is_idle(&self) -> bool {
        self.mode == OperatingMode::Automatic && !self.move_active
    }

    fn conflict(&self, requested: OperatingMode) -> RigError {
        RigError::ModeConflict {
            requested,
            active: self.mode,
        }
    }

    /// Take the axis for a manual mode or homing.
    pub fn enter(&mut self, target: OperatingMode) -> RigResult<ModeChange> {
        if self.mode == target {
            return Ok(ModeChange::Unchanged);
        }
        if !self.is_idle() {
            return Err(self.conflict(target));
        }
        self.mode = target;
        Ok(ModeChange::Changed)
    }

    /// Hand the axis back to automatic if `target` holds it.
    pub fn leave(&mut self, target: OperatingMode) -> ModeChange {
        if self.mode == target {
            self.mode = OperatingMode::Automatic;
            ModeChange::Changed
        } else {
            ModeChange::Unchanged
        }
    }

    /// Claim the axis for an automatic move.
    ///
    /// A move already in flight is superseded, so claiming succeeds whenever
    /// the mode is `Automatic`.
    pub fn begin_move(&mut self) -> RigResult<()> {
        if self.mode != OperatingMode::Automatic {
            return Err(self.conflict(OperatingMode::Automatic));
        }
        self.move_active = true;
        Ok(())
    }

    /// Release the automatic-move claim.
    pub fn end_move(&mut self) {
        self.move_active = false;
    }

    /// Force `EStopped` from any mode.
    pub fn estop(&mut self) {
        self.mode = OperatingMode::EStopped;
        self.move_active = false;
    }

    /// Leave `EStopped` after a successful safety reset.
    pub fn release_estop(&mut self) -> ModeChange {
        self.leave(OperatingMode::EStopped)
    }

    /// Enter `Alarm` unless already E-stopped.
    pub fn alarm(&mut self) -> ModeChange {
        match self.mode {
            OperatingMode::EStopped | OperatingMode::Alarm => ModeChange::Unchanged,
            _ => {
                self.mode = OperatingMode::Alarm;
                self.move_active = false;
                ModeChange::Changed
            }
        }
    }
}
