//! Shared safety latch.
//!
//! Written only by the safety monitor, read by the controller before it
//! accepts any motion command.

use crate::error::{RigError, RigResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// Why the safe state was forced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TripReason {
    /// The hardware E-stop latch is set.
    EStopLatched,
    /// Fewer fieldbus peripherals online than required.
    LinkLost {
        /// Peripherals reported online
        online: u16,
        /// Peripherals required
        required: u16,
    },
    /// The card could not be queried at all.
    LinkFault(String),
    /// Operator pressed the software E-stop.
    Operator,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::EStopLatched => write!(f, "hardware E-stop latched"),
            TripReason::LinkLost { online, required } => write!(
                f,
                "fieldbus link lost ({online} of {required} peripherals online)"
            ),
            TripReason::LinkFault(message) => write!(f, "card unreachable: {message}"),
            TripReason::Operator => write!(f, "operator E-stop"),
        }
    }
}

/// Latched flag plus the time of the last completed poll.
#[derive(Debug, Default)]
pub struct SafetyState {
    latched: AtomicBool,
    reason: Mutex<Option<TripReason>>,
    last_poll_at: Mutex<Option<Instant>>,
}

impl SafetyState {
    /// Unlatched, never polled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether motion is currently forbidden.
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Reason of the active trip.
    pub fn reason(&self) -> Option<TripReason> {
        self.reason.lock().clone()
    }

    /// When the monitor last completed a poll.
    pub fn last_poll_at(&self) -> Option<Instant> {
        *self.last_poll_at.lock()
    }

    /// `Err(SafetyTrip)` while latched.
    pub fn ensure_clear(&self) -> RigResult<()> {
        if self.is_latched() {
            let reason = self
                .reason()
                .map_or_else(|| "latched".to_string(), |r| r.to_string());
            return Err(RigError::SafetyTrip(reason));
        }
        Ok(())
    }

    /// Set the latch. Returns false if it was already set.
    pub(crate) fn latch(&self, reason: TripReason) -> bool {
        let mut current = self.reason.lock();
        let newly = !self.latched.swap(true, Ordering::AcqRel);
        if newly {
            *current = Some(reason);
        }
        newly
    }

    pub(crate) fn clear(&self) {
        let mut current = self.reason.lock();
        *current = None;
        self.latched.store(false, Ordering::Release);
    }

    pub(crate) fn mark_polled(&self, at: Instant) {
        *self.last_poll_at.lock() = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_one_way_until_cleared() {
        let state = SafetyState::new();
        assert!(state.ensure_clear().is_ok());

        assert!(state.latch(TripReason::EStopLatched));
        assert!(!state.latch(TripReason::Operator));
        assert_eq!(state.reason(), Some(TripReason::EStopLatched));

        let err = state.ensure_clear().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Safety trip active: hardware E-stop latched"
        );

        state.clear();
        assert!(!state.is_latched());
        assert_eq!(state.reason(), None);
    }

    #[test]
    fn link_loss_reads_naturally() {
        let reason = TripReason::LinkLost {
            online: 0,
            required: 1,
        };
        assert_eq!(
            reason.to_string(),
            "fieldbus link lost (0 of 1 peripherals online)"
        );
    }
}
