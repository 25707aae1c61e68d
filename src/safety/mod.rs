//! Safety: the shared latch and the monitor that sets it.

pub mod monitor;
pub mod state;

pub use monitor::{ResetStep, SafetyMonitor};
pub use state::{SafetyState, TripReason};
