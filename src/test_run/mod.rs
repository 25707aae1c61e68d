//! Test sequencing and the system-wide single-test guard.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{TestOrchestrator, TestParameters, TestReport};
pub use state::{TestActivityGuard, TestStateManager};
