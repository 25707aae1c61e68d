//! # Friction Rig Control Library
//!
//! Control core for a single-axis linear test rig: a motion axis driven
//! through a vendor card, a force sensor on a Modbus RTU serial link, and the
//! sequencing that turns the two into recorded test runs.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `MotionPort` capability trait, the vendor-card
//!   adapter and the software simulator.
//! - **`motion`**: `MotionController`, the sole gatekeeper of the axis, with
//!   its mode arbiter, trapezoidal planner and joystick poller.
//! - **`safety`**: the shared E-stop latch and the `SafetyMonitor` poll loop.
//! - **`sensor`**: CRC16, Modbus frames and the serial sensor link.
//! - **`acquisition`**: samples, the displacement-gated buffer and the
//!   `DataAcquisitionEngine`.
//! - **`test_run`**: the `TestOrchestrator` and the single-test guard.
//! - **`persistence`**: the `TestStore` collaborator and its memory/CSV stores.
//! - **`events`**: broadcast notifications for any subscriber.
//! - **`rig`**: assembles everything from a `RigConfig`.
//! - **`config`**, **`error`**, **`logging`**: the ambient stack.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod motion;
pub mod persistence;
pub mod rig;
pub mod safety;
pub mod sensor;
pub mod test_run;

pub use config::RigConfig;
pub use error::{RigError, RigResult};
pub use rig::Rig;
