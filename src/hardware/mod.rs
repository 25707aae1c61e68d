//! Motion hardware
//!
//! The [`MotionPort`] capability plus its two implementations: a vendor-card
//! adapter and a software simulator.

pub mod card;
pub mod port;
pub mod simulator;

pub use card::{CardPort, CardResult, MotionCard};
pub use port::{AxisStatus, EStopIo, HomingParams, MotionPort, ProfileMode, SignalLight};
pub use simulator::SimulatedPort;
