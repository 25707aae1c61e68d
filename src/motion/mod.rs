//! Motion control: operating modes, trapezoidal planning and the controller.

pub mod controller;
pub mod joystick;
pub mod mode;
pub mod profile;

pub use controller::{ExternalSignal, JogDirection, MotionCommand, MotionController, PulseCommand};
pub use joystick::JoystickInput;
pub use mode::{ModeArbiter, ModeChange, OperatingMode};
pub use profile::TrapezoidalProfile;
