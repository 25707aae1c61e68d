//! Sensor sampling: samples, the gated buffer and the acquisition engine.

pub mod buffer;
pub mod engine;
pub mod sample;

pub use buffer::SampleBuffer;
pub use engine::{DataAcquisitionEngine, SensorSource, SimulatedSensor};
pub use sample::{QualityFlag, SampleClock, SensorSample};
