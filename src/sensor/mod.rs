//! Force-sensor link: Modbus RTU over a serial line.

pub mod crc;
pub mod frame;
pub mod link;

pub use link::{DynSerial, LinkTiming, ModbusSensorLink, SerialIo};
