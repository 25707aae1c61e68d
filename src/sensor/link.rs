//! Request/response driver for the force sensor.
//!
//! One transaction at a time over a shared serial channel: drain stale
//! input, send the request, wait the settle delay, then read until the frame
//! length implied by its header is reached. A read that times out gets one
//! retry after a longer settle before the link reports `CommTimeout`.

use crate::config::{RegisterWrite, SensorConfig};
use crate::error::{RigError, RigResult};
use crate::sensor::frame;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, trace, warn};

/// Any async byte stream usable as the sensor's serial line.
///
/// Covers `tokio_serial::SerialStream` and `tokio::io::DuplexStream` alike.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Type-erased serial line.
pub type DynSerial = Box<dyn SerialIo>;

/// Delays governing one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Wait after sending before the first read
    pub response_settle: Duration,
    /// Extra wait before the single retry
    pub retry_settle: Duration,
    /// Per-attempt read timeout
    pub read_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self::from(&SensorConfig::default())
    }
}

impl From<&SensorConfig> for LinkTiming {
    fn from(config: &SensorConfig) -> Self {
        Self {
            response_settle: Duration::from_millis(config.response_settle_ms),
            retry_settle: Duration::from_millis(config.retry_settle_ms),
            read_timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

const DRAIN_WINDOW: Duration = Duration::from_millis(2);

/// Modbus RTU master for a single sensor station.
pub struct ModbusSensorLink {
    port: Arc<Mutex<DynSerial>>,
    station: AtomicU8,
    timing: LinkTiming,
}

impl ModbusSensorLink {
    /// Link over an already-open serial line.
    pub fn new(port: DynSerial, station: u8, timing: LinkTiming) -> Self {
        Self {
            port: Arc::new(Mutex::new(port)),
            station: AtomicU8::new(station),
            timing,
        }
    }

    /// Open the configured serial port (8N1, no flow control).
    #[cfg(feature = "serial")]
    pub async fn open(config: &SensorConfig) -> RigResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let path = config.port.clone().ok_or_else(|| {
            RigError::Configuration("sensor.port is not set".to_string())
        })?;
        let baud = config.baud_rate;
        let display_path = path.clone();

        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await?
        .map_err(|err| {
            RigError::HardwareInit(format!("failed to open sensor port {display_path}: {err}"))
        })?;

        debug!(port = %display_path, baud, "Sensor port open");
        Ok(Self::new(
            Box::new(stream),
            config.station_address,
            LinkTiming::from(config),
        ))
    }

    /// Station currently addressed.
    pub fn station(&self) -> u8 {
        self.station.load(Ordering::Relaxed)
    }

    /// Address a different station.
    pub fn set_station(&self, station: u8) {
        self.station.store(station, Ordering::Relaxed);
    }

    /// Read holding registers and return the raw payload.
    #[instrument(skip(self), fields(station = self.station()))]
    pub async fn read_holding_registers(&self, start: u16, count: u16) -> RigResult<Vec<u8>> {
        let station = self.station();
        let request = frame::read_request(station, start, count);
        let response = self.transact(&request).await?;
        let payload = frame::parse_read_response(&response, station)?;
        if payload.len() != usize::from(count) * 2 {
            return Err(RigError::Protocol(format!(
                "asked for {} registers, got {} bytes",
                count,
                payload.len()
            )));
        }
        Ok(payload.to_vec())
    }

    /// Read a big-endian f32 spanning two registers at `register`.
    pub async fn read_f32(&self, register: u16) -> RigResult<f32> {
        let payload = self.read_holding_registers(register, 2).await?;
        frame::decode_f32_be(&payload)
    }

    /// Write one register and confirm the echo.
    #[instrument(skip(self), fields(station = self.station()))]
    pub async fn write_register(&self, register: u16, value: u16) -> RigResult<()> {
        let station = self.station();
        let request = frame::write_request(station, register, value);
        let response = self.transact(&request).await?;
        frame::parse_write_response(&response, &request, station)
    }

    /// Write the bring-up registers. Failures are logged and skipped.
    ///
    /// Returns how many writes the sensor accepted.
    pub async fn configure(&self, setup: &[RegisterWrite]) -> usize {
        let mut accepted = 0;
        for write in setup {
            match self.write_register(write.register, write.value).await {
                Ok(()) => accepted += 1,
                Err(err) => warn!(
                    %err,
                    register = write.register,
                    value = write.value,
                    "Sensor setup write failed, keeping device default"
                ),
            }
        }
        debug!(accepted, total = setup.len(), "Sensor configured");
        accepted
    }

    async fn transact(&self, request: &[u8]) -> RigResult<Vec<u8>> {
        let mut port = self.port.lock().await;

        let stale = drain(port.as_mut()).await;
        if stale > 0 {
            debug!(stale, "Discarded stale sensor bytes");
        }

        trace!(request = ?request, "Sensor request");
        port.write_all(request).await?;
        port.flush().await?;

        let mut response = Vec::with_capacity(16);
        sleep(self.timing.response_settle).await;
        let first = timeout(
            self.timing.read_timeout,
            read_frame(port.as_mut(), &mut response),
        )
        .await;
        match first {
            Ok(result) => result?,
            Err(_) => {
                debug!(received = response.len(), "No complete response yet, retrying");
                sleep(self.timing.retry_settle).await;
                timeout(
                    self.timing.read_timeout,
                    read_frame(port.as_mut(), &mut response),
                )
                .await
                .map_err(|_| {
                    RigError::CommTimeout(format!(
                        "no complete response after retry ({} bytes received)",
                        response.len()
                    ))
                })??;
            }
        }

        trace!(response = ?response, "Sensor response");
        Ok(response)
    }
}

/// Read into `frame` until the length announced by its header is reached.
///
/// Cancel-safe: bytes already read stay in `frame`, so a timed-out attempt
/// can be resumed.
async fn read_frame(port: &mut dyn SerialIo, frame: &mut Vec<u8>) -> RigResult<()> {
    let mut chunk = [0u8; 64];
    loop {
        if let Some(len) = frame::response_len(frame)? {
            if frame.len() >= len {
                frame.truncate(len);
                return Ok(());
            }
        }
        let n = port.read(&mut chunk).await?;
        if n == 0 {
            return Err(RigError::CommTimeout(
                "sensor line closed mid-response".to_string(),
            ));
        }
        frame.extend_from_slice(&chunk[..n]);
    }
}

async fn drain(port: &mut dyn SerialIo) -> usize {
    let mut discard = [0u8; 64];
    let mut total = 0;
    while let Ok(Ok(n)) = timeout(DRAIN_WINDOW, port.read(&mut discard)).await {
        if n == 0 {
            break;
        }
        total += n;
    }
    total
}
