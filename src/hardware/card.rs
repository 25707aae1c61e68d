//! Hardware motion port over a vendor motion-card binding.
//!
//! [`MotionCard`] is the thin, synchronous call surface a vendor library
//! exposes: every call returns a status code where zero means success.
//! [`CardPort`] adapts any such binding to [`MotionPort`], turning nonzero
//! codes into [`RigError::Command`] and running the slow bring-up calls on the
//! blocking pool.

use crate::error::{RigError, RigResult};
use crate::hardware::port::{AxisStatus, EStopIo, HomingParams, MotionPort, ProfileMode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

/// Result of a vendor call: the value, or the nonzero status code.
pub type CardResult<T> = Result<T, i32>;

/// Raw vendor call surface of an EtherCAT motion card.
///
/// Axis numbers are 1-based. Implementations wrap the vendor's C library and
/// must be callable from any thread.
pub trait MotionCard: Send + Sync + 'static {
    /// Open the card.
    fn open(&self) -> CardResult<()>;
    /// Load the process-data mapping.
    fn load_pdo_config(&self) -> CardResult<()>;
    /// Bring the fieldbus to operational.
    fn fieldbus_init(&self) -> CardResult<()>;
    /// Restore the absolute encoder origin of a station.
    fn load_origin_absolute(&self, station: u16) -> CardResult<()>;
    /// Energize an axis.
    fn axis_on(&self, axis: u16) -> CardResult<()>;
    /// De-energize an axis.
    fn axis_off(&self, axis: u16) -> CardResult<()>;
    /// Select trapezoidal positioning.
    fn profile_trap(&self, axis: u16) -> CardResult<()>;
    /// Select jog (velocity) mode.
    fn profile_jog(&self, axis: u16) -> CardResult<()>;
    /// Couple the axis to the handwheel encoder.
    fn start_handwheel(&self, axis: u16) -> CardResult<()>;
    /// Release the handwheel coupling.
    fn end_handwheel(&self, axis: u16) -> CardResult<()>;
    /// Trapezoidal acceleration and deceleration (pulses/ms^2).
    fn set_trap_params(&self, axis: u16, acceleration: f64, deceleration: f64) -> CardResult<()>;
    /// Jog acceleration and deceleration (pulses/ms^2).
    fn set_jog_params(&self, axis: u16, acceleration: f64, deceleration: f64) -> CardResult<()>;
    /// Target position (pulses).
    fn set_position(&self, axis: u16, pulses: i32) -> CardResult<()>;
    /// Velocity (pulses/ms).
    fn set_velocity(&self, axis: u16, velocity: f64) -> CardResult<()>;
    /// Start staged motion on the axes in `mask`.
    fn update(&self, mask: u32) -> CardResult<()>;
    /// Raw status word.
    fn status(&self, axis: u16) -> CardResult<u32>;
    /// Profiled position (pulses).
    fn profiled_position(&self, axis: u16) -> CardResult<f64>;
    /// Stop the axes in `mask`; `abrupt` selects the emergency-stop ramp.
    fn stop(&self, mask: u32, abrupt: bool) -> CardResult<()>;
    /// Drive a digital output.
    fn set_output(&self, card: u16, channel: u16, level: bool) -> CardResult<()>;
    /// Read a digital input.
    fn input(&self, card: u16, channel: u16) -> CardResult<bool>;
    /// Map the E-stop input.
    fn set_estop_io(&self, card: u16, io: u16, active_high: bool, filter_ms: u32)
        -> CardResult<()>;
    /// Latched E-stop state.
    fn estop_latched(&self) -> CardResult<bool>;
    /// Clear the E-stop latch.
    fn clear_estop(&self) -> CardResult<()>;
    /// Clear alarm and limit status of an axis.
    fn clear_status(&self, axis: u16) -> CardResult<()>;
    /// Online fieldbus peripherals.
    fn slave_count(&self) -> CardResult<u16>;
    /// Zero the encoder of a station at its current position.
    fn set_origin(&self, station: u16) -> CardResult<()>;
    /// Configure and start homing.
    fn home_start(&self, axis: u16, params: &HomingParams) -> CardResult<()>;
    /// Abort homing.
    fn home_stop(&self, axis: u16) -> CardResult<()>;
    /// Soft limits (pulses).
    fn set_soft_limits(&self, axis: u16, positive: i32, negative: i32) -> CardResult<()>;
    /// Hardware limit inputs.
    fn set_hard_limits(&self, axis: u16, enabled: bool, io: u16) -> CardResult<()>;
}

/// [`MotionPort`] over a vendor card for one axis.
pub struct CardPort<C: MotionCard> {
    card: Arc<C>,
    axis: u16,
    /// Card index of the main I/O module
    io_card: u16,
    profile: Mutex<ProfileMode>,
    settle: Duration,
}

impl<C: MotionCard> CardPort<C> {
    /// Adapter for `axis` (1-based).
    pub fn new(card: C, axis: u16) -> Self {
        Self {
            card: Arc::new(card),
            axis,
            io_card: 0,
            profile: Mutex::new(ProfileMode::Trapezoidal),
            settle: Duration::from_millis(500),
        }
    }

    /// Delay between loading the PDO mapping and fieldbus init.
    pub fn with_bring_up_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn mask(&self) -> RigResult<u32> {
        self.axis
            .checked_sub(1)
            .and_then(|bit| 1u32.checked_shl(u32::from(bit)))
            .ok_or_else(|| {
                RigError::InvalidCommand(format!("axis {} has no bit in the axis mask", self.axis))
            })
    }

    fn call<T>(&self, operation: &'static str, result: CardResult<T>) -> RigResult<T> {
        result.map_err(|code| {
            warn!(axis = self.axis, operation, code, "Card command failed");
            RigError::command(operation, code)
        })
    }

    fn clamp_pulses(pulses: i64) -> i32 {
        pulses.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
}

#[async_trait]
impl<C: MotionCard> MotionPort for CardPort<C> {
    #[instrument(skip(self), fields(axis = self.axis), err)]
    async fn initialize(&self) -> RigResult<()> {
        let card = Arc::clone(&self.card);
        let axis = self.axis;
        let settle = self.settle;

        spawn_blocking(move || -> RigResult<()> {
            card.open()
                .map_err(|code| RigError::HardwareInit(format!("open failed with code {code}")))?;
            card.load_pdo_config().map_err(|code| {
                RigError::HardwareInit(format!("PDO configuration failed with code {code}"))
            })?;
            std::thread::sleep(settle);
            card.fieldbus_init().map_err(|code| {
                RigError::HardwareInit(format!("fieldbus init failed with code {code}"))
            })?;
            card.load_origin_absolute(axis).map_err(|code| {
                RigError::HardwareInit(format!("absolute origin load failed with code {code}"))
            })?;
            card.axis_on(axis)
                .map_err(|code| RigError::HardwareInit(format!("axis on failed with code {code}")))
        })
        .await??;

        info!(axis = self.axis, "Motion card initialized");
        Ok(())
    }

    async fn axis_on(&self) -> RigResult<()> {
        self.call("axis_on", self.card.axis_on(self.axis))
    }

    async fn axis_off(&self) -> RigResult<()> {
        self.call("axis_off", self.card.axis_off(self.axis))
    }

    async fn set_profile(&self, mode: ProfileMode) -> RigResult<()> {
        let previous = *self.profile.lock();
        if previous == ProfileMode::Handwheel && mode != ProfileMode::Handwheel {
            self.call("end_handwheel", self.card.end_handwheel(self.axis))?;
        }
        match mode {
            ProfileMode::Trapezoidal => self.call("set_profile", self.card.profile_trap(self.axis))?,
            ProfileMode::Jog => self.call("set_profile", self.card.profile_jog(self.axis))?,
            ProfileMode::Handwheel => {
                self.call("start_handwheel", self.card.start_handwheel(self.axis))?
            }
        }
        *self.profile.lock() = mode;
        debug!(axis = self.axis, ?mode, "Profile selected");
        Ok(())
    }

    async fn set_target_position(&self, pulses: i64) -> RigResult<()> {
        self.call(
            "set_target_position",
            self.card.set_position(self.axis, Self::clamp_pulses(pulses)),
        )
    }

    async fn set_velocity(&self, pulses_per_ms: f64) -> RigResult<()> {
        self.call("set_velocity", self.card.set_velocity(self.axis, pulses_per_ms))
    }

    async fn set_acceleration(&self, pulses_per_ms2: f64) -> RigResult<()> {
        self.call(
            "set_acceleration",
            self.card
                .set_trap_params(self.axis, pulses_per_ms2, pulses_per_ms2),
        )
    }

    async fn set_jog_params(&self, acceleration: f64, deceleration: f64) -> RigResult<()> {
        self.call(
            "set_jog_params",
            self.card.set_jog_params(self.axis, acceleration, deceleration),
        )
    }

    async fn commit(&self) -> RigResult<()> {
        self.call("commit", self.card.update(self.mask()?))
    }

    async fn get_status_bits(&self) -> RigResult<AxisStatus> {
        let raw = self.call("get_status_bits", self.card.status(self.axis))?;
        Ok(AxisStatus::from_bits_truncate(raw))
    }

    async fn get_profiled_position(&self) -> RigResult<f64> {
        self.call(
            "get_profiled_position",
            self.card.profiled_position(self.axis),
        )
    }

    async fn stop(&self) -> RigResult<()> {
        self.call("stop", self.card.stop(self.mask()?, false))
    }

    async fn emergency_stop(&self) -> RigResult<()> {
        self.call("emergency_stop", self.card.stop(self.mask()?, true))
    }

    async fn set_digital_output(&self, channel: u16, level: bool) -> RigResult<()> {
        self.call(
            "set_digital_output",
            self.card.set_output(self.io_card, channel, level),
        )
    }

    async fn get_digital_input(&self, channel: u16) -> RigResult<bool> {
        self.call("get_digital_input", self.card.input(self.io_card, channel))
    }

    async fn set_estop_io(&self, io: EStopIo) -> RigResult<()> {
        let active_high = io.sense == crate::config::EStopSense::ActiveHigh;
        self.call(
            "set_estop_io",
            self.card
                .set_estop_io(io.card, io.io, active_high, io.debounce_ms),
        )
    }

    async fn get_latched_estop(&self) -> RigResult<bool> {
        self.call("get_latched_estop", self.card.estop_latched())
    }

    async fn clear_estop_latch(&self) -> RigResult<()> {
        self.call("clear_estop_latch", self.card.clear_estop())
    }

    async fn clear_alarm(&self) -> RigResult<()> {
        self.call("clear_alarm", self.card.clear_status(self.axis))
    }

    async fn online_slave_count(&self) -> RigResult<u16> {
        self.call("online_slave_count", self.card.slave_count())
    }

    async fn set_origin(&self) -> RigResult<()> {
        self.call("set_origin", self.card.set_origin(self.axis))
    }

    async fn home_start(&self, params: &HomingParams) -> RigResult<()> {
        self.call("home_start", self.card.home_start(self.axis, params))
    }

    async fn home_stop(&self) -> RigResult<()> {
        self.call("home_stop", self.card.home_stop(self.axis))
    }

    async fn set_soft_limits(&self, positive: i64, negative: i64) -> RigResult<()> {
        self.call(
            "set_soft_limits",
            self.card.set_soft_limits(
                self.axis,
                Self::clamp_pulses(positive),
                Self::clamp_pulses(negative),
            ),
        )
    }

    async fn set_hard_limits(&self, enabled: bool, io: u16) -> RigResult<()> {
        self.call(
            "set_hard_limits",
            self.card.set_hard_limits(self.axis, enabled, io),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Records every call; codes registered in `failures` are returned instead of success.
    #[derive(Default)]
    struct FakeCard {
        calls: Mutex<Vec<String>>,
        failures: Mutex<HashMap<&'static str, i32>>,
        status: Mutex<u32>,
    }

    impl FakeCard {
        fn record(&self, name: &'static str, detail: String) -> CardResult<()> {
            self.calls.lock().push(format!("{name}{detail}"));
            match self.failures.lock().get(name) {
                Some(code) => Err(*code),
                None => Ok(()),
            }
        }
    }

    impl MotionCard for FakeCard {
        fn open(&self) -> CardResult<()> {
            self.record("open", String::new())
        }
        fn load_pdo_config(&self) -> CardResult<()> {
            self.record("load_pdo_config", String::new())
        }
        fn fieldbus_init(&self) -> CardResult<()> {
            self.record("fieldbus_init", String::new())
        }
        fn load_origin_absolute(&self, station: u16) -> CardResult<()> {
            self.record("load_origin_absolute", format!("({station})"))
        }
        fn axis_on(&self, axis: u16) -> CardResult<()> {
            self.record("axis_on", format!("({axis})"))
        }
        fn axis_off(&self, axis: u16) -> CardResult<()> {
            self.record("axis_off", format!("({axis})"))
        }
        fn profile_trap(&self, axis: u16) -> CardResult<()> {
            self.record("profile_trap", format!("({axis})"))
        }
        fn profile_jog(&self, axis: u16) -> CardResult<()> {
            self.record("profile_jog", format!("({axis})"))
        }
        fn start_handwheel(&self, axis: u16) -> CardResult<()> {
            self.record("start_handwheel", format!("({axis})"))
        }
        fn end_handwheel(&self, axis: u16) -> CardResult<()> {
            self.record("end_handwheel", format!("({axis})"))
        }
        fn set_trap_params(&self, axis: u16, acc: f64, dec: f64) -> CardResult<()> {
            self.record("set_trap_params", format!("({axis},{acc},{dec})"))
        }
        fn set_jog_params(&self, axis: u16, acc: f64, dec: f64) -> CardResult<()> {
            self.record("set_jog_params", format!("({axis},{acc},{dec})"))
        }
        fn set_position(&self, axis: u16, pulses: i32) -> CardResult<()> {
            self.record("set_position", format!("({axis},{pulses})"))
        }
        fn set_velocity(&self, axis: u16, velocity: f64) -> CardResult<()> {
            self.record("set_velocity", format!("({axis},{velocity})"))
        }
        fn update(&self, mask: u32) -> CardResult<()> {
            self.record("update", format!("({mask:#x})"))
        }
        fn status(&self, _axis: u16) -> CardResult<u32> {
            Ok(*self.status.lock())
        }
        fn profiled_position(&self, _axis: u16) -> CardResult<f64> {
            Ok(1234.0)
        }
        fn stop(&self, mask: u32, abrupt: bool) -> CardResult<()> {
            self.record("stop", format!("({mask:#x},{abrupt})"))
        }
        fn set_output(&self, card: u16, channel: u16, level: bool) -> CardResult<()> {
            self.record("set_output", format!("({card},{channel},{level})"))
        }
        fn input(&self, _card: u16, channel: u16) -> CardResult<bool> {
            Ok(channel == 3)
        }
        fn set_estop_io(&self, card: u16, io: u16, high: bool, filter: u32) -> CardResult<()> {
            self.record("set_estop_io", format!("({card},{io},{high},{filter})"))
        }
        fn estop_latched(&self) -> CardResult<bool> {
            Ok(false)
        }
        fn clear_estop(&self) -> CardResult<()> {
            self.record("clear_estop", String::new())
        }
        fn clear_status(&self, axis: u16) -> CardResult<()> {
            self.record("clear_status", format!("({axis})"))
        }
        fn slave_count(&self) -> CardResult<u16> {
            Ok(2)
        }
        fn set_origin(&self, station: u16) -> CardResult<()> {
            self.record("set_origin", format!("({station})"))
        }
        fn home_start(&self, axis: u16, _params: &HomingParams) -> CardResult<()> {
            self.record("home_start", format!("({axis})"))
        }
        fn home_stop(&self, axis: u16) -> CardResult<()> {
            self.record("home_stop", format!("({axis})"))
        }
        fn set_soft_limits(&self, axis: u16, pos: i32, neg: i32) -> CardResult<()> {
            self.record("set_soft_limits", format!("({axis},{pos},{neg})"))
        }
        fn set_hard_limits(&self, axis: u16, enabled: bool, io: u16) -> CardResult<()> {
            self.record("set_hard_limits", format!("({axis},{enabled},{io})"))
        }
    }

    fn port() -> CardPort<FakeCard> {
        CardPort::new(FakeCard::default(), 2).with_bring_up_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn bring_up_sequence() {
        let port = port();
        port.initialize().await.unwrap();
        assert_eq!(
            *port.card.calls.lock(),
            vec![
                "open",
                "load_pdo_config",
                "fieldbus_init",
                "load_origin_absolute(2)",
                "axis_on(2)"
            ]
        );
    }

    #[tokio::test]
    async fn failed_open_is_hardware_init_error() {
        let port = port();
        port.card.failures.lock().insert("open", 3);
        let err = port.initialize().await.unwrap_err();
        assert!(matches!(err, RigError::HardwareInit(_)));
        assert_eq!(port.card.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn nonzero_code_becomes_command_error() {
        let port = port();
        port.card.failures.lock().insert("update", -1);
        match port.commit().await {
            Err(RigError::Command { operation, code }) => {
                assert_eq!(operation, "commit");
                assert_eq!(code, -1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn axis_mask_and_stop_flavour() {
        let port = port();
        port.stop().await.unwrap();
        port.emergency_stop().await.unwrap();
        let calls = port.card.calls.lock().clone();
        assert_eq!(calls, vec!["stop(0x2,false)", "stop(0x2,true)"]);
    }

    #[tokio::test]
    async fn axis_beyond_the_mask_is_refused() {
        let top = CardPort::new(FakeCard::default(), 32);
        top.commit().await.unwrap();
        assert_eq!(*top.card.calls.lock(), vec!["update(0x80000000)"]);

        for axis in [0, 33, u16::MAX] {
            let port = CardPort::new(FakeCard::default(), axis);
            assert!(matches!(
                port.commit().await,
                Err(RigError::InvalidCommand(_))
            ));
            assert!(port.stop().await.is_err());
            assert!(port.card.calls.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn leaving_handwheel_releases_coupling() {
        let port = port();
        port.set_profile(ProfileMode::Handwheel).await.unwrap();
        port.set_profile(ProfileMode::Jog).await.unwrap();
        let calls = port.card.calls.lock().clone();
        assert_eq!(
            calls,
            vec!["start_handwheel(2)", "end_handwheel(2)", "profile_jog(2)"]
        );
    }

    #[tokio::test]
    async fn status_word_and_limits() {
        let port = port();
        *port.card.status.lock() = 0x0A00;
        let status = port.get_status_bits().await.unwrap();
        assert!(status.contains(AxisStatus::ENABLE | AxisStatus::ARRIVE));

        port.set_soft_limits(i64::MAX, i64::MIN).await.unwrap();
        let calls = port.card.calls.lock().clone();
        assert_eq!(
            calls.last().map(String::as_str),
            Some(format!("set_soft_limits(2,{},{})", i32::MAX, i32::MIN).as_str())
        );
        assert!(port.get_digital_input(3).await.unwrap());
        assert_eq!(port.online_slave_count().await.unwrap(), 2);
    }
}
