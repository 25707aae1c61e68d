//! Rig configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/rig.toml` (base configuration)
//! 2. Environment variables (prefixed with `FRICTION_RIG_`, sections split on `__`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! simulation configuration.
//!
//! # Example
//! ```no_run
//! use friction_rig::config::RigConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RigConfig::load()?;
//! config.validate()?;
//! println!("Axis {} at {} pulses/unit", config.axis.axis_number, config.axis.pulses_per_unit);
//! # Ok(())
//! # }
//! ```

use crate::error::RigError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Lowest soft limit the controller accepts, in pulses.
pub const SOFT_LIMIT_FLOOR: i64 = -1_000_000;
/// Highest soft limit the controller accepts, in pulses.
pub const SOFT_LIMIT_CEILING: i64 = 3_000_000;

/// Highest axis number a card's 32-bit axis mask can address.
pub const MAX_AXIS_NUMBER: u16 = 32;

/// Top-level rig configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Axis scaling, limits and homing
    pub axis: AxisConfig,
    /// Move polling, jog and joystick settings
    pub motion: MotionConfig,
    /// E-stop monitoring
    pub safety: SafetyConfig,
    /// Force sensor link and sampling
    pub sensor: SensorConfig,
    /// Test result storage
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Drive the simulated port and sensor instead of hardware
    pub simulation: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Friction Rig".to_string(),
            log_level: "info".to_string(),
            simulation: true,
        }
    }
}

/// Per-axis configuration, read once at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    /// Vendor axis number (1-based)
    pub axis_number: u16,
    /// Controller pulses per physical unit
    pub pulses_per_unit: f64,
    /// Negative soft limit in pulses
    pub soft_limit_min: i64,
    /// Positive soft limit in pulses
    pub soft_limit_max: i64,
    /// Whether the hardware limit inputs are enforced
    pub hard_limit_enabled: bool,
    /// Digital input carrying the hardware limit switches
    pub hard_limit_io: u16,
    /// Whether the latched hardware E-stop input is armed
    pub estop_enabled: bool,
    /// Speed used when returning to origin (units/s)
    pub home_return_speed: f64,
    /// Acceleration used when returning to origin (units/s^2)
    pub home_return_acceleration: f64,
    /// Homing search velocity (pulses/ms)
    pub home_rapid_velocity: f64,
    /// Homing locate velocity (pulses/ms)
    pub home_locate_velocity: f64,
    /// Homing acceleration (pulses/ms^2)
    pub home_acceleration: f64,
    /// Homing search direction: 1 positive, -1 negative
    pub home_direction: i8,
    /// Offset applied after the home switch is found (pulses)
    pub home_offset: i64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            axis_number: 1,
            pulses_per_unit: 1000.0,
            soft_limit_min: -10_000,
            soft_limit_max: 2_000_000,
            hard_limit_enabled: false,
            hard_limit_io: 0,
            estop_enabled: true,
            home_return_speed: 50.0,
            home_return_acceleration: 20.0,
            home_rapid_velocity: 20.0,
            home_locate_velocity: 5.0,
            home_acceleration: 0.5,
            home_direction: -1,
            home_offset: 0,
        }
    }
}

/// Motion polling, jog and joystick configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Move-completion poll period in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound for the reset-to-origin move in seconds
    pub reset_timeout_secs: u64,
    /// Jog velocity (units/s)
    pub jog_velocity: f64,
    /// Jog acceleration and deceleration (units/s^2)
    pub jog_acceleration: f64,
    /// Digital input wired to the joystick's positive direction
    pub joystick_positive_input: u16,
    /// Digital input wired to the joystick's negative direction
    pub joystick_negative_input: u16,
    /// Joystick input poll period in milliseconds
    pub joystick_poll_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            reset_timeout_secs: 60,
            jog_velocity: 10.0,
            jog_acceleration: 50.0,
            joystick_positive_input: 3,
            joystick_negative_input: 4,
            joystick_poll_ms: 20,
        }
    }
}

impl MotionConfig {
    /// Move-completion poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Joystick input poll period.
    pub fn joystick_poll(&self) -> Duration {
        Duration::from_millis(self.joystick_poll_ms)
    }

    /// Bound on the reset-to-origin move.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Polarity of the E-stop input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EStopSense {
    /// Input reads high when the button is pressed
    ActiveHigh,
    /// Input reads low when the button is pressed (normally-closed wiring)
    ActiveLow,
}

/// Safety monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Latch poll period in milliseconds
    pub poll_interval_ms: u64,
    /// Card carrying the E-stop input
    pub estop_card: u16,
    /// E-stop input index on that card
    pub estop_io: u16,
    /// Input polarity
    pub estop_sense: EStopSense,
    /// Input filter time in milliseconds
    pub estop_debounce_ms: u32,
    /// Delay between clearing the latch and clearing the axis alarm
    pub reset_settle_ms: u64,
    /// Minimum number of online fieldbus peripherals
    pub required_peripherals: u16,
    /// Treat a peripheral count below `required_peripherals` as a trip
    pub trip_on_link_loss: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            estop_card: 0,
            estop_io: 0,
            estop_sense: EStopSense::ActiveLow,
            estop_debounce_ms: 10,
            reset_settle_ms: 100,
            required_peripherals: 1,
            trip_on_link_loss: true,
        }
    }
}

impl SafetyConfig {
    /// Latch poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settle delay used by the reset sequence.
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

/// One holding register written during sensor bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    /// Register address
    pub register: u16,
    /// Value to write
    pub value: u16,
}

/// Force sensor link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial device path; `None` uses the simulated sensor
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Modbus station address
    pub station_address: u8,
    /// First register of the measured value
    pub value_register: u16,
    /// Registers making up the value (two for an f32)
    pub register_count: u16,
    /// Wait after sending a request before reading
    pub response_settle_ms: u64,
    /// Extra wait before the single retry
    pub retry_settle_ms: u64,
    /// Read timeout per attempt
    pub timeout_ms: u64,
    /// Continuous collection rate (1..=40 Hz)
    pub sampling_rate_hz: u32,
    /// Minimum displacement between recorded samples (units)
    pub precision_threshold: f64,
    /// Registers written at bring-up
    pub device_setup: Vec<RegisterWrite>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 19200,
            station_address: 1,
            value_register: 0x9C40,
            register_count: 2,
            response_settle_ms: 50,
            retry_settle_ms: 100,
            timeout_ms: 1000,
            sampling_rate_hz: 40,
            precision_threshold: 0.01,
            device_setup: Vec::new(),
        }
    }
}

impl SensorConfig {
    /// Sampling rate clamped to what the sensor supports.
    pub fn effective_sampling_rate(&self) -> u32 {
        self.sampling_rate_hz.clamp(1, 40)
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for stored test runs
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `FRICTION_RIG_`.
    /// Example: `FRICTION_RIG_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FRICTION_RIG_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), RigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let axis = &self.axis;
        if !(1..=MAX_AXIS_NUMBER).contains(&axis.axis_number) {
            return Err(RigError::Configuration(format!(
                "axis_number {} is outside 1..={}",
                axis.axis_number, MAX_AXIS_NUMBER
            )));
        }
        if axis.soft_limit_min < SOFT_LIMIT_FLOOR {
            return Err(RigError::Configuration(format!(
                "soft_limit_min {} is below {}",
                axis.soft_limit_min, SOFT_LIMIT_FLOOR
            )));
        }
        if axis.soft_limit_max > SOFT_LIMIT_CEILING {
            return Err(RigError::Configuration(format!(
                "soft_limit_max {} is above {}",
                axis.soft_limit_max, SOFT_LIMIT_CEILING
            )));
        }
        if axis.soft_limit_max < axis.soft_limit_min {
            return Err(RigError::Configuration(format!(
                "soft_limit_max {} is below soft_limit_min {}",
                axis.soft_limit_max, axis.soft_limit_min
            )));
        }
        if axis.pulses_per_unit <= 0.0 || !axis.pulses_per_unit.is_finite() {
            return Err(RigError::Configuration(
                "pulses_per_unit must be a positive number".to_string(),
            ));
        }
        if axis.home_return_speed <= 0.0 || axis.home_return_acceleration <= 0.0 {
            return Err(RigError::Configuration(
                "home_return_speed and home_return_acceleration must be positive".to_string(),
            ));
        }

        if self.sensor.precision_threshold <= 0.0 {
            return Err(RigError::Configuration(format!(
                "precision_threshold must be positive, got {}",
                self.sensor.precision_threshold
            )));
        }

        if self.motion.poll_interval_ms == 0
            || self.motion.joystick_poll_ms == 0
            || self.safety.poll_interval_ms == 0
        {
            return Err(RigError::Configuration(
                "poll intervals must be at least 1 ms".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.application.simulation);
        assert_eq!(config.axis.pulses_per_unit, 1000.0);
        assert_eq!(config.motion.poll_interval_ms, 10);
        assert_eq!(config.safety.poll_interval_ms, 50);
        assert_eq!(config.sensor.value_register, 0x9C40);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[axis]
pulses_per_unit = 500.0
soft_limit_max = 1000000

[sensor]
precision_threshold = 0.05
device_setup = [{{ register = 4, value = 2 }}]
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.axis.pulses_per_unit, 500.0);
        assert_eq!(config.axis.soft_limit_max, 1_000_000);
        // untouched sections keep their defaults
        assert_eq!(config.safety, SafetyConfig::default());
        assert_eq!(config.sensor.precision_threshold, 0.05);
        assert_eq!(
            config.sensor.device_setup,
            vec![RegisterWrite {
                register: 4,
                value: 2
            }]
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = RigConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.storage.output_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = RigConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.axis.soft_limit_min = -2_000_000;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.axis.soft_limit_max = 4_000_000;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.axis.soft_limit_min = 100;
        config.axis.soft_limit_max = 50;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.axis.axis_number = 0;
        assert!(config.validate().is_err());
        config.axis.axis_number = MAX_AXIS_NUMBER + 1;
        assert!(config.validate().is_err());
        config.axis.axis_number = MAX_AXIS_NUMBER;
        assert!(config.validate().is_ok());

        let mut config = RigConfig::default();
        config.axis.home_return_speed = 0.0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.sensor.precision_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.safety.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sampling_rate_is_clamped() {
        let mut sensor = SensorConfig {
            sampling_rate_hz: 100,
            ..Default::default()
        };
        assert_eq!(sensor.effective_sampling_rate(), 40);
        sensor.sampling_rate_hz = 0;
        assert_eq!(sensor.effective_sampling_rate(), 1);
    }
}
