//! Trapezoidal point-to-point profile.
//!
//! Unit-agnostic: distance, velocity and acceleration only need to share a
//! length and time unit. The simulator plans in pulses and seconds, the
//! controller in physical units.

use std::time::Duration;

/// Accelerate, cruise, decelerate. Triangular when the peak velocity is not reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapezoidalProfile {
    distance: f64,
    peak_velocity: f64,
    acceleration: f64,
    accel_time: f64,
    cruise_time: f64,
}

impl TrapezoidalProfile {
    /// Plan a move of `distance` (signed) with the given limits.
    ///
    /// A non-positive acceleration plans a constant-velocity move. A
    /// non-positive velocity plans nothing: the move completes instantly.
    pub fn plan(distance: f64, max_velocity: f64, acceleration: f64) -> Self {
        let length = distance.abs();
        if length == 0.0 || max_velocity <= 0.0 || !max_velocity.is_finite() {
            return Self {
                distance,
                peak_velocity: 0.0,
                acceleration: 0.0,
                accel_time: 0.0,
                cruise_time: 0.0,
            };
        }

        if acceleration <= 0.0 || !acceleration.is_finite() {
            return Self {
                distance,
                peak_velocity: max_velocity,
                acceleration: 0.0,
                accel_time: 0.0,
                cruise_time: length / max_velocity,
            };
        }

        let accel_time = max_velocity / acceleration;
        let accel_distance = 0.5 * acceleration * accel_time * accel_time;

        if 2.0 * accel_distance >= length {
            let peak_velocity = (length * acceleration).sqrt();
            Self {
                distance,
                peak_velocity,
                acceleration,
                accel_time: peak_velocity / acceleration,
                cruise_time: 0.0,
            }
        } else {
            Self {
                distance,
                peak_velocity: max_velocity,
                acceleration,
                accel_time,
                cruise_time: (length - 2.0 * accel_distance) / max_velocity,
            }
        }
    }

    /// Signed distance covered by the whole move.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Highest velocity reached.
    pub fn peak_velocity(&self) -> f64 {
        self.peak_velocity
    }

    /// Total move time in seconds.
    pub fn total_secs(&self) -> f64 {
        2.0 * self.accel_time + self.cruise_time
    }

    /// Total move time.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_secs())
    }

    /// Signed displacement from the start after `t` seconds.
    pub fn position_at(&self, t: f64) -> f64 {
        let total = self.total_secs();
        if t <= 0.0 {
            return 0.0;
        }
        if t >= total {
            return self.distance;
        }

        let length = self.distance.abs();
        let accel_distance = 0.5 * self.acceleration * self.accel_time * self.accel_time;
        let travelled = if t < self.accel_time {
            0.5 * self.acceleration * t * t
        } else if t < self.accel_time + self.cruise_time {
            accel_distance + self.peak_velocity * (t - self.accel_time)
        } else {
            let remaining = total - t;
            length - 0.5 * self.acceleration * remaining * remaining
        };

        travelled.min(length).copysign(self.distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn reaches_cruise_velocity() {
        // 0.5 s ramp covers 1.25 units each way, leaving 7.5 units of cruise at 5 u/s
        let p = TrapezoidalProfile::plan(10.0, 5.0, 10.0);
        assert!(approx(p.peak_velocity(), 5.0));
        assert!(approx(p.total_secs(), 2.5));
        assert!(approx(p.position_at(0.5), 1.25));
        assert!(approx(p.position_at(1.25), 5.0));
        assert!(approx(p.position_at(2.5), 10.0));
    }

    #[test]
    fn triangular_when_peak_unreachable() {
        let p = TrapezoidalProfile::plan(100.0, 50.0, 10.0);
        assert!(approx(p.peak_velocity(), 1000.0_f64.sqrt()));
        assert!(approx(p.position_at(p.total_secs() / 2.0), 50.0));
    }

    #[test]
    fn negative_moves_mirror() {
        let p = TrapezoidalProfile::plan(-10.0, 5.0, 10.0);
        assert!(approx(p.position_at(0.5), -1.25));
        assert!(approx(p.position_at(10.0), -10.0));
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(TrapezoidalProfile::plan(0.0, 5.0, 1.0).total_secs(), 0.0);
        assert_eq!(TrapezoidalProfile::plan(5.0, 0.0, 1.0).total_secs(), 0.0);
        let constant = TrapezoidalProfile::plan(10.0, 5.0, 0.0);
        assert!(approx(constant.total_secs(), 2.0));
        assert!(approx(constant.position_at(1.0), 5.0));
    }

    #[test]
    fn position_is_monotonic() {
        let p = TrapezoidalProfile::plan(37.0, 4.0, 3.0);
        let mut last = 0.0;
        let steps = 1000;
        for i in 0..=steps {
            let t = p.total_secs() * i as f64 / steps as f64;
            let x = p.position_at(t);
            assert!(x >= last - 1e-12);
            last = x;
        }
        assert!(approx(last, 37.0));
    }
}
