//! Joystick input loop.
//!
//! Two digital inputs select the jog direction. Motion starts only on an
//! exclusive single-direction input; no input or both inputs stop the axis.

use crate::hardware::MotionPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Direction requested by the joystick inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickInput {
    /// Only the positive input is active
    Positive,
    /// Only the negative input is active
    Negative,
    /// No input, or both inputs
    Neutral,
}

impl JoystickInput {
    /// Decode the two input levels.
    pub fn from_levels(positive: bool, negative: bool) -> Self {
        match (positive, negative) {
            (true, false) => JoystickInput::Positive,
            (false, true) => JoystickInput::Negative,
            _ => JoystickInput::Neutral,
        }
    }
}

/// Inputs, jog speed and cadence of the loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JoystickSettings {
    pub positive_input: u16,
    pub negative_input: u16,
    /// Jog speed magnitude (pulses/ms)
    pub velocity: f64,
    pub poll: Duration,
}

async fn read_input(port: &dyn MotionPort, settings: &JoystickSettings) -> JoystickInput {
    let positive = port.get_digital_input(settings.positive_input).await;
    let negative = port.get_digital_input(settings.negative_input).await;
    match (positive, negative) {
        (Ok(p), Ok(n)) => JoystickInput::from_levels(p, n),
        (Err(err), _) | (_, Err(err)) => {
            warn!(%err, "Joystick input read failed, treating as neutral");
            JoystickInput::Neutral
        }
    }
}

async fn apply(port: &dyn MotionPort, input: JoystickInput, velocity: f64) -> crate::RigResult<()> {
    match input {
        JoystickInput::Positive => {
            port.set_velocity(velocity).await?;
            port.commit().await
        }
        JoystickInput::Negative => {
            port.set_velocity(-velocity).await?;
            port.commit().await
        }
        JoystickInput::Neutral => port.stop().await,
    }
}

/// Poll the inputs until cancelled, driving jog velocity on every change.
pub(crate) async fn run(
    port: Arc<dyn MotionPort>,
    settings: JoystickSettings,
    cancel: CancellationToken,
) {
    let mut ticker = interval(settings.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current = JoystickInput::Neutral;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let input = read_input(port.as_ref(), &settings).await;
        if input == current {
            continue;
        }
        match apply(port.as_ref(), input, settings.velocity).await {
            Ok(()) => {
                debug!(?input, "Joystick direction changed");
                current = input;
            }
            Err(err) => warn!(%err, ?input, "Joystick command failed"),
        }
    }
    debug!("Joystick loop stopped");
}
