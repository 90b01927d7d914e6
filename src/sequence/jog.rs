use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::controller::Controller;
use crate::error::HostError;
use crate::gcode::display::format_value;
use crate::geometry::{Axis, Position};

pub const JOG_MIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOG_TIME_FACTOR: f64 = 1.5;
const RECOVERY_RAISE: &str = "$J=G91 Z10 F500";

/// Requested jog deltas, millimetres. Jogs are always incremental.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JogRequest {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl JogRequest {
    pub fn axes(&self) -> impl Iterator<Item = (Axis, f64)> {
        [(Axis::X, self.x), (Axis::Y, self.y), (Axis::Z, self.z)]
            .into_iter()
            .filter_map(|(axis, delta)| delta.map(|d| (axis, d)))
    }

    pub fn is_empty(&self) -> bool {
        self.axes().next().is_none()
    }

    pub fn max_distance(&self) -> f64 {
        self.axes().map(|(_, delta)| delta.abs()).fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JogFailure {
    Limit(String),
    Alarm(String),
    Other(String),
}

#[derive(Debug, Clone)]
pub struct JogResult {
    pub success: bool,
    pub command: String,
    pub failure: Option<JogFailure>,
}

pub(crate) fn jog_line(request: &JogRequest, feed: f64) -> String {
    let mut line = String::from("$J=G91");
    for (axis, delta) in request.axes() {
        line.push_str(&format!(" {}{}", axis.letter(), format_value(delta)));
    }
    line.push_str(&format!(" F{}", format_value(feed)));
    line
}

/// 1.5x the naive travel time, with a ten-second floor.
pub(crate) fn jog_timeout(request: &JogRequest, feed: f64) -> Duration {
    let millis = request.max_distance() / feed * 60.0 * 1000.0 * JOG_TIME_FACTOR;
    Duration::from_millis(millis as u64).max(JOG_MIN_TIMEOUT)
}

struct JogGuard<'a>(&'a AtomicBool);

impl Drop for JogGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Manual moves with the single-outstanding-jog discipline.
pub struct JoggingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> JoggingSequencer<'a> {
    pub fn new(controller: &'a Controller) -> JoggingSequencer<'a> {
        JoggingSequencer { controller }
    }

    pub async fn run(&self, request: JogRequest, feed: f64) -> Result<JogResult, HostError> {
        let controller = self.controller;
        if request.is_empty() {
            return Err(HostError::InvalidGCode("jog with no axis words".to_string()));
        }
        if controller.jog_flag().swap(true, Ordering::SeqCst) {
            return Err(HostError::MachineNotReady("a jog is already in progress".to_string()));
        }
        let _guard = JogGuard(controller.jog_flag());
        if !controller.is_connected() {
            return Err(HostError::ConnectionFailed("not connected".to_string()));
        }
        if !controller.machine_state().is_idle() {
            return Err(HostError::MachineNotReady(format!(
                "machine is {}, not idle",
                controller.machine_state().name()
            )));
        }
        if feed <= 0.0 {
            return Err(HostError::SafetyViolation("jog feed must be positive".to_string()));
        }
        if feed > controller.speed_limits().max_jog_rate {
            return Err(HostError::SafetyViolation(format!(
                "jog feed {} exceeds limit {}",
                feed,
                controller.speed_limits().max_jog_rate
            )));
        }
        let projected = request
            .axes()
            .fold(controller.expected_position(), |mut position, (axis, delta)| {
                position.set_axis(axis, position.axis(axis) + delta);
                position
            });
        if !controller.soft_limits().contains(&projected) {
            return Err(HostError::SafetyViolation(format!(
                "jog target {} exceeds soft limits",
                projected
            )));
        }
        let command = jog_line(&request, feed);
        match controller.send(&command, Some(jog_timeout(&request, feed))).await {
            Ok(_) => Ok(JogResult { success: true, command, failure: None }),
            Err(error) => {
                let failure = classify(&error);
                self.recover(&failure).await;
                Ok(JogResult { success: false, command, failure: Some(failure) })
            }
        }
    }

    async fn recover(&self, failure: &JogFailure) {
        let controller = self.controller;
        match failure {
            JogFailure::Limit(_) => {
                let _ = controller.clear_alarm().await;
            }
            JogFailure::Alarm(_) => {
                let _ = controller.clear_alarm().await;
                let _ = controller.send(RECOVERY_RAISE, None).await;
            }
            JogFailure::Other(_) => {
                let _ = controller.feed_hold().await;
            }
        }
    }
}

/// Classification works from the failure text alone; any alarm the jog
/// terminated on is embedded there by the queue.
fn classify(error: &HostError) -> JogFailure {
    let message = error.to_string();
    let alarm = super::alarm_code_in(&message);
    if matches!(alarm, Some(1) | Some(2))
        || message.contains("limit")
        || message.contains("travel")
    {
        JogFailure::Limit(message)
    } else if alarm.is_some() {
        JogFailure::Alarm(message)
    } else {
        JogFailure::Other(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jog_line_orders_axes_and_trims_numbers() {
        let request = JogRequest { x: Some(10.0), y: Some(-5.0), z: None };
        assert_eq!(jog_line(&request, 1000.0), "$J=G91 X10 Y-5 F1000");
        let request = JogRequest { z: Some(2.5), ..JogRequest::default() };
        assert_eq!(jog_line(&request, 500.0), "$J=G91 Z2.5 F500");
    }

    #[test]
    fn jog_timeout_scales_with_distance() {
        let request = JogRequest { x: Some(100.0), ..JogRequest::default() };
        // 100 mm at 100 mm/min is one minute; padded by half again.
        assert_eq!(jog_timeout(&request, 100.0), Duration::from_millis(90_000));
        // Short hops floor at ten seconds.
        let short = JogRequest { x: Some(1.0), ..JogRequest::default() };
        assert_eq!(jog_timeout(&short, 1000.0), JOG_MIN_TIMEOUT);
    }

    #[test]
    fn classification_prefers_limit_evidence() {
        let limit = classify(&HostError::HardwareError(
            "error:15: Jog target exceeds machine travel.".to_string(),
        ));
        assert!(matches!(limit, JogFailure::Limit(_)));
        let alarm = classify(&HostError::HardwareError(
            "ALARM:3: Reset while in motion; position may be lost.".to_string(),
        ));
        assert!(matches!(alarm, JogFailure::Alarm(_)));
        let other = classify(&HostError::CommandTimeout("$J=...".to_string()));
        assert!(matches!(other, JogFailure::Other(_)));
    }
}
