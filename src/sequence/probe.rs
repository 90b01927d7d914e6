use std::time::Duration;

use tokio::time::sleep;

use crate::controller::events::Event;
use crate::controller::Controller;
use crate::error::HostError;
use crate::gcode::display::format_value;
use crate::geometry::{Axis, Position};

pub const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const GRID_POINT_PAUSE: Duration = Duration::from_millis(200);
const PRE_PROBE_RAISE_MM: f64 = 10.0;
const POST_PROBE_RAISE_MM: f64 = 5.0;
const GRID_PROBE_DEPTH_MM: f64 = -50.0;
const GRID_TRAVEL_FEED: f64 = 1000.0;
const GRID_CLEARANCE_Z: f64 = 10.0;
const GRID_FINAL_Z: f64 = 20.0;
const FLATNESS_WARNING_MM: f64 = 5.0;
const POINT_ANOMALY_MM: f64 = 2.0;
const IDLE_POLL: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    InitialState,
    NoContact,
    LimitTriggered,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub contact: bool,
    pub position: Position,
    pub failure: Option<ProbeFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct GridProbeOptions {
    pub grid_x: f64,
    pub grid_y: f64,
    pub step: f64,
    pub feed: f64,
}

#[derive(Debug, Clone)]
pub struct GridPoint {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl GridPoint {
    pub fn succeeded(&self) -> bool {
        self.z.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GridProbeResult {
    pub points: Vec<GridPoint>,
    pub average_height: f64,
    pub flatness: f64,
    pub warnings: Vec<String>,
}

/// Lattice offsets along one axis, centred so the scan straddles the
/// origin. A step larger than the extent degenerates to the centre point.
pub(crate) fn grid_offsets(extent: f64, step: f64) -> Vec<f64> {
    let mut offsets = Vec::new();
    let mut value = 0.0;
    while value <= extent + 1e-9 {
        offsets.push(value);
        value += step;
    }
    let span = offsets.last().copied().unwrap_or(0.0);
    offsets.into_iter().map(|v| v - span / 2.0).collect()
}

pub(crate) fn grid_points(options: &GridProbeOptions) -> Vec<(f64, f64)> {
    let xs = grid_offsets(options.grid_x, options.step);
    let ys = grid_offsets(options.grid_y, options.step);
    ys.iter().flat_map(|&y| xs.iter().map(move |&x| (x, y))).collect()
}

/// Single probes and grid scans over `G38.2`.
pub struct ProbingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> ProbingSequencer<'a> {
    pub fn new(controller: &'a Controller) -> ProbingSequencer<'a> {
        ProbingSequencer { controller }
    }

    /// Probe one axis. Pre-flight violations fail synchronously; runtime
    /// failures resolve with a structured outcome after scripted recovery.
    pub async fn probe(
        &self,
        axis: Axis,
        feed: f64,
        distance: f64,
    ) -> Result<ProbeOutcome, HostError> {
        let controller = self.controller;
        if !controller.is_connected() {
            return Err(HostError::ConnectionFailed("not connected".to_string()));
        }
        if !controller.machine_state().is_idle() {
            return Err(HostError::MachineNotReady(format!(
                "machine is {}, not idle",
                controller.machine_state().name()
            )));
        }
        if !controller.is_homed() {
            return Err(HostError::MachineNotReady(
                "machine must be homed before probing".to_string(),
            ));
        }
        if axis == Axis::Z && distance >= 0.0 {
            return Err(HostError::SafetyViolation(
                "z probe distance must be negative".to_string(),
            ));
        }
        controller.events().emit(Event::ProbeStarted { axis });
        let raise = format!("$J=G91 Z{} F500", format_value(PRE_PROBE_RAISE_MM));
        if let Err(error) = controller.send(&raise, None).await {
            return Ok(self.fail(ProbeFailure::Unknown, error.to_string()).await);
        }
        let _ = controller.wait_for_idle(IDLE_POLL, IDLE_WAIT).await;
        let command = format!(
            "G38.2 {}{} F{}",
            axis.letter(),
            format_value(distance),
            format_value(feed)
        );
        match controller.send(&command, Some(PROBE_COMMAND_TIMEOUT)).await {
            Ok(response) => {
                let report = response.probe_report();
                // No PRB capture still counts as contact when the device
                // accepted the cycle without an error.
                let contact = report.as_ref().map_or(true, |r| r.contact);
                let position = report
                    .map(|r| Position::from_array(&r.position))
                    .or_else(|| controller.last_known_position())
                    .unwrap_or_else(|| controller.expected_position());
                let lift = format!("$J=G91 Z{} F500", format_value(POST_PROBE_RAISE_MM));
                let _ = controller.send(&lift, None).await;
                let outcome =
                    ProbeOutcome { success: true, contact, position, failure: None };
                controller.events().emit(Event::ProbeCompleted(outcome.clone()));
                Ok(outcome)
            }
            Err(error) => {
                let failure = classify(&error);
                Ok(self.fail(failure, error.to_string()).await)
            }
        }
    }

    async fn fail(&self, failure: ProbeFailure, message: String) -> ProbeOutcome {
        let controller = self.controller;
        let _ = controller.clear_alarm().await;
        let lift = format!("$J=G91 Z{} F500", format_value(POST_PROBE_RAISE_MM));
        let _ = controller.send(&lift, None).await;
        controller.events().emit(Event::ProbeFailed { failure, message });
        ProbeOutcome {
            success: false,
            contact: false,
            position: controller.expected_position(),
            failure: Some(failure),
        }
    }

    /// Scan a centred lattice, probing Z at each point. A failed point is
    /// recovered and skipped; the scan continues.
    pub async fn probe_grid(
        &self,
        options: GridProbeOptions,
    ) -> Result<GridProbeResult, HostError> {
        let controller = self.controller;
        if options.grid_x <= 0.0 || options.grid_y <= 0.0 || options.step <= 0.0 {
            return Err(HostError::SafetyViolation(
                "grid dimensions and step must be positive".to_string(),
            ));
        }
        if options.feed <= 0.0 {
            return Err(HostError::SafetyViolation("probe feed must be positive".to_string()));
        }
        let limits = controller.soft_limits();
        if options.grid_x > limits.x.span() || options.grid_y > limits.y.span() {
            return Err(HostError::SafetyViolation(
                "grid exceeds the soft envelope".to_string(),
            ));
        }
        if !controller.is_connected() {
            return Err(HostError::ConnectionFailed("not connected".to_string()));
        }
        if !controller.is_homed() {
            return Err(HostError::MachineNotReady(
                "machine must be homed before probing".to_string(),
            ));
        }
        let targets = grid_points(&options);
        let total = targets.len();
        let mut points = Vec::with_capacity(total);
        for (index, &(x, y)) in targets.iter().enumerate() {
            controller.events().emit(Event::GridProbeProgress { index, total, x, y });
            let z = self.probe_point(x, y, &options).await;
            points.push(GridPoint { x, y, z });
            sleep(GRID_POINT_PAUSE).await;
        }
        let _ = controller.send("G0 X0 Y0", None).await;
        let _ = controller.send(&format!("G0 Z{}", format_value(GRID_FINAL_Z)), None).await;
        Ok(summarise(points))
    }

    async fn probe_point(&self, x: f64, y: f64, options: &GridProbeOptions) -> Option<f64> {
        let controller = self.controller;
        let travel = format!(
            "G0 X{} Y{} F{}",
            format_value(x),
            format_value(y),
            format_value(GRID_TRAVEL_FEED)
        );
        if controller.send(&travel, None).await.is_err() {
            return self.abort_point().await;
        }
        if controller.wait_for_idle(IDLE_POLL, IDLE_WAIT).await.is_err() {
            return self.abort_point().await;
        }
        let probe = format!(
            "G38.2 Z{} F{}",
            format_value(GRID_PROBE_DEPTH_MM),
            format_value(options.feed)
        );
        match controller.send(&probe, Some(PROBE_COMMAND_TIMEOUT)).await {
            Ok(response) => {
                let z = response.probe_report().map(|r| Position::from_array(&r.position).z);
                let _ = controller
                    .send(&format!("G0 Z{}", format_value(GRID_CLEARANCE_Z)), None)
                    .await;
                z
            }
            Err(_) => self.abort_point().await,
        }
    }

    async fn abort_point(&self) -> Option<f64> {
        let controller = self.controller;
        let _ = controller.clear_alarm().await;
        let _ = controller.send(&format!("G0 Z{}", format_value(GRID_CLEARANCE_Z)), None).await;
        None
    }
}

fn summarise(points: Vec<GridPoint>) -> GridProbeResult {
    let heights: Vec<f64> = points.iter().filter_map(|p| p.z).collect();
    let average_height = if heights.is_empty() {
        0.0
    } else {
        heights.iter().sum::<f64>() / heights.len() as f64
    };
    let flatness = match (
        heights.iter().cloned().reduce(f64::min),
        heights.iter().cloned().reduce(f64::max),
    ) {
        (Some(min), Some(max)) => max - min,
        _ => 0.0,
    };
    let mut warnings = Vec::new();
    let failed = points.iter().filter(|p| !p.succeeded()).count();
    if failed > 0 {
        warnings.push(format!("{} probe points failed", failed));
    }
    if flatness > FLATNESS_WARNING_MM {
        warnings.push(format!("surface flatness {:.3} mm exceeds {} mm", flatness, FLATNESS_WARNING_MM));
    }
    for point in &points {
        if let Some(z) = point.z {
            if (z - average_height).abs() > POINT_ANOMALY_MM {
                warnings.push(format!(
                    "point ({}, {}) deviates {:.3} mm from the surface mean",
                    format_value(point.x),
                    format_value(point.y),
                    (z - average_height).abs()
                ));
            }
        }
    }
    GridProbeResult { points, average_height, flatness, warnings }
}

/// The failure carries the `ALARM:<n>` line it terminated on, so the
/// classification never consults state another task may not have updated
/// yet.
fn classify(error: &HostError) -> ProbeFailure {
    if matches!(error, HostError::CommandTimeout(_)) {
        return ProbeFailure::Timeout;
    }
    let message = error.to_string();
    match super::alarm_code_in(&message) {
        Some(4) => ProbeFailure::InitialState,
        Some(5) => ProbeFailure::NoContact,
        Some(1) | Some(2) => ProbeFailure::LimitTriggered,
        _ => {
            if message.contains("limit") {
                ProbeFailure::LimitTriggered
            } else {
                ProbeFailure::Unknown
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(grid_x: f64, grid_y: f64, step: f64) -> GridProbeOptions {
        GridProbeOptions { grid_x, grid_y, step, feed: 100.0 }
    }

    #[test]
    fn grid_is_centred_on_the_origin() {
        let points = grid_points(&options(20.0, 20.0, 10.0));
        assert_eq!(points.len(), 9);
        assert_eq!(points[0], (-10.0, -10.0));
        assert_eq!(points[4], (0.0, 0.0));
        assert_eq!(points[8], (10.0, 10.0));
    }

    #[test]
    fn oversized_step_collapses_to_the_centre() {
        let points = grid_points(&options(10.0, 10.0, 50.0));
        assert_eq!(points, vec![(0.0, 0.0)]);
    }

    #[test]
    fn step_not_dividing_extent_stays_centred() {
        let points = grid_points(&options(10.0, 10.0, 4.0));
        // Offsets 0, 4, 8 centre to -4, 0, 4.
        let xs: Vec<f64> = points.iter().take(3).map(|p| p.0).collect();
        assert_eq!(xs, vec![-4.0, 0.0, 4.0]);
    }

    #[test]
    fn summary_metrics() {
        let result = summarise(vec![
            GridPoint { x: 0.0, y: 0.0, z: Some(1.0) },
            GridPoint { x: 1.0, y: 0.0, z: Some(2.0) },
            GridPoint { x: 0.0, y: 1.0, z: Some(3.0) },
            GridPoint { x: 1.0, y: 1.0, z: None },
        ]);
        assert!((result.average_height - 2.0).abs() < 1e-12);
        assert!((result.flatness - 2.0).abs() < 1e-12);
        assert!(result.warnings.iter().any(|w| w.contains("1 probe points failed")));
    }

    #[test]
    fn flatness_and_anomaly_warnings() {
        let result = summarise(vec![
            GridPoint { x: 0.0, y: 0.0, z: Some(0.0) },
            GridPoint { x: 1.0, y: 0.0, z: Some(8.0) },
        ]);
        assert!(result.warnings.iter().any(|w| w.contains("flatness")));
        assert!(result.warnings.iter().any(|w| w.contains("deviates")));
    }

    #[test]
    fn classification_reads_the_alarm_out_of_the_failure() {
        let alarm = |code: u8| {
            HostError::HardwareError(format!("ALARM:{}: {}", code, crate::grbl::alarm_text(code)))
        };
        assert_eq!(classify(&alarm(4)), ProbeFailure::InitialState);
        assert_eq!(classify(&alarm(5)), ProbeFailure::NoContact);
        assert_eq!(classify(&alarm(1)), ProbeFailure::LimitTriggered);
        assert_eq!(
            classify(&HostError::CommandTimeout("G38.2".to_string())),
            ProbeFailure::Timeout
        );
        assert_eq!(
            classify(&HostError::HardwareError(
                "error:33: Motion command has an invalid target.".to_string()
            )),
            ProbeFailure::Unknown
        );
    }
}
