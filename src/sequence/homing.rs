use std::time::Duration;

use crate::controller::events::Event;
use crate::controller::Controller;
use crate::error::HostError;
use crate::gcode::display::format_value;
use crate::geometry::Axis;

use super::{run_step, StepReport};

pub const HOMING_TIMEOUT: Duration = Duration::from_secs(60);
const SAFE_Z_MARGIN: f64 = 10.0;
const ORIGIN_TOLERANCE_MM: f64 = 0.1;
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct HomingResult {
    pub success: bool,
    pub homed_axes: Vec<Axis>,
    pub steps: Vec<StepReport>,
    pub recovery_instructions: Vec<String>,
}

/// Scripted homing: clear Z, run the homing cycle, wait for the machine to
/// settle, return to the origin and verify it.
pub struct HomingSequencer<'a> {
    controller: &'a Controller,
}

impl<'a> HomingSequencer<'a> {
    pub fn new(controller: &'a Controller) -> HomingSequencer<'a> {
        HomingSequencer { controller }
    }

    pub async fn run(&self, axes: Option<&[Axis]>) -> HomingResult {
        let controller = self.controller;
        let homed_axes: Vec<Axis> = axes.map(<[Axis]>::to_vec).unwrap_or_else(|| Axis::ALL.to_vec());
        let mut steps: Vec<StepReport> = Vec::new();

        let report = run_step("preflight", true, false, || async move {
            if !controller.is_connected() {
                return Err(HostError::ConnectionFailed("not connected".to_string()));
            }
            if controller.machine_state().is_alarm() {
                return Err(HostError::MachineNotReady("machine is in alarm state".to_string()));
            }
            Ok(())
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }

        let safe_z = controller.soft_limits().z.max - SAFE_Z_MARGIN;
        let report = run_step("raise-z", false, true, || async move {
            if controller.expected_position().z >= safe_z {
                return Ok(());
            }
            controller.send("G90", None).await?;
            controller.send(&format!("G0 Z{}", format_value(safe_z)), None).await?;
            Ok(())
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }

        let per_axis = axes.map(<[Axis]>::to_vec);
        let report = run_step("home-cycle", true, false, || {
            let per_axis = per_axis.clone();
            async move {
                match per_axis {
                    None => {
                        controller.send("$H", Some(HOMING_TIMEOUT)).await?;
                    }
                    Some(list) => {
                        for axis in list {
                            controller
                                .send(&format!("$H{}", axis.letter()), Some(HOMING_TIMEOUT))
                                .await?;
                        }
                    }
                }
                Ok(())
            }
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }

        let report = run_step("await-idle", true, false, || async move {
            controller.wait_for_idle(IDLE_POLL, HOMING_TIMEOUT).await
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }
        controller.mark_homed(true);
        controller.resync_expected();

        let report = run_step("return-to-origin", false, true, || async move {
            controller.send("G0 X0 Y0", None).await?;
            controller.wait_for_idle(IDLE_POLL, Duration::from_secs(30)).await
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }

        let verify_axes = homed_axes.clone();
        let report = run_step("verify-origin", true, false, || {
            let verify_axes = verify_axes.clone();
            async move {
                let snapshot = controller.get_status().await?;
                for axis in verify_axes.iter().filter(|&&axis| axis != Axis::Z) {
                    let value = snapshot.machine_position.axis(*axis);
                    if value.abs() > ORIGIN_TOLERANCE_MM {
                        return Err(HostError::HardwareError(format!(
                            "{} is {} mm from the origin after homing",
                            axis,
                            format_value(value)
                        )));
                    }
                }
                Ok(())
            }
        })
        .await;
        if !self.push_step(&mut steps, report) {
            return self.fail(steps).await;
        }

        controller.events().emit(Event::HomingCompleted { success: true });
        HomingResult {
            success: true,
            homed_axes,
            steps,
            recovery_instructions: Vec::new(),
        }
    }

    /// Record the step, emit its event, and say whether to continue.
    fn push_step(&self, steps: &mut Vec<StepReport>, report: StepReport) -> bool {
        self.controller.events().emit(Event::HomingStep {
            step: report.name.clone(),
            success: report.succeeded(),
        });
        let ok = report.succeeded();
        steps.push(report);
        ok
    }

    /// Safe recovery after a failed step: lift the head, unlock, report.
    async fn fail(&self, steps: Vec<StepReport>) -> HomingResult {
        let controller = self.controller;
        let _ = controller.send("$J=G91 Z10 F500", None).await;
        let _ = controller.clear_alarm().await;
        controller.events().emit(Event::HomingCompleted { success: false });
        HomingResult {
            success: false,
            homed_axes: Vec::new(),
            steps,
            recovery_instructions: vec![
                "jog Z clear of the workpiece".to_string(),
                "clear the alarm with $X".to_string(),
                "check the limit switch wiring, then re-run homing".to_string(),
            ],
        }
    }
}
