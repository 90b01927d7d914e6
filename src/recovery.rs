//! Periodic self-diagnosis and scripted recovery. The supervisor maps a
//! broken invariant (lost link, alarm, step loss) to a bounded script of
//! recovery steps and re-diagnoses after running it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::controller::events::Event;
use crate::controller::Controller;
use crate::error::HostError;
use crate::gcode::display::format_value;
use crate::geometry::Axis;
use crate::grbl::MachineState;
use crate::util::push_bounded;

pub const DIAGNOSIS_INTERVAL: Duration = Duration::from_secs(30);
pub const DIAGNOSIS_HISTORY_CAPACITY: usize = 50;
const RECONNECT_WAIT: Duration = Duration::from_secs(30);
const RECOVERY_RAISE_MM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Normal,
    ConnectionLost,
    HardLimitAlarm,
    ProbeAlarm,
    HomingAlarm,
    GenericAlarm,
    StepLossDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Reconnect,
    ClearAlarm,
    RaiseZ,
    FeedHold,
    SoftReset,
    Rehome,
}

#[derive(Debug, Clone)]
pub struct RecoveryStep {
    pub id: u32,
    pub description: String,
    pub action: RecoveryAction,
    pub confirmation_required: bool,
}

#[derive(Debug, Clone)]
pub struct RecoveryDiagnosis {
    pub state: RecoveryState,
    pub severity: Severity,
    pub probable_cause: String,
    pub affected_axes: Vec<Axis>,
    pub recommended_actions: Vec<String>,
    pub steps: Vec<RecoveryStep>,
}

impl RecoveryDiagnosis {
    pub fn is_normal(&self) -> bool {
        self.state == RecoveryState::Normal
    }
}

/// External acknowledger for steps flagged `confirmation_required`.
#[async_trait]
pub trait RecoveryConfirmer: Send + Sync {
    async fn confirm(&self, step: &RecoveryStep) -> bool;
}

/// Confirms everything; the default for unattended operation.
pub struct AutoConfirm;

#[async_trait]
impl RecoveryConfirmer for AutoConfirm {
    async fn confirm(&self, _step: &RecoveryStep) -> bool {
        true
    }
}

fn step(id: u32, description: &str, action: RecoveryAction, confirm: bool) -> RecoveryStep {
    RecoveryStep {
        id,
        description: description.to_string(),
        action,
        confirmation_required: confirm,
    }
}

/// Pure mapping from observed facts to a diagnosis, checked in order:
/// connection, alarm, position mismatch, normal.
pub(crate) fn classify(
    connected: bool,
    machine_state: &MachineState,
    alarm_code: Option<u8>,
    position_mismatch: bool,
) -> RecoveryDiagnosis {
    if !connected {
        return RecoveryDiagnosis {
            state: RecoveryState::ConnectionLost,
            severity: Severity::High,
            probable_cause: "the link to the machine dropped".to_string(),
            affected_axes: Vec::new(),
            recommended_actions: vec![
                "check the cable and power".to_string(),
                "wait for the automatic reconnect".to_string(),
            ],
            steps: vec![step(1, "re-establish the connection", RecoveryAction::Reconnect, false)],
        };
    }
    if machine_state.is_alarm() {
        return match alarm_code {
            Some(code @ (1 | 2)) => RecoveryDiagnosis {
                state: RecoveryState::HardLimitAlarm,
                severity: Severity::Medium,
                probable_cause: format!("alarm {}: travel limit reached", code),
                affected_axes: Axis::ALL.to_vec(),
                recommended_actions: vec![
                    "move the machine off the limit switch".to_string(),
                    "re-home to restore the origin".to_string(),
                ],
                steps: vec![
                    step(1, "unlock the controller", RecoveryAction::ClearAlarm, false),
                    step(2, "raise Z clear of the work", RecoveryAction::RaiseZ, false),
                    step(3, "re-home the machine", RecoveryAction::Rehome, true),
                ],
            },
            Some(code @ (4 | 5)) => RecoveryDiagnosis {
                state: RecoveryState::ProbeAlarm,
                severity: Severity::Medium,
                probable_cause: format!("alarm {}: probe cycle failed", code),
                affected_axes: vec![Axis::Z],
                recommended_actions: vec![
                    "check the probe wiring and target".to_string(),
                    "retry the probe with a longer travel".to_string(),
                ],
                steps: vec![
                    step(1, "unlock the controller", RecoveryAction::ClearAlarm, false),
                    step(2, "raise Z clear of the work", RecoveryAction::RaiseZ, false),
                ],
            },
            Some(code @ (6..=9)) => RecoveryDiagnosis {
                state: RecoveryState::HomingAlarm,
                severity: Severity::High,
                probable_cause: format!("alarm {}: homing cycle failed", code),
                affected_axes: Axis::ALL.to_vec(),
                recommended_actions: vec![
                    "check the limit switches".to_string(),
                    "re-run homing once the switches respond".to_string(),
                ],
                steps: vec![
                    step(1, "unlock the controller", RecoveryAction::ClearAlarm, false),
                    step(2, "re-home the machine", RecoveryAction::Rehome, true),
                ],
            },
            _ => RecoveryDiagnosis {
                state: RecoveryState::GenericAlarm,
                severity: Severity::High,
                probable_cause: match alarm_code {
                    Some(code) => format!("alarm {}", code),
                    None => "alarm with no recorded code".to_string(),
                },
                affected_axes: Vec::new(),
                recommended_actions: vec!["inspect the machine before unlocking".to_string()],
                steps: vec![
                    step(1, "unlock the controller", RecoveryAction::ClearAlarm, true),
                    step(2, "reset the firmware", RecoveryAction::SoftReset, true),
                ],
            },
        };
    }
    if position_mismatch {
        return RecoveryDiagnosis {
            state: RecoveryState::StepLossDetected,
            severity: Severity::High,
            probable_cause: "expected and reported positions diverge beyond tolerance".to_string(),
            affected_axes: Axis::ALL.to_vec(),
            recommended_actions: vec![
                "stop cutting and inspect the part".to_string(),
                "re-home to re-establish the origin".to_string(),
            ],
            steps: vec![
                step(1, "hold the current motion", RecoveryAction::FeedHold, false),
                step(2, "re-home the machine", RecoveryAction::Rehome, true),
            ],
        };
    }
    RecoveryDiagnosis {
        state: RecoveryState::Normal,
        severity: Severity::Low,
        probable_cause: "no fault detected".to_string(),
        affected_axes: Vec::new(),
        recommended_actions: Vec::new(),
        steps: Vec::new(),
    }
}

pub struct RecoverySupervisor {
    controller: Arc<Controller>,
    confirmer: Arc<dyn RecoveryConfirmer>,
    history: Mutex<VecDeque<RecoveryDiagnosis>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoverySupervisor {
    pub fn new(
        controller: Arc<Controller>,
        confirmer: Arc<dyn RecoveryConfirmer>,
    ) -> Arc<RecoverySupervisor> {
        Arc::new(RecoverySupervisor {
            controller,
            confirmer,
            history: Mutex::new(VecDeque::new()),
            task: Mutex::new(None),
        })
    }

    /// Inspect the controller and record the diagnosis.
    pub fn diagnose(&self) -> RecoveryDiagnosis {
        let controller = &self.controller;
        let diagnosis = classify(
            controller.is_connected(),
            &controller.machine_state(),
            controller.last_alarm_code(),
            controller.check_position_mismatch(),
        );
        push_bounded(
            &mut self.history.lock().unwrap(),
            DIAGNOSIS_HISTORY_CAPACITY,
            diagnosis.clone(),
        );
        diagnosis
    }

    pub fn history(&self) -> Vec<RecoveryDiagnosis> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// Start the periodic diagnosis loop. Critical findings run their
    /// script automatically; anything else raises `RecoveryNeeded` and
    /// waits for an explicit `auto_recover` call.
    pub fn start(self: &Arc<Self>, interval: Option<Duration>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let period = interval.unwrap_or(DIAGNOSIS_INTERVAL);
        let supervisor = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            loop {
                sleep(period).await;
                let Some(supervisor) = supervisor.upgrade() else { return };
                if !supervisor.controller.is_connected() {
                    continue;
                }
                let diagnosis = supervisor.diagnose();
                if diagnosis.is_normal() {
                    continue;
                }
                if diagnosis.severity == Severity::Critical {
                    let _ = supervisor.execute_recovery(&diagnosis).await;
                } else {
                    supervisor
                        .controller
                        .events()
                        .emit(Event::RecoveryNeeded(diagnosis));
                }
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Diagnose now and, if something is wrong, run the script.
    pub async fn auto_recover(&self) -> Result<RecoveryDiagnosis, HostError> {
        let diagnosis = self.diagnose();
        if diagnosis.is_normal() {
            return Ok(diagnosis);
        }
        self.execute_recovery(&diagnosis).await?;
        Ok(self.diagnose())
    }

    /// Run the steps in order, yielding to the confirmer where a step
    /// requires it, then re-diagnose. Still-broken means failure.
    pub async fn execute_recovery(&self, diagnosis: &RecoveryDiagnosis) -> Result<(), HostError> {
        let controller = &self.controller;
        controller.events().emit(Event::RecoveryStarted(diagnosis.state));
        for step in &diagnosis.steps {
            if step.confirmation_required && !self.confirmer.confirm(step).await {
                let message = format!("step {} ({}) was not confirmed", step.id, step.description);
                controller.events().emit(Event::RecoveryFailed(message.clone()));
                return Err(HostError::Cancelled);
            }
            debug!(step = step.id, action = ?step.action, "recovery step");
            if let Err(error) = self.apply(step.action).await {
                warn!(step = step.id, %error, "recovery step failed");
                controller.events().emit(Event::RecoveryFailed(error.to_string()));
                return Err(error);
            }
        }
        let after = self.diagnose();
        if after.is_normal() {
            controller.events().emit(Event::RecoveryCompleted);
            Ok(())
        } else {
            let message = format!("machine still reports {:?} after recovery", after.state);
            controller.events().emit(Event::RecoveryFailed(message.clone()));
            Err(HostError::HardwareError(message))
        }
    }

    async fn apply(&self, action: RecoveryAction) -> Result<(), HostError> {
        let controller = &self.controller;
        match action {
            RecoveryAction::Reconnect => {
                // The link reconnects on its own; wait for it to come back.
                let deadline = Instant::now() + RECONNECT_WAIT;
                while !controller.is_connected() {
                    if Instant::now() >= deadline {
                        return Err(HostError::ConnectionTimeout);
                    }
                    sleep(Duration::from_millis(500)).await;
                }
                Ok(())
            }
            RecoveryAction::ClearAlarm => controller.clear_alarm().await.map(drop),
            RecoveryAction::RaiseZ => controller
                .send(&format!("$J=G91 Z{} F500", format_value(RECOVERY_RAISE_MM)), None)
                .await
                .map(drop),
            RecoveryAction::FeedHold => controller.feed_hold().await,
            RecoveryAction::SoftReset => controller.soft_reset().await,
            RecoveryAction::Rehome => {
                let result = controller.home(None).await;
                if result.success {
                    Ok(())
                } else {
                    Err(HostError::HardwareError("homing failed during recovery".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disconnection_outranks_everything() {
        let diagnosis = classify(false, &MachineState::Alarm(Some(1)), Some(1), true);
        assert_eq!(diagnosis.state, RecoveryState::ConnectionLost);
        assert_eq!(diagnosis.severity, Severity::High);
    }

    #[test]
    fn alarm_codes_map_to_their_failure_families() {
        let hard = classify(true, &MachineState::Alarm(Some(1)), Some(1), false);
        assert_eq!(hard.state, RecoveryState::HardLimitAlarm);
        assert_eq!(hard.severity, Severity::Medium);
        let probe = classify(true, &MachineState::Alarm(Some(5)), Some(5), false);
        assert_eq!(probe.state, RecoveryState::ProbeAlarm);
        assert_eq!(probe.affected_axes, vec![Axis::Z]);
        let homing = classify(true, &MachineState::Alarm(Some(9)), Some(9), false);
        assert_eq!(homing.state, RecoveryState::HomingAlarm);
        assert_eq!(homing.severity, Severity::High);
        let generic = classify(true, &MachineState::Alarm(None), None, false);
        assert_eq!(generic.state, RecoveryState::GenericAlarm);
        assert_eq!(generic.severity, Severity::High);
    }

    #[test]
    fn step_loss_requires_a_live_link_and_no_alarm() {
        let diagnosis = classify(true, &MachineState::Idle, None, true);
        assert_eq!(diagnosis.state, RecoveryState::StepLossDetected);
        assert_eq!(diagnosis.severity, Severity::High);
        assert!(diagnosis.steps.iter().any(|s| s.action == RecoveryAction::Rehome));
    }

    #[test]
    fn healthy_machine_is_normal() {
        let diagnosis = classify(true, &MachineState::Idle, None, false);
        assert!(diagnosis.is_normal());
        assert!(diagnosis.steps.is_empty());
    }

    #[test]
    fn scripts_execute_in_declared_order() {
        let diagnosis = classify(true, &MachineState::Alarm(Some(1)), Some(1), false);
        let ids: Vec<u32> = diagnosis.steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(diagnosis.steps[2].confirmation_required);
    }
}
