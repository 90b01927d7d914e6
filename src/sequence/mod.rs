//! Scripted multi-step operations (homing, jogging, probing) and their
//! shared retry machinery. Every sequencer resolves with a structured
//! result; failures carry the step trail and recovery guidance instead of
//! bubbling a bare error to the caller.

pub mod homing;
pub mod jog;
pub mod probe;

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::HostError;
use crate::util::exponential_backoff;

pub const STEP_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const STEP_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
pub const STEP_MAX_ATTEMPTS: u32 = 3;

/// Alarm code embedded in a command failure, if the failing command
/// observed one. The queue folds the offending `ALARM:<n>` line into the
/// error text, so the code travels with the failure itself instead of
/// being re-read from state another task updates.
pub(crate) fn alarm_code_in(message: &str) -> Option<u8> {
    let start = message.find("ALARM:")? + "ALARM:".len();
    let digits: String =
        message[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub critical: bool,
    pub attempts: u32,
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == StepOutcome::Completed
    }
}

/// Run one step. Retryable steps are retried with exponential backoff up
/// to the attempt cap; critical steps gate the rest of the sequence.
pub(crate) async fn run_step<F, Fut>(
    name: &str,
    critical: bool,
    retryable: bool,
    mut action: F,
) -> StepReport
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), HostError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match action().await {
            Ok(()) => {
                return StepReport {
                    name: name.to_string(),
                    critical,
                    attempts,
                    outcome: StepOutcome::Completed,
                }
            }
            Err(error) => {
                if !retryable || attempts >= STEP_MAX_ATTEMPTS {
                    return StepReport {
                        name: name.to_string(),
                        critical,
                        attempts,
                        outcome: StepOutcome::Failed(error.to_string()),
                    };
                }
                warn!(step = name, attempt = attempts, %error, "step failed, retrying");
                sleep(exponential_backoff(
                    STEP_RETRY_BASE_DELAY,
                    attempts - 1,
                    STEP_RETRY_MAX_DELAY,
                ))
                .await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retryable_step_retries_to_the_cap() {
        let calls = AtomicU32::new(0);
        let report = run_step("always-fails", false, true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HostError::CommandTimeout("step".to_string())) }
        })
        .await;
        assert!(!report.succeeded());
        assert_eq!(report.attempts, STEP_MAX_ATTEMPTS);
        assert_eq!(calls.load(Ordering::SeqCst), STEP_MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_can_succeed() {
        let calls = AtomicU32::new(0);
        let report = run_step("flaky", true, true, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(HostError::CommandTimeout("first".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(report.succeeded());
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn alarm_codes_are_read_out_of_failure_text() {
        assert_eq!(alarm_code_in("ALARM:4: Probe fail: probe not in expected initial state."), Some(4));
        assert_eq!(alarm_code_in("hardware error: ALARM:15"), Some(15));
        assert_eq!(alarm_code_in("error:9: G-code locked out during alarm or jog state."), None);
        assert_eq!(alarm_code_in("ALARM:"), None);
    }

    #[tokio::test]
    async fn non_retryable_step_fails_immediately() {
        let report = run_step("one-shot", true, false, || async {
            Err(HostError::MachineNotReady("no".to_string()))
        })
        .await;
        assert!(!report.succeeded());
        assert_eq!(report.attempts, 1);
    }
}
