//! In-process event fan-out. Subscribers receive events in the order the
//! originating lines arrived; a slow subscriber lags rather than blocking
//! the pipeline.

use tokio::sync::broadcast;
use tracing::debug;

use crate::controller::StatusSnapshot;
use crate::geometry::Axis;
use crate::grbl::ProbeReport;
use crate::job::JobStatus;
use crate::recovery::{RecoveryDiagnosis, RecoveryState};
use crate::sequence::probe::{ProbeFailure, ProbeOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Disconnected,
    Status(StatusSnapshot),
    StatusRaw(String),
    Alarm { code: u8, message: String },
    Warning(String),
    ProbeReport(ProbeReport),
    JobProgress { job_id: u64, percent: f64, blocks_executed: usize, total_blocks: usize },
    JobComplete { job_id: u64, status: JobStatus },
    EmergencyStop,
    FeedHold,
    SoftReset,
    ProbeStarted { axis: Axis },
    ProbeCompleted(ProbeOutcome),
    ProbeFailed { failure: ProbeFailure, message: String },
    GridProbeProgress { index: usize, total: usize, x: f64, y: f64 },
    HomingStep { step: String, success: bool },
    HomingCompleted { success: bool },
    RecoveryNeeded(RecoveryDiagnosis),
    RecoveryStarted(RecoveryState),
    RecoveryCompleted,
    RecoveryFailed(String),
    Error(String),
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}
