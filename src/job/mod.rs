//! Job model: a parsed program plus execution policy and bookkeeping. The
//! runner owns the current job, the waiting queue and the bounded history.

pub mod runner;
pub mod state;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::gcode::{ParseResult, SafetyScan};
use crate::geometry::Position;

pub use runner::JobRunner;
pub use state::{JobState, MemoryStateSink, StateSink};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

/// Execution policy chosen when the job is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Fail the load on the first parse error.
    pub strict: bool,
    pub require_homed: bool,
    pub stop_on_error: bool,
    pub retry_on_error: bool,
    pub retry_count: u8,
    pub pre_job_commands: Vec<String>,
}

impl Default for JobOptions {
    fn default() -> JobOptions {
        JobOptions {
            strict: false,
            require_homed: true,
            stop_on_error: true,
            retry_on_error: false,
            retry_count: 3,
            pre_job_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub blocks_executed: usize,
    pub errors: usize,
    pub retries: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub source: String,
    pub parse: ParseResult,
    pub safety: SafetyScan,
    pub progress_percent: f64,
    pub status: JobStatus,
    pub options: JobOptions,
    pub created_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
    pub stats: ExecutionStats,
    pub pause_position: Option<Position>,
}

impl Job {
    pub fn total_blocks(&self) -> usize {
        self.parse.blocks.len()
    }
}
