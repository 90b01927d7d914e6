//! Serialised job state for auto-save and crash recovery, plus the sink
//! boundary the embedding application implements to persist it.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{JobId, JobStatus};
use crate::error::HostError;
use crate::geometry::Position;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub name: String,
    pub progress_percent: f64,
    pub status: JobStatus,
    pub paused: bool,
    pub pause_position: Option<Position>,
    pub last_machine_state: Option<String>,
    pub blocks_executed: usize,
    pub total_blocks: usize,
    pub errors: usize,
    pub retries: usize,
    pub saved_at: DateTime<Local>,
}

impl JobState {
    pub fn autosave_filename(&self) -> String {
        format!("autosave_{}.json", self.job_id)
    }

    pub fn crash_filename(&self) -> String {
        format!("crash_recovery_{}_{}.json", self.job_id, self.saved_at.timestamp())
    }

    /// The document a file-backed sink writes.
    pub fn to_json(&self) -> Result<String, HostError> {
        serde_json::to_string_pretty(self)
            .map_err(|error| HostError::HardwareError(format!("state encoding failed: {}", error)))
    }
}

/// Where job state goes. The core hands over a filename convention and a
/// document; the embedder decides what a "file" is.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn save(&self, filename: &str, state: &JobState) -> Result<(), HostError>;
    async fn load_latest(&self, job_id: Option<JobId>) -> Result<Option<JobState>, HostError>;
}

/// Keeps snapshots in memory. The default sink, and what the tests use.
#[derive(Default)]
pub struct MemoryStateSink {
    saved: Mutex<Vec<(String, JobState)>>,
}

impl MemoryStateSink {
    pub fn new() -> MemoryStateSink {
        MemoryStateSink::default()
    }

    pub fn snapshots(&self) -> Vec<(String, JobState)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateSink for MemoryStateSink {
    async fn save(&self, filename: &str, state: &JobState) -> Result<(), HostError> {
        self.saved.lock().unwrap().push((filename.to_string(), state.clone()));
        Ok(())
    }

    async fn load_latest(&self, job_id: Option<JobId>) -> Result<Option<JobState>, HostError> {
        let saved = self.saved.lock().unwrap();
        Ok(saved
            .iter()
            .rev()
            .find(|(_, state)| job_id.map_or(true, |id| state.job_id == id))
            .map(|(_, state)| state.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state(job_id: JobId) -> JobState {
        JobState {
            job_id,
            name: "part".to_string(),
            progress_percent: 33.3,
            status: JobStatus::Stopped,
            paused: false,
            pause_position: Some(Position::new(1.0, 2.0, 3.0)),
            last_machine_state: Some("Idle".to_string()),
            blocks_executed: 1,
            total_blocks: 3,
            errors: 0,
            retries: 0,
            saved_at: Local::now(),
        }
    }

    #[test]
    fn filename_conventions() {
        let state = state(7);
        assert_eq!(state.autosave_filename(), "autosave_7.json");
        assert!(state.crash_filename().starts_with("crash_recovery_7_"));
        assert!(state.crash_filename().ends_with(".json"));
    }

    #[test]
    fn round_trips_through_json() {
        let state = state(7);
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: JobState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, 7);
        assert_eq!(decoded.pause_position, state.pause_position);
        assert_eq!(decoded.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn memory_sink_returns_the_latest_snapshot() {
        let sink = MemoryStateSink::new();
        let mut first = state(1);
        first.progress_percent = 10.0;
        sink.save(&first.autosave_filename(), &first).await.unwrap();
        let mut second = state(1);
        second.progress_percent = 50.0;
        sink.save(&second.autosave_filename(), &second).await.unwrap();
        let loaded = sink.load_latest(Some(1)).await.unwrap().unwrap();
        assert_eq!(loaded.progress_percent, 50.0);
        assert!(sink.load_latest(Some(9)).await.unwrap().is_none());
    }
}
