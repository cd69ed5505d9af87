use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Serialize)]
struct RunnerStatus<'a> {
    mode: RunnerMode,
    current_job: Option<JobId>,
    queued_jobs: &'a [JobId],
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

/// ISO 8601 with millisecond precision.
fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Persists the queue state to a JSON file so other processes can observe it.
///
/// Writes are atomic (temp file + rename). Failures are logged, never fatal.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    current_job: Option<JobId>,
    queued_jobs: Vec<JobId>,
}

impl StatusTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                current_job: None,
                queued_jobs: Vec::new(),
            }),
        }
    }

    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    /// Record the running job and the pending ids in queue order.
    pub async fn set_jobs(&self, current_job: Option<JobId>, queued_jobs: Vec<JobId>) {
        let mut state = self.state.lock().await;
        state.current_job = current_job;
        state.queued_jobs = queued_jobs;
        self.write_status(&state).await;
    }

    async fn write_status(&self, state: &MutableState) {
        let status = RunnerStatus {
            mode: state.mode,
            current_job: state.current_job,
            queued_jobs: &state.queued_jobs,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_status(path: &std::path::Path) -> serde_json::Value {
        let content = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn initial_status_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let status = read_status(&path);
        assert_eq!(status["mode"], "running");
        assert!(status["current_job"].is_null());
        assert!(status["queued_jobs"].as_array().unwrap().is_empty());
        assert!(!dir.path().join("status.tmp").exists());
    }

    #[tokio::test]
    async fn set_jobs_records_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.set_jobs(Some(3), vec![5, 4]).await;
        let status = read_status(&path);
        assert_eq!(status["current_job"], 3);
        assert_eq!(status["queued_jobs"], serde_json::json!([5, 4]));

        tracker.set_jobs(None, vec![]).await;
        let status = read_status(&path);
        assert!(status["current_job"].is_null());
    }

    #[tokio::test]
    async fn mode_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.set_mode(RunnerMode::Draining).await;
        assert_eq!(read_status(&path)["mode"], "draining");
        tracker.set_mode(RunnerMode::Stopped).await;
        assert_eq!(read_status(&path)["mode"], "stopped");
    }

    #[tokio::test]
    async fn timestamps_are_iso8601() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone());

        tracker.write_initial().await;

        let started = read_status(&path)["started_at"].as_str().unwrap().to_string();
        assert!(started.ends_with('Z'));
        assert_eq!(started.len(), 24);
    }

    #[tokio::test]
    async fn unwritable_path_is_not_fatal() {
        let tracker = StatusTracker::new(PathBuf::from("/nonexistent/dir/status.json"));
        tracker.write_initial().await;
    }
}
