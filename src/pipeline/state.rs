//! Execution state and its on-disk store
//!
//! One JSON file per run, `<dir>/<run_id>.json`, rewritten atomically after
//! every step so a restart can resume from `current_step`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::utils::{atomic_write_json, cleanup_temp_files};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// Outcome of one step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub index: usize,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Persisted progress of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub workflow_id: String,
    /// Empty for inline workflows, which cannot be resumed
    #[serde(default)]
    pub workflow_file: String,
    pub session: String,
    pub status: RunStatus,
    /// Index of the next step to execute
    pub current_step: usize,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn topic(&self) -> String {
        format!("pipelines:{}", self.run_id)
    }
}

/// Directory of execution state files
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Create the directory if needed and clear temp files left by a crash
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let removed = cleanup_temp_files(&dir)?;
        if removed > 0 {
            debug!(dir = %dir.display(), removed, "removed stale state temp files");
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Option<PathBuf> {
        let safe = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.json", run_id)))
    }

    pub fn save(&self, state: &ExecutionState) -> Result<(), PipelineError> {
        let path = self
            .path_for(&state.run_id)
            .ok_or_else(|| PipelineError::NotFound(state.run_id.clone()))?;
        atomic_write_json(path, state)?;
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<ExecutionState, PipelineError> {
        let path = self
            .path_for(run_id)
            .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Every readable state, newest first. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<ExecutionState>, PipelineError> {
        let mut states = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(run_id) {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable state file"),
            }
        }
        states.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(run_id: &str) -> ExecutionState {
        ExecutionState {
            run_id: run_id.to_string(),
            workflow_id: "wf".to_string(),
            workflow_file: "wf.yaml".to_string(),
            session: "s1".to_string(),
            status: RunStatus::Running,
            current_step: 0,
            steps: Vec::new(),
            variables: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("pipelines")).unwrap();
        let mut s = state("run-1");
        s.variables.insert("x".to_string(), serde_json::json!(1));
        store.save(&s).unwrap();
        assert_eq!(store.load("run-1").unwrap(), s);

        s.current_step = 2;
        store.save(&s).unwrap();
        assert_eq!(store.load("run-1").unwrap().current_step, 2);
    }

    #[test]
    fn test_missing_and_unsafe_ids() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("nope"), Err(PipelineError::NotFound(_))));
        assert!(matches!(store.load("../etc/passwd"), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save(&state("a")).unwrap();
        store.save(&state("b")).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let states = store.list().unwrap();
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_open_removes_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".a.json.1234abcd.tmp"), "partial").unwrap();
        StateStore::open(dir.path()).unwrap();
        assert!(!dir.path().join(".a.json.1234abcd.tmp").exists());
    }
}
