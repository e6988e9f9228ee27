//! Append-only learning and correction telemetry
//!
//! One JSONL file per run under `<workspace>/.deeprun/learning/runs/`.
//! Events are immutable and totally ordered by `created_at` within a run;
//! the stress gates consume them directly.

use crate::failures::FailureCluster;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Outcome of one learning-relevant phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningOutcome {
    Success,
    ProvisionallyFixed,
    Stalled,
    Failed,
}

/// One telemetry row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub run_id: String,
    /// Phase label, e.g. `micro_targeted_repair`, `import_resolution_recipe`,
    /// `debt_resolution`.
    pub phase: String,
    pub outcome: LearningOutcome,
    /// `blocking_before - blocking_after` for correction phases.
    pub delta: i64,
    pub blocking_before: u32,
    pub blocking_after: u32,
    pub convergence_flag: bool,
    pub regression_flag: bool,
    pub clusters: Vec<FailureCluster>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl LearningEvent {
    pub fn new(run_id: impl Into<String>, phase: impl Into<String>, outcome: LearningOutcome) -> Self {
        Self {
            run_id: run_id.into(),
            phase: phase.into(),
            outcome,
            delta: 0,
            blocking_before: 0,
            blocking_after: 0,
            convergence_flag: false,
            regression_flag: false,
            clusters: Vec::new(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_blocking(mut self, before: u32, after: u32) -> Self {
        self.blocking_before = before;
        self.blocking_after = after;
        self.delta = i64::from(before) - i64::from(after);
        self.convergence_flag = after < before;
        self.regression_flag = after > before;
        self
    }

    pub fn with_clusters(mut self, clusters: Vec<FailureCluster>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The scenario label stored in metadata, if any.
    pub fn label(&self) -> Option<&str> {
        self.metadata.get("label").and_then(Value::as_str)
    }
}

/// Per-workspace learning log.
pub struct LearningLog {
    workspace_root: PathBuf,
}

impl LearningLog {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    /// Path of a run's JSONL file.
    pub fn run_file(&self, run_id: &str) -> PathBuf {
        self.workspace_root
            .join(".deeprun")
            .join("learning")
            .join("runs")
            .join(format!("{run_id}.jsonl"))
    }

    /// Append one event as a canonical JSON line.
    pub fn append(&self, event: &LearningEvent) -> std::io::Result<()> {
        let path = self.run_file(&event.run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = crate::canon::canonical_json_of(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read a run's events back, in append order.
    pub fn events_for_run(&self, run_id: &str) -> std::io::Result<Vec<LearningEvent>> {
        let path = self.run_file(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocking_flags() {
        let event = LearningEvent::new("r", "goal", LearningOutcome::Success).with_blocking(5, 2);
        assert_eq!(event.delta, 3);
        assert!(event.convergence_flag);
        assert!(!event.regression_flag);

        let regressed =
            LearningEvent::new("r", "goal", LearningOutcome::Stalled).with_blocking(2, 5);
        assert_eq!(regressed.delta, -3);
        assert!(regressed.regression_flag);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = LearningLog::new(dir.path());

        for i in 0..3 {
            let event = LearningEvent::new("run-1", "goal", LearningOutcome::Success)
                .with_blocking(i + 1, i)
                .with_metadata(json!({ "label": "fixture", "index": i }));
            log.append(&event).unwrap();
        }

        let events = log.events_for_run("run-1").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].metadata["index"], 2);
        assert_eq!(events[0].label(), Some("fixture"));
        assert!(log.run_file("run-1").ends_with(".deeprun/learning/runs/run-1.jsonl"));
    }

    #[test]
    fn test_missing_run_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = LearningLog::new(dir.path());
        assert!(log.events_for_run("nope").unwrap().is_empty());
    }
}
