use crate::orchestration::run::WorkflowRun;
use crate::sessions::meta_store::is_json_file;
use crate::shared::errors::StoreError;
use crate::shared::fs_atomic::{read_json_optional, write_json_atomic};
use crate::shared::ids::validate_identifier_value;
use crate::shared::logging::EventLog;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    Created,
    Started,
    StepDispatched,
    DispatchDeferred,
    DispatchFailed,
    TurnCompleted,
    TurnFailed,
    StepRetried,
    CheckpointPassed,
    CheckpointPaused,
    Paused,
    Resumed,
    DecisionResolved,
    RevisionRequested,
    Completed,
    Failed,
    Stopped,
    Renamed,
    Dismissed,
    Undismissed,
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimelineEvent {
    pub at: i64,
    pub kind: TimelineEventKind,
    pub summary: String,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
}

impl RunTimelineEvent {
    pub fn new(kind: TimelineEventKind, at: i64, summary: impl Into<String>) -> Self {
        Self {
            at,
            kind,
            summary: summary.into(),
            phase_id: None,
            step_id: None,
            session_id: None,
            turn_id: None,
        }
    }

    /// Tags the event with the run's current phase and step.
    pub fn at_step(mut self, run: &WorkflowRun) -> Self {
        self.phase_id = run.current_phase().map(|phase| phase.id.clone());
        self.step_id = run.current_step().map(|step| step.id.clone());
        self
    }

    pub fn with_turn(mut self, session_id: &str, turn_id: Option<&str>) -> Self {
        self.session_id = Some(session_id.to_string());
        self.turn_id = turn_id.map(str::to_string);
        self
    }
}

/// A run together with its append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusSnapshot {
    pub run: WorkflowRun,
    #[serde(default)]
    pub timeline: Vec<RunTimelineEvent>,
}

impl RunStatusSnapshot {
    pub fn new(run: WorkflowRun) -> Self {
        Self {
            run,
            timeline: Vec::new(),
        }
    }

    pub fn record(&mut self, event: RunTimelineEvent) {
        self.run.updated_at = self.run.updated_at.max(event.at);
        self.timeline.push(event);
    }
}

pub trait RunStore: Send + Sync {
    fn list_workflow_runs(&self) -> Result<Vec<RunStatusSnapshot>, StoreError>;

    fn upsert_workflow_run(&self, snapshot: &RunStatusSnapshot) -> Result<(), StoreError>;

    fn load_workflow_run(&self, run_id: &str) -> Result<Option<RunStatusSnapshot>, StoreError> {
        Ok(self
            .list_workflow_runs()?
            .into_iter()
            .find(|snapshot| snapshot.run.id == run_id))
    }
}

/// Stores each run snapshot at `<state_root>/workflows/runs/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    state_root: PathBuf,
    log: EventLog,
}

impl FileRunStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        let state_root = state_root.into();
        Self {
            log: EventLog::new(&state_root),
            state_root,
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn runs_dir(&self) -> PathBuf {
        self.state_root.join("workflows/runs")
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        validate_identifier_value("run id", run_id).map_err(|reason| StoreError::InvalidKey {
            key: run_id.to_string(),
            reason,
        })?;
        Ok(self.runs_dir().join(format!("{run_id}.json")))
    }
}

impl RunStore for FileRunStore {
    fn list_workflow_runs(&self) -> Result<Vec<RunStatusSnapshot>, StoreError> {
        let runs_root = self.runs_dir();
        let entries = match fs::read_dir(&runs_root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::read(&runs_root, source)),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::read(&runs_root, source))?;
            let path = entry.path();
            if !is_json_file(&path) {
                continue;
            }
            match read_json_optional::<RunStatusSnapshot>(&path) {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(err) => self.log.warn("runs.snapshot_skipped", err.to_string()),
            }
        }
        snapshots.sort_by(|a, b| {
            a.run
                .created_at
                .cmp(&b.run.created_at)
                .then_with(|| a.run.id.cmp(&b.run.id))
        });
        Ok(snapshots)
    }

    fn upsert_workflow_run(&self, snapshot: &RunStatusSnapshot) -> Result<(), StoreError> {
        write_json_atomic(&self.run_path(&snapshot.run.id)?, snapshot)
    }

    fn load_workflow_run(&self, run_id: &str) -> Result<Option<RunStatusSnapshot>, StoreError> {
        read_json_optional(&self.run_path(run_id)?)
    }
}
