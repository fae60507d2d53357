use crate::orchestration::checkpoint_policy::{CheckpointGate, DecisionAction};
use crate::shared::errors::StoreError;
use crate::shared::fs_atomic::{read_json_optional, write_json_atomic};
use crate::shared::logging::EventLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub total_secs: i64,
    pub max_secs: i64,
    pub average_secs: f64,
}

impl LatencyStats {
    pub fn record(&mut self, secs: i64) {
        let secs = secs.max(0);
        self.count = self.count.saturating_add(1);
        self.total_secs = self.total_secs.saturating_add(secs);
        self.max_secs = self.max_secs.max(secs);
        self.average_secs = self.total_secs as f64 / self.count as f64;
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub checkpoint_evaluations: u64,
    pub pause_count: u64,
    pub pause_rate: f64,
    pub approval_count: u64,
    pub revision_count: u64,
    #[serde(default)]
    pub decision_latency: LatencyStats,
    #[serde(default)]
    pub run_duration: LatencyStats,
    #[serde(default)]
    pub intervention_causes: BTreeMap<String, u64>,
    #[serde(default)]
    pub updated_at: i64,
}

impl RunMetricsSnapshot {
    fn refresh_pause_rate(&mut self) {
        self.pause_rate = if self.checkpoint_evaluations == 0 {
            0.0
        } else {
            self.pause_count as f64 / self.checkpoint_evaluations as f64
        };
    }

    fn count_cause(&mut self, cause: &str) {
        *self.intervention_causes.entry(cause.to_string()).or_insert(0) += 1;
    }
}

pub trait RunMetricsStore: Send + Sync {
    fn load_run_metrics(&self) -> Result<Option<RunMetricsSnapshot>, StoreError>;
    fn save_run_metrics(&self, snapshot: &RunMetricsSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileRunMetricsStore {
    state_root: PathBuf,
}

impl FileRunMetricsStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    fn metrics_path(&self) -> PathBuf {
        self.state_root.join("workflows/metrics.json")
    }
}

impl RunMetricsStore for FileRunMetricsStore {
    fn load_run_metrics(&self) -> Result<Option<RunMetricsSnapshot>, StoreError> {
        read_json_optional(&self.metrics_path())
    }

    fn save_run_metrics(&self, snapshot: &RunMetricsSnapshot) -> Result<(), StoreError> {
        write_json_atomic(&self.metrics_path(), snapshot)
    }
}

/// Aggregates run telemetry. Recording is a no-op when telemetry is disabled;
/// persistence failures are logged and never surface to run operations.
pub struct RunMetricsRecorder {
    enabled: bool,
    snapshot: Mutex<RunMetricsSnapshot>,
    store: Option<Arc<dyn RunMetricsStore>>,
    log: EventLog,
}

impl RunMetricsRecorder {
    pub fn restore(enabled: bool, store: Option<Arc<dyn RunMetricsStore>>, log: EventLog) -> Self {
        let restored = match store.as_ref().map(|store| store.load_run_metrics()) {
            Some(Ok(Some(snapshot))) => snapshot,
            Some(Ok(None)) | None => RunMetricsSnapshot::default(),
            Some(Err(err)) => {
                log.warn("metrics.restore_failed", err.to_string());
                RunMetricsSnapshot::default()
            }
        };
        Self {
            enabled,
            snapshot: Mutex::new(restored),
            store,
            log,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reset(&self, now: i64) -> Result<RunMetricsSnapshot, StoreError> {
        let fresh = RunMetricsSnapshot {
            updated_at: now,
            ..RunMetricsSnapshot::default()
        };
        if let Some(store) = self.store.as_ref() {
            store.save_run_metrics(&fresh)?;
        }
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh.clone();
        Ok(fresh)
    }

    pub fn run_started(&self, now: i64) {
        self.record(now, |m| m.runs_started += 1);
    }

    pub fn run_completed(&self, now: i64, duration_secs: Option<i64>) {
        self.record(now, |m| {
            m.runs_completed += 1;
            if let Some(secs) = duration_secs {
                m.run_duration.record(secs);
            }
        });
    }

    pub fn run_failed(&self, now: i64) {
        self.record(now, |m| m.runs_failed += 1);
    }

    pub fn checkpoint_evaluated(&self, now: i64, paused: bool, gates: &[CheckpointGate]) {
        self.record(now, |m| {
            m.checkpoint_evaluations += 1;
            if paused {
                m.pause_count += 1;
                for gate in gates {
                    m.count_cause(gate.as_str());
                }
            }
        });
    }

    pub fn manual_pause(&self, now: i64) {
        self.record(now, |m| m.count_cause("manual_pause"));
    }

    pub fn decision_resolved(&self, now: i64, action: DecisionAction, latency_secs: i64) {
        self.record(now, |m| {
            match action {
                DecisionAction::ApproveContinue => m.approval_count += 1,
                DecisionAction::RequestRevision => m.revision_count += 1,
                DecisionAction::PauseRun => {}
            }
            m.decision_latency.record(latency_secs);
        });
    }

    fn record(&self, now: i64, update: impl FnOnce(&mut RunMetricsSnapshot)) {
        if !self.enabled {
            return;
        }
        let snapshot = {
            let mut guard = self
                .snapshot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            update(&mut guard);
            guard.refresh_pause_rate();
            guard.updated_at = now;
            guard.clone()
        };
        if let Some(store) = self.store.as_ref() {
            if let Err(err) = store.save_run_metrics(&snapshot) {
                self.log.warn("metrics.save_failed", err.to_string());
            }
        }
    }
}
