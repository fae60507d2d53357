use crate::orchestration::checkpoint_policy::CheckpointPolicy;
use crate::orchestration::execution_controls::ExecutionControls;
use crate::orchestration::run::{RunStatus, WorkflowRun};
use crate::orchestration::run_store::{
    RunStatusSnapshot, RunStore, RunTimelineEvent, TimelineEventKind,
};
use crate::provider::AccessLevel;
use crate::sessions::{SessionMeta, SessionMetaStore};
use crate::shared::errors::StoreError;
use crate::shared::logging::EventLog;
use crate::shared::time::Clock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Decides what to write for a run that a session links to but the run
/// store no longer has. `None` leaves the link dangling.
pub trait MissingRunSnapshotPolicy: Send + Sync {
    fn snapshot_for(&self, meta: &SessionMeta, run_id: &str, now: i64)
        -> Option<RunStatusSnapshot>;
}

/// Writes a completed placeholder run so the session keeps a valid owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct TombstonePolicy;

impl MissingRunSnapshotPolicy for TombstonePolicy {
    fn snapshot_for(
        &self,
        meta: &SessionMeta,
        run_id: &str,
        now: i64,
    ) -> Option<RunStatusSnapshot> {
        let completed_at = meta.last_active_at.unwrap_or(now);
        let run = WorkflowRun {
            id: run_id.to_string(),
            template_id: String::new(),
            template_name: String::new(),
            name: format!("Recovered run {run_id}"),
            workspace_id: meta.workspace_id.clone(),
            worktree_id: meta.worktree_id.clone(),
            session_id: Some(meta.session_id.clone()),
            user_prompt: String::new(),
            status: RunStatus::Completed,
            dismissed_at: None,
            phases: Vec::new(),
            current_phase_index: 0,
            current_step_index: 0,
            dispatch_count: 0,
            checkpoint_policy: CheckpointPolicy::default(),
            execution_controls: ExecutionControls::disabled(),
            runtime_options: meta.runtime_options.clone(),
            default_access_level: AccessLevel::default(),
            latest_decision: None,
            latest_error: None,
            created_at: completed_at,
            updated_at: completed_at,
            started_at: None,
            completed_at: Some(completed_at),
        };
        let mut snapshot = RunStatusSnapshot::new(run);
        snapshot.record(
            RunTimelineEvent::new(
                TimelineEventKind::Reconciled,
                now,
                format!("recovered from session `{}`", meta.session_id),
            )
            .with_turn(&meta.session_id, None),
        );
        Some(snapshot)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub existing: usize,
    pub created: usize,
    pub skipped_empty_id: usize,
    pub skipped_existing: usize,
    pub skipped_by_policy: usize,
    pub failed_writes: usize,
}

/// Backfills run snapshots referenced by session metadata. Existing
/// snapshots are never rewritten; per-record write failures are counted.
pub struct SnapshotReconciler {
    run_store: Arc<dyn RunStore>,
    meta_store: Arc<dyn SessionMetaStore>,
    policy: Box<dyn MissingRunSnapshotPolicy>,
    clock: Arc<dyn Clock>,
    log: EventLog,
}

impl SnapshotReconciler {
    pub fn new(
        run_store: Arc<dyn RunStore>,
        meta_store: Arc<dyn SessionMetaStore>,
        clock: Arc<dyn Clock>,
        log: EventLog,
    ) -> Self {
        Self {
            run_store,
            meta_store,
            policy: Box::new(TombstonePolicy),
            clock,
            log,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn MissingRunSnapshotPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut known: HashSet<String> = self
            .run_store
            .list_workflow_runs()?
            .into_iter()
            .map(|snapshot| snapshot.run.id)
            .collect();
        let mut report = ReconcileReport {
            existing: known.len(),
            ..ReconcileReport::default()
        };
        let now = self.clock.now_secs();

        for meta in self.meta_store.list()? {
            let Some(run_id) = meta.owned_run_id() else {
                report.skipped_empty_id += 1;
                continue;
            };
            if known.contains(run_id) {
                report.skipped_existing += 1;
                continue;
            }
            let Some(snapshot) = self.policy.snapshot_for(&meta, run_id, now) else {
                report.skipped_by_policy += 1;
                continue;
            };
            match self.run_store.upsert_workflow_run(&snapshot) {
                Ok(()) => {
                    report.created += 1;
                    known.insert(run_id.to_string());
                    self.log.info(
                        "reconcile.created",
                        format!("run={run_id} session={}", meta.session_id),
                    );
                }
                Err(err) => {
                    report.failed_writes += 1;
                    self.log.warn(
                        "reconcile.write_failed",
                        format!("run={run_id} session={}: {err}", meta.session_id),
                    );
                }
            }
        }
        self.log.info(
            "reconcile.finished",
            format!(
                "existing={} created={} skipped_empty_id={} skipped_existing={} skipped_by_policy={} failed_writes={}",
                report.existing,
                report.created,
                report.skipped_empty_id,
                report.skipped_existing,
                report.skipped_by_policy,
                report.failed_writes
            ),
        );
        Ok(report)
    }
}
