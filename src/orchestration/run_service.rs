use crate::config::WorkflowSettings;
use crate::orchestration::checkpoint_policy::{
    evaluate_checkpoint, resolve_checkpoint_policy, CheckpointPolicyOverride, DecisionAction,
    TurnEvidence, TurnOutcome,
};
use crate::orchestration::dispatch::{
    compose_step_message, DispatchContext, StepDispatchRequest, StepDispatcher,
};
use crate::orchestration::error::{DispatchError, WorkflowError};
use crate::orchestration::execution_controls::ExecutionControls;
use crate::orchestration::metrics::{
    FileRunMetricsStore, RunMetricsRecorder, RunMetricsSnapshot, RunMetricsStore,
};
use crate::orchestration::run::{
    CheckpointDecision, DecisionKind, NewRun, RunStatus, StepExecution, StepExecutionStatus,
    WorkflowRun,
};
use crate::orchestration::run_store::{
    FileRunStore, RunStatusSnapshot, RunStore, RunTimelineEvent, TimelineEventKind,
};
use crate::provider::{ProviderRegistry, RuntimeOptions};
use crate::sessions::{FileSessionMetaStore, SessionGateway, SessionMetaStore};
use crate::shared::errors::StoreError;
use crate::shared::ids::{derive_stable_id, generate_compact_id};
use crate::shared::logging::EventLog;
use crate::shared::time::Clock;
use crate::templates::{FileTemplateStore, TemplateCatalog, WorkflowTemplate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub template_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub worktree_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub checkpoint_policy: Option<CheckpointPolicyOverride>,
    #[serde(default)]
    pub runtime_options: Option<RuntimeOptions>,
}

/// A finished agent turn as reported by the session layer. Everything past
/// the identifiers is optional evidence for the checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnCompletedSignal {
    pub session_id: String,
    pub turn_id: String,
    pub workspace_id: Option<String>,
    pub worktree_id: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub output: String,
    pub confidence: Option<f64>,
    pub ambiguity: bool,
    pub files_touched: Vec<String>,
    pub sensitive_files: Vec<String>,
    pub checks_failed: bool,
}

impl TurnCompletedSignal {
    pub fn new(session_id: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turn_id: turn_id.into(),
            ..Self::default()
        }
    }

    fn matches_context(&self, run: &WorkflowRun) -> bool {
        let matches = |signal: &Option<String>, value: &str| match signal.as_deref() {
            Some(expected) if !expected.is_empty() && !value.is_empty() => expected == value,
            _ => true,
        };
        matches(&self.workspace_id, &run.workspace_id)
            && matches(&self.worktree_id, &run.worktree_id)
    }
}

/// Keeps session visibility in step with a run's dismissed state.
pub trait SessionVisibilitySync: Send + Sync {
    fn sync_run_visibility(&self, run: &WorkflowRun) -> Result<(), String>;
}

pub struct RunServiceDeps {
    pub run_store: Arc<dyn RunStore>,
    pub metrics_store: Option<Arc<dyn RunMetricsStore>>,
    pub templates: TemplateCatalog,
    pub dispatcher: StepDispatcher,
    pub visibility: Option<Arc<dyn SessionVisibilitySync>>,
    pub clock: Arc<dyn Clock>,
    pub log: EventLog,
}

impl RunServiceDeps {
    /// File-backed stores under `state_root` with the built-in provider registry.
    pub fn file_backed(
        state_root: &Path,
        settings: &WorkflowSettings,
        gateway: Arc<dyn SessionGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let log = EventLog::new(state_root);
        let meta_store: Arc<dyn SessionMetaStore> = Arc::new(FileSessionMetaStore::new(state_root));
        let dispatcher = StepDispatcher::new(
            gateway,
            meta_store,
            ProviderRegistry::builtin(),
            settings.dispatch.clone(),
            Arc::clone(&clock),
            log.clone(),
        );
        Self {
            run_store: Arc::new(FileRunStore::new(state_root)),
            metrics_store: Some(Arc::new(FileRunMetricsStore::new(state_root))),
            templates: TemplateCatalog::with_custom_store(Arc::new(FileTemplateStore::new(
                state_root,
            ))),
            dispatcher,
            visibility: None,
            clock,
            log,
        }
    }
}

/// Owns the workflow run lifecycle. Mutations on one run are serialized
/// through a per-run lock; creation also holds a service-wide lock so the
/// active-run limit cannot be overshot.
pub struct RunService {
    settings: WorkflowSettings,
    run_store: Arc<dyn RunStore>,
    templates: TemplateCatalog,
    dispatcher: StepDispatcher,
    visibility: Option<Arc<dyn SessionVisibilitySync>>,
    clock: Arc<dyn Clock>,
    log: EventLog,
    metrics: RunMetricsRecorder,
    create_lock: Mutex<()>,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunService {
    pub fn new(settings: WorkflowSettings, deps: RunServiceDeps) -> Self {
        let metrics = RunMetricsRecorder::restore(
            settings.rollout.telemetry_enabled,
            deps.metrics_store,
            deps.log.clone(),
        );
        Self {
            settings,
            run_store: deps.run_store,
            templates: deps.templates,
            dispatcher: deps.dispatcher,
            visibility: deps.visibility,
            clock: deps.clock,
            log: deps.log,
            metrics,
            create_lock: Mutex::new(()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn list_templates(&self) -> Result<Vec<WorkflowTemplate>, WorkflowError> {
        Ok(self.templates.list()?)
    }

    pub fn create_run(&self, request: CreateRunRequest) -> Result<WorkflowRun, WorkflowError> {
        if !self.settings.enabled {
            return Err(WorkflowError::Disabled);
        }
        let workspace_id = request.workspace_id.trim().to_string();
        let worktree_id = request.worktree_id.trim().to_string();
        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if (workspace_id.is_empty() || worktree_id.is_empty()) && session_id.is_none() {
            return Err(WorkflowError::MissingContext);
        }

        let template = self
            .templates
            .find(request.template_id.trim())?
            .ok_or_else(|| WorkflowError::TemplateNotFound {
                template_id: request.template_id.clone(),
            })?;

        let runtime_options = request
            .runtime_options
            .filter(|options| !options.is_empty());
        if let Some(provider) = runtime_options
            .as_ref()
            .and_then(|options| options.provider.as_deref())
        {
            self.dispatcher.registry().require_dispatch(provider)?;
        }

        let checkpoint_policy = resolve_checkpoint_policy(
            &self.settings.checkpoint_policy,
            request.checkpoint_policy.as_ref(),
        );
        let execution_controls = ExecutionControls::resolve(
            &self.settings.execution_controls,
            self.settings.rollout.execution_controls_enabled,
        );

        let _create_guard = self
            .create_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let active = self
            .run_store
            .list_workflow_runs()?
            .iter()
            .filter(|snapshot| snapshot.run.is_active())
            .count();
        if active >= self.settings.max_active_runs {
            return Err(WorkflowError::RunLimitExceeded {
                max_active_runs: self.settings.max_active_runs,
            });
        }

        let now = self.clock.now_secs();
        let id = generate_compact_id("run", now).map_err(StoreError::Unavailable)?;
        let mut run = WorkflowRun::from_template(NewRun {
            id,
            template: &template,
            workspace_id,
            worktree_id,
            session_id,
            user_prompt: request.prompt.trim().to_string(),
            checkpoint_policy,
            execution_controls,
            runtime_options,
            now,
        });
        if let Some(name) = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            run.name = name.to_string();
        }

        let mut snapshot = RunStatusSnapshot::new(run);
        snapshot.record(RunTimelineEvent::new(
            TimelineEventKind::Created,
            now,
            format!("created from template `{}`", template.id),
        ));
        self.run_store.upsert_workflow_run(&snapshot)?;
        self.log.info(
            "run.created",
            format!("run={} template={}", snapshot.run.id, template.id),
        );
        Ok(snapshot.run)
    }

    pub fn start_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        if !self.settings.enabled {
            return Err(WorkflowError::Disabled);
        }
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.status != RunStatus::Created {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    snapshot.run.status,
                    "start",
                ));
            }
            snapshot.run.status = RunStatus::Running;
            snapshot.run.started_at = Some(now);
            snapshot.record(RunTimelineEvent::new(
                TimelineEventKind::Started,
                now,
                "run started",
            ));
            self.metrics.run_started(now);
            self.log.info("run.started", format!("run={run_id}"));
            self.dispatch_current(snapshot, None, now)
        })
    }

    pub fn pause_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.mutate_run(run_id, |snapshot, now| {
            transition(snapshot, RunStatus::Paused, "pause")?;
            let event =
                RunTimelineEvent::new(TimelineEventKind::Paused, now, "paused by user")
                    .at_step(&snapshot.run);
            snapshot.record(event);
            self.metrics.manual_pause(now);
            Ok(())
        })
    }

    pub fn resume_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.status != RunStatus::Paused {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    snapshot.run.status,
                    "resume",
                ));
            }
            snapshot.run.status = RunStatus::Running;
            if let Some(decision) = snapshot
                .run
                .latest_decision
                .as_mut()
                .filter(|decision| decision.is_pending_pause())
            {
                decision.resolved_at = Some(now);
                decision.resolution = Some(DecisionAction::ApproveContinue);
                let latency = now - decision.created_at;
                self.metrics
                    .decision_resolved(now, DecisionAction::ApproveContinue, latency);
            }
            let event = RunTimelineEvent::new(TimelineEventKind::Resumed, now, "resumed")
                .at_step(&snapshot.run);
            snapshot.record(event);

            let execution = snapshot.run.current_execution().cloned();
            match execution {
                Some(execution) if execution.turn_in_flight() => Ok(()),
                Some(execution) if execution.evidence.is_some() => {
                    self.apply_recorded_turn(snapshot, now)
                }
                Some(execution) if execution.status == StepExecutionStatus::Completed => {
                    self.advance_or_complete(snapshot, now)
                }
                _ => self.dispatch_current(snapshot, None, now),
            }
        })
    }

    /// Restarts a failed run on its current step with `message` appended to
    /// the next prompt.
    pub fn resume_failed_run(
        &self,
        run_id: &str,
        message: &str,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.status != RunStatus::Failed {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    snapshot.run.status,
                    "resume a failed run",
                ));
            }
            snapshot.run.status = RunStatus::Running;
            snapshot.run.completed_at = None;
            snapshot.run.latest_error = None;
            let event =
                RunTimelineEvent::new(TimelineEventKind::Resumed, now, "resumed after failure")
                    .at_step(&snapshot.run);
            snapshot.record(event);
            self.log.info("run.resumed_failed", format!("run={run_id}"));
            self.dispatch_current(snapshot, Some(message), now)
        })
    }

    pub fn stop_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.status.is_terminal() {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    snapshot.run.status,
                    "stop",
                ));
            }
            snapshot.run.status = RunStatus::Failed;
            snapshot.run.completed_at = Some(now);
            snapshot.run.latest_error = Some("stopped by user".to_string());
            let event = RunTimelineEvent::new(TimelineEventKind::Stopped, now, "stopped by user")
                .at_step(&snapshot.run);
            snapshot.record(event);
            self.metrics.run_failed(now);
            self.log.info("run.stopped", format!("run={run_id}"));
            Ok(())
        })
    }

    pub fn rename_run(&self, run_id: &str, name: &str) -> Result<WorkflowRun, WorkflowError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkflowError::InvalidRequest(
                "run name must be non-empty".to_string(),
            ));
        }
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.name == name {
                return Ok(());
            }
            snapshot.run.name = name.to_string();
            snapshot.record(RunTimelineEvent::new(
                TimelineEventKind::Renamed,
                now,
                format!("renamed to `{name}`"),
            ));
            Ok(())
        })
    }

    pub fn dismiss_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        let run = self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.dismissed_at.is_some() {
                return Ok(());
            }
            snapshot.run.dismissed_at = Some(now);
            snapshot.record(RunTimelineEvent::new(
                TimelineEventKind::Dismissed,
                now,
                "dismissed",
            ));
            Ok(())
        })?;
        self.sync_visibility(&run);
        Ok(run)
    }

    pub fn undismiss_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        let run = self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.dismissed_at.is_none() {
                return Ok(());
            }
            snapshot.run.dismissed_at = None;
            snapshot.record(RunTimelineEvent::new(
                TimelineEventKind::Undismissed,
                now,
                "restored",
            ));
            Ok(())
        })?;
        self.sync_visibility(&run);
        Ok(run)
    }

    pub fn handle_decision(
        &self,
        run_id: &str,
        action: DecisionAction,
        decision_id: &str,
        note: Option<&str>,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.mutate_run(run_id, |snapshot, now| {
            if snapshot.run.status != RunStatus::Paused {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    snapshot.run.status,
                    "resolve a decision",
                ));
            }
            let note = note.map(str::trim).filter(|note| !note.is_empty());
            let Some(decision) = snapshot
                .run
                .latest_decision
                .as_mut()
                .filter(|decision| decision.is_pending_pause() && decision.id == decision_id)
            else {
                return Err(WorkflowError::invalid_transition(
                    run_id,
                    RunStatus::Paused,
                    &format!("resolve stale decision `{decision_id}`"),
                ));
            };
            decision.resolved_at = Some(now);
            decision.resolution = Some(action);
            decision.note = note.map(str::to_string);
            let latency = now - decision.created_at;

            self.metrics.decision_resolved(now, action, latency);
            let event = RunTimelineEvent::new(
                TimelineEventKind::DecisionResolved,
                now,
                format!("decision `{decision_id}` resolved: {}", action.as_str()),
            )
            .at_step(&snapshot.run);
            snapshot.record(event);

            match action {
                DecisionAction::ApproveContinue => {
                    snapshot.run.status = RunStatus::Running;
                    self.advance_or_complete(snapshot, now)
                }
                DecisionAction::RequestRevision => {
                    snapshot.run.status = RunStatus::Running;
                    let event = RunTimelineEvent::new(
                        TimelineEventKind::RevisionRequested,
                        now,
                        "revision requested",
                    )
                    .at_step(&snapshot.run);
                    snapshot.record(event);
                    self.dispatch_current(snapshot, note, now)
                }
                DecisionAction::PauseRun => Ok(()),
            }
        })
    }

    /// Applies a finished turn to every run whose current step is waiting on
    /// it. Runs already paused on this turn are returned unchanged so a
    /// replayed signal yields the same decision. A run paused by the user
    /// while the turn was in flight only records the outcome; `resume_run`
    /// acts on it.
    pub fn on_turn_completed(
        &self,
        signal: &TurnCompletedSignal,
    ) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let candidates: Vec<String> = self
            .run_store
            .list_workflow_runs()?
            .into_iter()
            .filter(|snapshot| {
                signal.matches_context(&snapshot.run)
                    && (awaits_turn(&snapshot.run, signal) || paused_on_turn(&snapshot.run, signal))
            })
            .map(|snapshot| snapshot.run.id)
            .collect();

        let mut affected = Vec::with_capacity(candidates.len());
        for run_id in candidates {
            let lock = self.run_lock(&run_id);
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(mut snapshot) = self.run_store.load_workflow_run(&run_id)? else {
                continue;
            };
            if paused_on_turn(&snapshot.run, signal) {
                affected.push(snapshot.run);
                continue;
            }
            if !awaits_turn(&snapshot.run, signal) {
                continue;
            }
            let now = self.clock.now_secs();
            if !self.record_turn(&mut snapshot, signal, now) {
                continue;
            }
            if snapshot.run.status == RunStatus::Running {
                if let Err(err) = self.apply_recorded_turn(&mut snapshot, now) {
                    self.log.warn(
                        "run.turn_progress_failed",
                        format!("run={run_id} turn={}: {err}", signal.turn_id),
                    );
                }
            } else {
                self.log.info(
                    "run.turn_recorded_while_paused",
                    format!("run={run_id} turn={}", signal.turn_id),
                );
            }
            self.run_store.upsert_workflow_run(&snapshot)?;
            affected.push(snapshot.run);
        }
        Ok(affected)
    }

    pub fn list_runs(&self) -> Result<Vec<WorkflowRun>, WorkflowError> {
        Ok(self
            .run_store
            .list_workflow_runs()?
            .into_iter()
            .filter(|snapshot| snapshot.run.dismissed_at.is_none())
            .map(|snapshot| snapshot.run)
            .collect())
    }

    pub fn list_runs_including_dismissed(&self) -> Result<Vec<WorkflowRun>, WorkflowError> {
        Ok(self
            .run_store
            .list_workflow_runs()?
            .into_iter()
            .map(|snapshot| snapshot.run)
            .collect())
    }

    pub fn get_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        Ok(self.load(run_id)?.run)
    }

    pub fn get_run_timeline(&self, run_id: &str) -> Result<Vec<RunTimelineEvent>, WorkflowError> {
        Ok(self.load(run_id)?.timeline)
    }

    pub fn get_run_metrics(&self) -> RunMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_run_metrics(&self) -> Result<RunMetricsSnapshot, WorkflowError> {
        Ok(self.metrics.reset(self.clock.now_secs())?)
    }

    fn load(&self, run_id: &str) -> Result<RunStatusSnapshot, WorkflowError> {
        self.run_store
            .load_workflow_run(run_id)?
            .ok_or_else(|| WorkflowError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(run_id.to_string()).or_default())
    }

    /// Loads, mutates and persists one run under its lock. The snapshot is
    /// written whenever it changed, even if `mutate` reports an error, so
    /// dispatch failures leave their trace behind.
    fn mutate_run<F>(&self, run_id: &str, mutate: F) -> Result<WorkflowRun, WorkflowError>
    where
        F: FnOnce(&mut RunStatusSnapshot, i64) -> Result<(), WorkflowError>,
    {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot = self.load(run_id)?;
        let before = snapshot.clone();
        let now = self.clock.now_secs();
        let outcome = mutate(&mut snapshot, now);
        if snapshot != before {
            self.run_store.upsert_workflow_run(&snapshot)?;
        }
        outcome.map(|()| snapshot.run)
    }

    /// Stores the turn outcome and evidence on the current execution.
    /// Returns false when the run has no execution to record against.
    fn record_turn(
        &self,
        snapshot: &mut RunStatusSnapshot,
        signal: &TurnCompletedSignal,
        now: i64,
    ) -> bool {
        let evidence = self.turn_evidence(&snapshot.run, signal);
        let failure = failure_reason(&evidence);
        let Some(execution) = snapshot
            .run
            .current_step_mut()
            .and_then(|step| step.execution.as_mut())
        else {
            return false;
        };
        execution.completed_at = Some(now);
        match failure.as_ref() {
            Some(reason) => {
                execution.status = StepExecutionStatus::Failed;
                execution.error = Some(reason.clone());
            }
            None => execution.status = StepExecutionStatus::Completed,
        }
        execution.evidence = Some(evidence);

        let event = match failure {
            Some(reason) => RunTimelineEvent::new(
                TimelineEventKind::TurnFailed,
                now,
                format!("turn failed: {reason}"),
            ),
            None => RunTimelineEvent::new(TimelineEventKind::TurnCompleted, now, "turn completed"),
        }
        .at_step(&snapshot.run)
        .with_turn(&signal.session_id, Some(&signal.turn_id));
        snapshot.record(event);
        true
    }

    /// Acts on evidence recorded by `record_turn`: retries or fails a broken
    /// turn, otherwise evaluates the checkpoint and advances or pauses.
    fn apply_recorded_turn(
        &self,
        snapshot: &mut RunStatusSnapshot,
        now: i64,
    ) -> Result<(), WorkflowError> {
        let Some(execution) = snapshot
            .run
            .current_step_mut()
            .and_then(|step| step.execution.as_mut())
        else {
            return Ok(());
        };
        let Some(evidence) = execution.evidence.take() else {
            return Ok(());
        };
        let attempt = execution.attempt;
        let turn_id = execution.turn_id.clone().unwrap_or_default();

        if let Some(reason) = failure_reason(&evidence) {
            let controls = &snapshot.run.execution_controls;
            let can_retry = controls.enabled && attempt < controls.max_attempts();
            if can_retry {
                let event = RunTimelineEvent::new(
                    TimelineEventKind::StepRetried,
                    now,
                    format!("retrying step (attempt {})", attempt + 1),
                )
                .at_step(&snapshot.run);
                snapshot.record(event);
                return self.dispatch_current(snapshot, None, now);
            }
            self.fail_run(snapshot, reason, now);
            return Ok(());
        }

        let metadata = evaluate_checkpoint(&snapshot.run.checkpoint_policy, &evidence);
        self.metrics
            .checkpoint_evaluated(now, metadata.should_pause, &metadata.triggered_gates);

        let (phase_id, step_id) = snapshot.run.step_ids();
        let decision_id = derive_stable_id(
            "dec",
            &[snapshot.run.id.as_str(), step_id.as_str(), turn_id.as_str()],
        );
        let reason = if metadata.reasons.is_empty() {
            "checkpoint passed".to_string()
        } else {
            metadata.reasons.join("; ")
        };
        let should_pause = metadata.should_pause;
        let mut decision = CheckpointDecision {
            id: decision_id,
            kind: DecisionKind::AutoContinue,
            phase_id,
            step_id,
            turn_id: Some(turn_id),
            reason,
            metadata,
            created_at: now,
            resolved_at: None,
            resolution: None,
            note: None,
        };

        if should_pause {
            decision.kind = DecisionKind::Pause;
            let summary = format!("checkpoint paused run: {}", decision.reason);
            self.log.info(
                "checkpoint.paused",
                format!(
                    "run={} decision={} severity={}",
                    snapshot.run.id,
                    decision.id,
                    decision.metadata.severity.as_str()
                ),
            );
            snapshot.run.status = RunStatus::Paused;
            snapshot.run.latest_decision = Some(decision);
            let event = RunTimelineEvent::new(TimelineEventKind::CheckpointPaused, now, summary)
                .at_step(&snapshot.run);
            snapshot.record(event);
            return Ok(());
        }

        decision.resolved_at = Some(now);
        decision.resolution = Some(DecisionAction::ApproveContinue);
        snapshot.run.latest_decision = Some(decision);
        let event = RunTimelineEvent::new(
            TimelineEventKind::CheckpointPassed,
            now,
            "checkpoint passed",
        )
        .at_step(&snapshot.run);
        snapshot.record(event);
        self.advance_or_complete(snapshot, now)
    }

    fn turn_evidence(&self, run: &WorkflowRun, signal: &TurnCompletedSignal) -> TurnEvidence {
        let controls = &run.execution_controls;
        let mut sensitive_files = signal.sensitive_files.clone();
        for file in controls.sensitive_matches(&signal.files_touched) {
            if !sensitive_files.contains(&file) {
                sensitive_files.push(file);
            }
        }
        let step_commits = run.current_step().map(|step| step.commit).unwrap_or(false);
        TurnEvidence {
            status: TurnOutcome::from_label(signal.status.as_deref()),
            error: signal
                .error
                .as_deref()
                .map(str::trim)
                .filter(|err| !err.is_empty())
                .map(str::to_string),
            output: signal.output.clone(),
            confidence: signal.confidence,
            ambiguity: signal.ambiguity,
            files_touched: signal.files_touched.clone(),
            sensitive_files,
            checks_failed: signal.checks_failed,
            pre_commit: controls.commit_gate_applies(step_commits),
        }
    }

    fn advance_or_complete(
        &self,
        snapshot: &mut RunStatusSnapshot,
        now: i64,
    ) -> Result<(), WorkflowError> {
        if snapshot.run.advance_position() {
            return self.dispatch_current(snapshot, None, now);
        }
        snapshot.run.status = RunStatus::Completed;
        snapshot.run.completed_at = Some(now);
        snapshot.record(RunTimelineEvent::new(
            TimelineEventKind::Completed,
            now,
            "all steps completed",
        ));
        let duration = snapshot.run.started_at.map(|started| now - started);
        self.metrics.run_completed(now, duration);
        self.log.info("run.completed", format!("run={}", snapshot.run.id));
        Ok(())
    }

    fn fail_run(&self, snapshot: &mut RunStatusSnapshot, reason: String, now: i64) {
        if !snapshot.run.status.can_transition_to(RunStatus::Failed) {
            snapshot.run.latest_error = Some(reason);
            return;
        }
        snapshot.run.status = RunStatus::Failed;
        snapshot.run.completed_at = Some(now);
        let event = RunTimelineEvent::new(TimelineEventKind::Failed, now, reason.clone())
            .at_step(&snapshot.run);
        snapshot.record(event);
        snapshot.run.latest_error = Some(reason);
        self.metrics.run_failed(now);
        self.log
            .warn("run.failed", format!("run={}", snapshot.run.id));
    }

    fn dispatch_current(
        &self,
        snapshot: &mut RunStatusSnapshot,
        revision_note: Option<&str>,
        now: i64,
    ) -> Result<(), WorkflowError> {
        let run = &snapshot.run;
        let Some(step) = run.current_step() else {
            return Err(WorkflowError::InvalidRequest(format!(
                "run `{}` has no step to dispatch",
                run.id
            )));
        };
        let attempt = match step.execution.as_ref() {
            Some(execution) if execution.status == StepExecutionStatus::Deferred => {
                execution.attempt
            }
            Some(execution) => execution.attempt + 1,
            None => 1,
        };
        let request = StepDispatchRequest {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            workspace_id: run.workspace_id.clone(),
            worktree_id: run.worktree_id.clone(),
            step_id: step.id.clone(),
            prompt: compose_step_message(
                &run.user_prompt,
                &step.prompt,
                run.dispatch_count == 0,
                revision_note,
            ),
            runtime_options: run.runtime_options.clone(),
            default_access_level: run.default_access_level,
        };

        match self
            .dispatcher
            .dispatch_step_prompt(&DispatchContext::new(), &request)
        {
            Ok(result) => {
                let run = &mut snapshot.run;
                run.session_id = Some(result.session_id.clone());
                if run.workspace_id.is_empty() || run.worktree_id.is_empty() {
                    run.workspace_id = result.workspace_id.clone();
                    run.worktree_id = result.worktree_id.clone();
                }
                run.dispatch_count += 1;
                run.latest_error = None;
                if let Some(step) = run.current_step_mut() {
                    step.execution = Some(StepExecution {
                        session_id: result.session_id.clone(),
                        turn_id: Some(result.turn_id.clone()),
                        status: StepExecutionStatus::Dispatched,
                        attempt,
                        provider: result.provider.clone(),
                        model: result.model.clone(),
                        dispatched_at: now,
                        completed_at: None,
                        error: None,
                        evidence: None,
                    });
                }
                let event = RunTimelineEvent::new(
                    TimelineEventKind::StepDispatched,
                    now,
                    format!("dispatched step `{}` (attempt {attempt})", request.step_id),
                )
                .at_step(&snapshot.run)
                .with_turn(&result.session_id, Some(&result.turn_id));
                snapshot.record(event);
                Ok(())
            }
            Err(DispatchError::Deferred {
                session_id,
                attempts,
            }) => {
                let reason = format!("session `{session_id}` busy after {attempts} attempts");
                let run = &mut snapshot.run;
                if run.session_id.is_none() {
                    run.session_id = Some(session_id.clone());
                }
                if let Some(step) = run.current_step_mut() {
                    step.execution = Some(StepExecution {
                        session_id: session_id.clone(),
                        turn_id: None,
                        status: StepExecutionStatus::Deferred,
                        attempt,
                        provider: String::new(),
                        model: String::new(),
                        dispatched_at: now,
                        completed_at: None,
                        error: Some(reason.clone()),
                        evidence: None,
                    });
                }
                if run.status == RunStatus::Running {
                    run.status = RunStatus::Paused;
                }
                run.latest_error = Some(reason.clone());
                let event = RunTimelineEvent::new(TimelineEventKind::DispatchDeferred, now, reason)
                    .at_step(&snapshot.run)
                    .with_turn(&session_id, None);
                snapshot.record(event);
                Err(WorkflowError::StepDispatchDeferred {
                    session_id,
                    attempts,
                })
            }
            Err(DispatchError::Canceled { reason }) => {
                snapshot.run.latest_error = Some(reason.clone());
                let event = RunTimelineEvent::new(
                    TimelineEventKind::DispatchFailed,
                    now,
                    format!("dispatch canceled: {reason}"),
                )
                .at_step(&snapshot.run);
                snapshot.record(event);
                Err(WorkflowError::Canceled { reason })
            }
            Err(DispatchError::StepDispatch(reason)) => {
                let event = RunTimelineEvent::new(
                    TimelineEventKind::DispatchFailed,
                    now,
                    format!("dispatch failed: {reason}"),
                )
                .at_step(&snapshot.run);
                snapshot.record(event);
                self.fail_run(snapshot, reason.clone(), now);
                Err(WorkflowError::StepDispatch(reason))
            }
        }
    }

    fn sync_visibility(&self, run: &WorkflowRun) {
        let Some(visibility) = self.visibility.as_ref() else {
            return;
        };
        if let Err(err) = visibility.sync_run_visibility(run) {
            self.log.warn(
                "run.visibility_sync_failed",
                format!("run={}: {err}", run.id),
            );
        }
    }
}

fn transition(
    snapshot: &mut RunStatusSnapshot,
    next: RunStatus,
    action: &str,
) -> Result<(), WorkflowError> {
    let run = &mut snapshot.run;
    if !run.status.can_transition_to(next) {
        return Err(WorkflowError::invalid_transition(&run.id, run.status, action));
    }
    run.status = next;
    Ok(())
}

fn failure_reason(evidence: &TurnEvidence) -> Option<String> {
    evidence.is_failure().then(|| {
        evidence
            .error
            .clone()
            .unwrap_or_else(|| format!("turn {}", evidence.status.as_str()))
    })
}

fn awaits_turn(run: &WorkflowRun, signal: &TurnCompletedSignal) -> bool {
    matches!(run.status, RunStatus::Running | RunStatus::Paused)
        && run
            .current_execution()
            .map(|execution| {
                execution.status == StepExecutionStatus::Dispatched
                    && execution.matches_turn(&signal.session_id, &signal.turn_id)
            })
            .unwrap_or(false)
}

fn paused_on_turn(run: &WorkflowRun, signal: &TurnCompletedSignal) -> bool {
    run.status == RunStatus::Paused
        && run
            .latest_decision
            .as_ref()
            .map(|decision| {
                decision.is_pending_pause()
                    && decision.turn_id.as_deref() == Some(signal.turn_id.as_str())
            })
            .unwrap_or(false)
        && run
            .current_execution()
            .map(|execution| execution.session_id == signal.session_id)
            .unwrap_or(false)
}
