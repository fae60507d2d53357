use crate::orchestration::checkpoint_policy::{
    CheckpointDecisionMetadata, CheckpointPolicy, DecisionAction, TurnEvidence,
};
use crate::orchestration::execution_controls::ExecutionControls;
use crate::provider::{AccessLevel, RuntimeOptions};
use crate::templates::WorkflowTemplate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunStatus::Created, RunStatus::Running)
                | (RunStatus::Created, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Paused, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Dispatched,
    Deferred,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub session_id: String,
    #[serde(default)]
    pub turn_id: Option<String>,
    pub status: StepExecutionStatus,
    pub attempt: u32,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub dispatched_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Turn evidence recorded while the run was paused, consumed on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<TurnEvidence>,
}

impl StepExecution {
    pub fn turn_in_flight(&self) -> bool {
        self.status == StepExecutionStatus::Dispatched && self.turn_id.is_some()
    }

    pub fn matches_turn(&self, session_id: &str, turn_id: &str) -> bool {
        self.session_id == session_id && self.turn_id.as_deref() == Some(turn_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub commit: bool,
    #[serde(default)]
    pub execution: Option<StepExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPhase {
    pub id: String,
    pub name: String,
    pub steps: Vec<RunStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    AutoContinue,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointDecision {
    pub id: String,
    pub kind: DecisionKind,
    pub phase_id: String,
    pub step_id: String,
    #[serde(default)]
    pub turn_id: Option<String>,
    pub reason: String,
    pub metadata: CheckpointDecisionMetadata,
    pub created_at: i64,
    #[serde(default)]
    pub resolved_at: Option<i64>,
    #[serde(default)]
    pub resolution: Option<DecisionAction>,
    #[serde(default)]
    pub note: Option<String>,
}

impl CheckpointDecision {
    pub fn is_pending_pause(&self) -> bool {
        self.kind == DecisionKind::Pause && self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    pub name: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub worktree_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_prompt: String,
    pub status: RunStatus,
    #[serde(default)]
    pub dismissed_at: Option<i64>,
    pub phases: Vec<RunPhase>,
    #[serde(default)]
    pub current_phase_index: usize,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub dispatch_count: u32,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    #[serde(default)]
    pub execution_controls: ExecutionControls,
    #[serde(default)]
    pub runtime_options: Option<RuntimeOptions>,
    #[serde(default)]
    pub default_access_level: AccessLevel,
    #[serde(default)]
    pub latest_decision: Option<CheckpointDecision>,
    #[serde(default)]
    pub latest_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

/// Inputs for a new run record; the template is copied into the run so later
/// template edits do not reach it.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub id: String,
    pub template: &'a WorkflowTemplate,
    pub workspace_id: String,
    pub worktree_id: String,
    pub session_id: Option<String>,
    pub user_prompt: String,
    pub checkpoint_policy: CheckpointPolicy,
    pub execution_controls: ExecutionControls,
    pub runtime_options: Option<RuntimeOptions>,
    pub now: i64,
}

impl WorkflowRun {
    pub fn from_template(new_run: NewRun<'_>) -> Self {
        let template = new_run.template;
        Self {
            id: new_run.id,
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            name: template.name.clone(),
            workspace_id: new_run.workspace_id,
            worktree_id: new_run.worktree_id,
            session_id: new_run.session_id,
            user_prompt: new_run.user_prompt,
            status: RunStatus::Created,
            dismissed_at: None,
            phases: template
                .phases
                .iter()
                .map(|phase| RunPhase {
                    id: phase.id.clone(),
                    name: phase.name.clone(),
                    steps: phase
                        .steps
                        .iter()
                        .map(|step| RunStep {
                            id: step.id.clone(),
                            name: step.name.clone(),
                            prompt: step.prompt.clone(),
                            commit: step.commit,
                            execution: None,
                        })
                        .collect(),
                })
                .collect(),
            current_phase_index: 0,
            current_step_index: 0,
            dispatch_count: 0,
            checkpoint_policy: new_run.checkpoint_policy,
            execution_controls: new_run.execution_controls,
            runtime_options: new_run.runtime_options,
            default_access_level: template.default_access_level,
            latest_decision: None,
            latest_error: None,
            created_at: new_run.now,
            updated_at: new_run.now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Non-terminal and not dismissed; counts against the active-run limit.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal() && self.dismissed_at.is_none()
    }

    pub fn current_phase(&self) -> Option<&RunPhase> {
        self.phases.get(self.current_phase_index)
    }

    pub fn current_step(&self) -> Option<&RunStep> {
        self.current_phase()
            .and_then(|phase| phase.steps.get(self.current_step_index))
    }

    pub fn current_step_mut(&mut self) -> Option<&mut RunStep> {
        let step_index = self.current_step_index;
        self.phases
            .get_mut(self.current_phase_index)
            .and_then(|phase| phase.steps.get_mut(step_index))
    }

    pub fn current_execution(&self) -> Option<&StepExecution> {
        self.current_step().and_then(|step| step.execution.as_ref())
    }

    /// Moves to the next step; returns false once the template is exhausted.
    pub fn advance_position(&mut self) -> bool {
        let Some(phase) = self.phases.get(self.current_phase_index) else {
            return false;
        };
        if self.current_step_index + 1 < phase.steps.len() {
            self.current_step_index += 1;
            return true;
        }
        let mut next_phase = self.current_phase_index + 1;
        while let Some(phase) = self.phases.get(next_phase) {
            if !phase.steps.is_empty() {
                self.current_phase_index = next_phase;
                self.current_step_index = 0;
                return true;
            }
            next_phase += 1;
        }
        false
    }

    pub fn step_ids(&self) -> (String, String) {
        let phase_id = self
            .current_phase()
            .map(|phase| phase.id.clone())
            .unwrap_or_default();
        let step_id = self
            .current_step()
            .map(|step| step.id.clone())
            .unwrap_or_default();
        (phase_id, step_id)
    }
}
