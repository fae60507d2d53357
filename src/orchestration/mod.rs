pub mod checkpoint_policy;
pub mod dispatch;
pub mod error;
pub mod execution_controls;
pub mod metrics;
pub mod reconcile;
pub mod run;
pub mod run_service;
pub mod run_store;

pub use checkpoint_policy::{
    evaluate_checkpoint, resolve_checkpoint_policy, CheckpointDecisionMetadata, CheckpointGate,
    CheckpointGates, CheckpointPolicy, CheckpointPolicyOverride, CheckpointStyle, DecisionAction,
    Severity, TurnEvidence, TurnOutcome,
};
pub use dispatch::{
    DispatchContext, DispatchDefaults, StepDispatchRequest, StepDispatchResult, StepDispatcher,
    BUSY_RETRY_LIMIT,
};
pub use error::{DispatchError, ErrorKind, WorkflowError};
pub use execution_controls::ExecutionControls;
pub use metrics::{FileRunMetricsStore, RunMetricsSnapshot, RunMetricsStore};
pub use reconcile::{MissingRunSnapshotPolicy, ReconcileReport, SnapshotReconciler, TombstonePolicy};
pub use run::{CheckpointDecision, DecisionKind, RunStatus, StepExecutionStatus, WorkflowRun};
pub use run_service::{
    CreateRunRequest, RunService, RunServiceDeps, SessionVisibilitySync, TurnCompletedSignal,
};
pub use run_store::{FileRunStore, RunStatusSnapshot, RunStore, RunTimelineEvent, TimelineEventKind};
