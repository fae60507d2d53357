use crate::orchestration::run::RunStatus;
use crate::provider::ProviderError;
use crate::sessions::GatewayError;
use crate::shared::errors::StoreError;

/// Coarse classification used by callers to map failures onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Deferred,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Deferred => "deferred",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Conflict | Self::Deferred => 409,
            Self::Unavailable => 503,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("step dispatch failed: {0}")]
    StepDispatch(String),
    #[error("step dispatch deferred: session `{session_id}` still busy after {attempts} attempts")]
    Deferred { session_id: String, attempts: u32 },
    #[error("step dispatch canceled: {reason}")]
    Canceled { reason: String },
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        Self::StepDispatch(value.to_string())
    }
}

impl From<GatewayError> for DispatchError {
    fn from(value: GatewayError) -> Self {
        Self::StepDispatch(value.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow run `{run_id}` not found")]
    RunNotFound { run_id: String },
    #[error("workflow template `{template_id}` not found")]
    TemplateNotFound { template_id: String },
    #[error("workflow run needs a workspace and worktree or a session id")]
    MissingContext,
    #[error("invalid workflow request: {0}")]
    InvalidRequest(String),
    #[error("workflow run `{run_id}` cannot {action} while {status}")]
    InvalidTransition {
        run_id: String,
        status: RunStatus,
        action: String,
    },
    #[error("active workflow run limit reached ({max_active_runs})")]
    RunLimitExceeded { max_active_runs: usize },
    #[error("guided workflows are disabled")]
    Disabled,
    #[error("provider cannot run workflow steps: {0}")]
    UnsupportedProvider(#[from] ProviderError),
    #[error("step dispatch failed: {0}")]
    StepDispatch(String),
    #[error("step dispatch deferred: session `{session_id}` still busy after {attempts} attempts")]
    StepDispatchDeferred { session_id: String, attempts: u32 },
    #[error("step dispatch canceled: {reason}")]
    Canceled { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn invalid_transition(run_id: &str, status: RunStatus, action: &str) -> Self {
        Self::InvalidTransition {
            run_id: run_id.to_string(),
            status,
            action: action.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingContext | Self::InvalidRequest(_) | Self::UnsupportedProvider(_) => {
                ErrorKind::Validation
            }
            Self::RunNotFound { .. } | Self::TemplateNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidTransition { .. } | Self::RunLimitExceeded { .. } => ErrorKind::Conflict,
            Self::StepDispatchDeferred { .. } => ErrorKind::Deferred,
            Self::Disabled | Self::StepDispatch(_) | Self::Canceled { .. } | Self::Store(_) => {
                ErrorKind::Unavailable
            }
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::StepDispatchDeferred { .. })
    }
}

impl From<DispatchError> for WorkflowError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::StepDispatch(reason) => Self::StepDispatch(reason),
            DispatchError::Deferred {
                session_id,
                attempts,
            } => Self::StepDispatchDeferred {
                session_id,
                attempts,
            },
            DispatchError::Canceled { reason } => Self::Canceled { reason },
        }
    }
}
