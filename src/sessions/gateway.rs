use crate::provider::{AccessLevel, RuntimeOptions};
use crate::sessions::meta_store::SessionMeta;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("session `{session_id}` not found")]
    SessionNotFound { session_id: String },
    #[error("session `{session_id}` rejected message: {reason}")]
    Rejected { session_id: String, reason: String },
    #[error("failed to start session: {0}")]
    Start(String),
    #[error("session gateway unavailable: {0}")]
    Unavailable(String),
}

/// A live session as reported by the gateway, joined with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub provider: String,
    pub model: String,
    pub last_active_at: i64,
    pub meta: SessionMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSessionRequest {
    pub workspace_id: String,
    pub worktree_id: String,
    pub provider: String,
    pub model: String,
    pub access_level: AccessLevel,
    pub reasoning_effort: Option<String>,
    pub workflow_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub turn_id: String,
}

/// Process-level session host. Implementations spawn and talk to agent
/// backends; this crate only routes prompts through it.
pub trait SessionGateway: Send + Sync {
    /// Sessions in the workspace/worktree, excluding ones owned by a workflow run.
    fn list_with_meta(
        &self,
        workspace_id: &str,
        worktree_id: &str,
    ) -> Result<Vec<SessionSummary>, GatewayError>;

    fn list_with_meta_including_workflow_owned(
        &self,
        workspace_id: &str,
        worktree_id: &str,
    ) -> Result<Vec<SessionSummary>, GatewayError>;

    fn start(&self, request: &StartSessionRequest) -> Result<SessionSummary, GatewayError>;

    fn send_message(&self, session_id: &str, message: &str) -> Result<SendReceipt, GatewayError>;

    fn send_message_with_options(
        &self,
        session_id: &str,
        message: &str,
        options: &RuntimeOptions,
    ) -> Result<SendReceipt, GatewayError>;
}
