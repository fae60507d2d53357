pub mod bridge;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use bridge::{NotificationBridge, TurnCompletedHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    TurnCompleted,
    ApprovalRequested,
    SessionError,
    DecisionNeeded,
}

impl NotificationTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnCompleted => "turn_completed",
            Self::ApprovalRequested => "approval_requested",
            Self::SessionError => "session_error",
            Self::DecisionNeeded => "decision_needed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub trigger: NotificationTrigger,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub worktree_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub created_at: i64,
}

impl NotificationEvent {
    pub fn new(trigger: NotificationTrigger, created_at: i64) -> Self {
        Self {
            trigger,
            session_id: None,
            workspace_id: None,
            worktree_id: None,
            turn_id: None,
            run_id: None,
            title: String::new(),
            payload: Map::new(),
            created_at,
        }
    }

    pub fn turn_completed(
        session_id: impl Into<String>,
        turn_id: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            turn_id: Some(turn_id.into()),
            title: "Turn completed".to_string(),
            ..Self::new(NotificationTrigger::TurnCompleted, created_at)
        }
    }

    pub fn with_payload(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Downstream sink for notifications (desktop, scripts, webhooks).
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}
