#![allow(dead_code)]

use guidedflow::config::WorkflowSettings;
use guidedflow::notifications::{NotificationError, NotificationEvent, NotificationPublisher};
use guidedflow::orchestration::{RunService, RunServiceDeps};
use guidedflow::provider::RuntimeOptions;
use guidedflow::sessions::{
    FileSessionMetaStore, GatewayError, SendReceipt, SessionGateway, SessionMeta,
    SessionMetaStore, SessionSummary, StartSessionRequest,
};
use guidedflow::shared::time::FixedClock;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const NOW: i64 = 1_700_000_000;

pub const TWO_STEP_TEMPLATE: &str = r#"
id: two-step
name: Two step
phases:
  - id: phase-1
    name: Planning
    steps:
      - id: step-1
        name: Overall plan
        prompt: overall plan prompt
      - id: step-2
        name: Phase plan
        prompt: phase plan prompt
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub session_id: String,
    pub message: String,
    pub with_options: bool,
}

#[derive(Default)]
struct GatewayState {
    sessions: Vec<SessionSummary>,
    scripted_failures: HashMap<String, VecDeque<String>>,
    send_attempts: HashMap<String, usize>,
    sent: Vec<SentMessage>,
    started: Vec<StartSessionRequest>,
    next_session: usize,
    next_turn: usize,
    next_activity: i64,
}

/// In-memory session host. Ownership comes from the shared metadata store,
/// like the real gateway joins sessions with their metadata.
pub struct FakeGateway {
    meta_store: Arc<dyn SessionMetaStore>,
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new(meta_store: Arc<dyn SessionMetaStore>) -> Self {
        Self {
            meta_store,
            state: Mutex::new(GatewayState::default()),
        }
    }

    pub fn add_session(
        &self,
        session_id: &str,
        workspace_id: &str,
        worktree_id: &str,
        provider: &str,
        last_active_at: i64,
    ) {
        let mut state = self.state.lock().expect("gateway state");
        state.sessions.push(SessionSummary {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            worktree_id: worktree_id.to_string(),
            provider: provider.to_string(),
            model: format!("{provider}-model"),
            last_active_at,
            meta: SessionMeta::new(session_id, workspace_id, worktree_id),
        });
    }

    pub fn remove_session(&self, session_id: &str) {
        let mut state = self.state.lock().expect("gateway state");
        state.sessions.retain(|s| s.session_id != session_id);
    }

    /// Makes the next sends to `session_id` fail with `errors`, in order.
    pub fn fail_next_sends(&self, session_id: &str, errors: &[&str]) {
        let mut state = self.state.lock().expect("gateway state");
        state
            .scripted_failures
            .entry(session_id.to_string())
            .or_default()
            .extend(errors.iter().map(|err| err.to_string()));
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().expect("gateway state").sent.clone()
    }

    pub fn started(&self) -> Vec<StartSessionRequest> {
        self.state.lock().expect("gateway state").started.clone()
    }

    pub fn send_attempts(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .expect("gateway state")
            .send_attempts
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    fn joined(&self, workspace_id: &str, worktree_id: &str) -> Vec<SessionSummary> {
        let sessions = self.state.lock().expect("gateway state").sessions.clone();
        sessions
            .into_iter()
            .filter(|s| s.workspace_id == workspace_id && s.worktree_id == worktree_id)
            .map(|mut summary| {
                if let Some(meta) = self
                    .meta_store
                    .get(&summary.session_id)
                    .expect("read session meta")
                {
                    summary.meta = meta;
                }
                summary
            })
            .collect()
    }

    fn send(
        &self,
        session_id: &str,
        message: &str,
        with_options: bool,
    ) -> Result<SendReceipt, GatewayError> {
        let mut state = self.state.lock().expect("gateway state");
        if !state.sessions.iter().any(|s| s.session_id == session_id) {
            return Err(GatewayError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        *state.send_attempts.entry(session_id.to_string()).or_insert(0) += 1;
        if let Some(reason) = state
            .scripted_failures
            .get_mut(session_id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(GatewayError::Rejected {
                session_id: session_id.to_string(),
                reason,
            });
        }
        state.next_turn += 1;
        let turn_id = format!("turn-{}", state.next_turn);
        state.sent.push(SentMessage {
            session_id: session_id.to_string(),
            message: message.to_string(),
            with_options,
        });
        Ok(SendReceipt { turn_id })
    }
}

impl SessionGateway for FakeGateway {
    fn list_with_meta(
        &self,
        workspace_id: &str,
        worktree_id: &str,
    ) -> Result<Vec<SessionSummary>, GatewayError> {
        Ok(self
            .joined(workspace_id, worktree_id)
            .into_iter()
            .filter(|s| s.meta.owned_run_id().is_none())
            .collect())
    }

    fn list_with_meta_including_workflow_owned(
        &self,
        workspace_id: &str,
        worktree_id: &str,
    ) -> Result<Vec<SessionSummary>, GatewayError> {
        Ok(self.joined(workspace_id, worktree_id))
    }

    fn start(&self, request: &StartSessionRequest) -> Result<SessionSummary, GatewayError> {
        let mut state = self.state.lock().expect("gateway state");
        state.next_session += 1;
        state.next_activity += 1;
        let summary = SessionSummary {
            session_id: format!("started-{}", state.next_session),
            workspace_id: request.workspace_id.clone(),
            worktree_id: request.worktree_id.clone(),
            provider: request.provider.clone(),
            model: request.model.clone(),
            last_active_at: NOW + state.next_activity,
            meta: SessionMeta::new(
                format!("started-{}", state.next_session),
                request.workspace_id.clone(),
                request.worktree_id.clone(),
            ),
        };
        state.started.push(request.clone());
        state.sessions.push(summary.clone());
        Ok(summary)
    }

    fn send_message(&self, session_id: &str, message: &str) -> Result<SendReceipt, GatewayError> {
        self.send(session_id, message, false)
    }

    fn send_message_with_options(
        &self,
        session_id: &str,
        message: &str,
        _options: &RuntimeOptions,
    ) -> Result<SendReceipt, GatewayError> {
        self.send(session_id, message, true)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().expect("events").clone()
    }
}

impl NotificationPublisher for RecordingPublisher {
    fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        self.events.lock().expect("events").push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<RunService>,
    pub gateway: Arc<FakeGateway>,
    pub meta_store: Arc<FileSessionMetaStore>,
    pub clock: Arc<FixedClock>,
}

pub fn test_settings() -> WorkflowSettings {
    let mut settings = WorkflowSettings::default();
    settings.dispatch.busy_retry_delay_ms = 0;
    settings
}

pub fn write_template(state_root: &Path, file_name: &str, yaml: &str) {
    let dir = state_root.join("workflows/templates");
    fs::create_dir_all(&dir).expect("create templates dir");
    fs::write(dir.join(file_name), yaml).expect("write template");
}

pub fn harness(state_root: &Path, settings: WorkflowSettings) -> Harness {
    write_template(state_root, "two-step.yaml", TWO_STEP_TEMPLATE);
    let meta_store = Arc::new(FileSessionMetaStore::new(state_root));
    let gateway = Arc::new(FakeGateway::new(meta_store.clone()));
    let clock = Arc::new(FixedClock::new(NOW));
    let deps = RunServiceDeps::file_backed(state_root, &settings, gateway.clone(), clock.clone());
    Harness {
        service: Arc::new(RunService::new(settings, deps)),
        gateway,
        meta_store,
        clock,
    }
}
