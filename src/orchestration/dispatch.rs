use crate::orchestration::error::DispatchError;
use crate::provider::{AccessLevel, ProviderRegistry, RuntimeOptions};
use crate::sessions::{
    SendReceipt, SessionGateway, SessionMeta, SessionMetaStore, SessionSummary,
    StartSessionRequest,
};
use crate::shared::logging::EventLog;
use crate::shared::time::Clock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Attempts made against a busy owned session before the dispatch is deferred.
pub const BUSY_RETRY_LIMIT: u32 = 3;

const BUSY_SIGNATURES: [&str; 3] = [
    "turn already in progress",
    "turn in progress",
    "session is busy",
];

pub fn is_busy_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    BUSY_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

/// Builds the outbound text for a step. The run's original prompt leads only
/// the very first dispatch.
pub fn compose_step_message(
    user_prompt: &str,
    step_prompt: &str,
    first_dispatch: bool,
    revision_note: Option<&str>,
) -> String {
    let user_prompt = user_prompt.trim();
    let mut message = if first_dispatch && !user_prompt.is_empty() {
        format!("{user_prompt}\n\n{step_prompt}")
    } else {
        step_prompt.to_string()
    };
    if let Some(note) = revision_note.map(str::trim).filter(|note| !note.is_empty()) {
        message.push_str("\n\nRevision note: ");
        message.push_str(note);
    }
    message
}

/// Session defaults used when a dispatch has to start a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDefaults {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default = "default_busy_retry_delay_ms")]
    pub busy_retry_delay_ms: u64,
}

impl Default for DispatchDefaults {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            access_level: None,
            reasoning_effort: None,
            busy_retry_delay_ms: default_busy_retry_delay_ms(),
        }
    }
}

fn default_busy_retry_delay_ms() -> u64 {
    500
}

/// Cancellation and deadline for one dispatch call.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_cancel_flag(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn check(&self) -> Result<(), DispatchError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(DispatchError::Canceled {
                reason: "dispatch canceled".to_string(),
            });
        }
        if self
            .deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
        {
            return Err(DispatchError::Canceled {
                reason: "dispatch deadline elapsed".to_string(),
            });
        }
        Ok(())
    }

    fn sleep(&self, total: Duration) -> Result<(), DispatchError> {
        let mut remaining = total;
        while remaining > Duration::from_millis(0) {
            self.check()?;
            let step = remaining.min(Duration::from_millis(25));
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.check()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDispatchRequest {
    pub run_id: String,
    pub session_id: Option<String>,
    pub workspace_id: String,
    pub worktree_id: String,
    pub step_id: String,
    pub prompt: String,
    pub runtime_options: Option<RuntimeOptions>,
    pub default_access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDispatchResult {
    pub dispatched: bool,
    pub session_id: String,
    pub turn_id: String,
    pub provider: String,
    pub model: String,
    pub workspace_id: String,
    pub worktree_id: String,
    pub started_session: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct DispatchTarget {
    session_id: String,
    workspace_id: String,
    worktree_id: String,
    provider: String,
    model: String,
    owned: bool,
    started: bool,
}

impl DispatchTarget {
    fn from_summary(summary: &SessionSummary, owned: bool) -> Self {
        Self {
            session_id: summary.session_id.clone(),
            workspace_id: summary.workspace_id.clone(),
            worktree_id: summary.worktree_id.clone(),
            provider: summary.provider.clone(),
            model: summary.model.clone(),
            owned,
            started: false,
        }
    }
}

/// Routes step prompts to agent sessions: picks, reuses or starts a session,
/// keeps the ownership link on its metadata, and retries busy owned sessions.
pub struct StepDispatcher {
    gateway: Arc<dyn SessionGateway>,
    meta_store: Arc<dyn SessionMetaStore>,
    registry: ProviderRegistry,
    defaults: DispatchDefaults,
    clock: Arc<dyn Clock>,
    log: EventLog,
}

impl StepDispatcher {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        meta_store: Arc<dyn SessionMetaStore>,
        registry: ProviderRegistry,
        defaults: DispatchDefaults,
        clock: Arc<dyn Clock>,
        log: EventLog,
    ) -> Self {
        Self {
            gateway,
            meta_store,
            registry,
            defaults,
            clock,
            log,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn dispatch_step_prompt(
        &self,
        ctx: &DispatchContext,
        request: &StepDispatchRequest,
    ) -> Result<StepDispatchResult, DispatchError> {
        ctx.check()?;
        let explicit_session = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let has_context =
            !request.workspace_id.trim().is_empty() && !request.worktree_id.trim().is_empty();
        if explicit_session.is_none() && !has_context {
            return Err(DispatchError::StepDispatch(format!(
                "step `{}` of run `{}` has neither a workspace/worktree nor a session id",
                request.step_id, request.run_id
            )));
        }

        let target = match explicit_session {
            Some(session_id) => self.resolve_explicit_session(request, session_id)?,
            None => self.resolve_context_session(ctx, request)?,
        };

        let options = request
            .runtime_options
            .as_ref()
            .filter(|options| !options.is_empty())
            .filter(|_| self.registry.supports_runtime_options(&target.provider));
        let (receipt, attempts) = self.deliver(ctx, request, &target, options)?;
        self.record_link(request, &target, options);

        let model = options
            .and_then(|options| options.model.clone())
            .unwrap_or_else(|| target.model.clone());
        self.log.info(
            "dispatch.delivered",
            format!(
                "run={} step={} session={} turn={} provider={} attempts={}",
                request.run_id,
                request.step_id,
                target.session_id,
                receipt.turn_id,
                target.provider,
                attempts
            ),
        );
        Ok(StepDispatchResult {
            dispatched: true,
            session_id: target.session_id,
            turn_id: receipt.turn_id,
            provider: target.provider,
            model,
            workspace_id: target.workspace_id,
            worktree_id: target.worktree_id,
            started_session: target.started,
            attempts,
        })
    }

    fn resolve_explicit_session(
        &self,
        request: &StepDispatchRequest,
        session_id: &str,
    ) -> Result<DispatchTarget, DispatchError> {
        let existing = self.meta_store.get(session_id)?;
        let previously_owned = existing
            .as_ref()
            .map(|meta| meta.is_owned_by(&request.run_id))
            .unwrap_or(false);

        let (workspace_id, worktree_id) = match existing.as_ref() {
            Some(meta) if !meta.workspace_id.is_empty() && !meta.worktree_id.is_empty() => {
                (meta.workspace_id.clone(), meta.worktree_id.clone())
            }
            _ => (request.workspace_id.clone(), request.worktree_id.clone()),
        };

        // The link is written before delivery so a failed send still leaves
        // the session attached to this run.
        let mut linked = existing.unwrap_or_else(|| {
            SessionMeta::new(session_id, workspace_id.clone(), worktree_id.clone())
        });
        linked.workflow_run_id = Some(request.run_id.clone());
        if linked.workspace_id.is_empty() {
            linked.workspace_id = workspace_id.clone();
        }
        if linked.worktree_id.is_empty() {
            linked.worktree_id = worktree_id.clone();
        }
        self.meta_store.upsert(&linked)?;

        if !workspace_id.is_empty() && !worktree_id.is_empty() {
            let sessions = self
                .gateway
                .list_with_meta_including_workflow_owned(&workspace_id, &worktree_id)?;
            if let Some(summary) = sessions.iter().find(|s| s.session_id == session_id) {
                if !self.registry.supports_dispatch(&summary.provider) {
                    return Err(DispatchError::StepDispatch(format!(
                        "session `{session_id}` uses provider `{}` which cannot run workflow steps",
                        summary.provider
                    )));
                }
                return Ok(DispatchTarget::from_summary(summary, previously_owned));
            }
        }

        if request.workspace_id.is_empty() || request.worktree_id.is_empty() {
            return Err(DispatchError::StepDispatch(format!(
                "session `{session_id}` no longer exists"
            )));
        }
        let fallback = self
            .gateway
            .list_with_meta_including_workflow_owned(&request.workspace_id, &request.worktree_id)?
            .into_iter()
            .filter(|summary| {
                summary.session_id != session_id
                    && summary.meta.is_owned_by(&request.run_id)
                    && self.registry.supports_dispatch(&summary.provider)
            })
            .max_by_key(|summary| summary.last_active_at);
        match fallback {
            Some(summary) => {
                self.log.warn(
                    "dispatch.session_fallback",
                    format!(
                        "run={} session={} missing; using owned session {}",
                        request.run_id, session_id, summary.session_id
                    ),
                );
                Ok(DispatchTarget::from_summary(&summary, false))
            }
            None => Err(DispatchError::StepDispatch(format!(
                "session `{session_id}` no longer exists and run `{}` owns no other session",
                request.run_id
            ))),
        }
    }

    fn resolve_context_session(
        &self,
        ctx: &DispatchContext,
        request: &StepDispatchRequest,
    ) -> Result<DispatchTarget, DispatchError> {
        let owned = self
            .gateway
            .list_with_meta_including_workflow_owned(&request.workspace_id, &request.worktree_id)?
            .into_iter()
            .filter(|summary| {
                summary.meta.is_owned_by(&request.run_id)
                    && self.registry.supports_dispatch(&summary.provider)
            })
            .max_by_key(|summary| summary.last_active_at);
        if let Some(summary) = owned {
            return Ok(DispatchTarget::from_summary(&summary, true));
        }

        let candidate = self
            .gateway
            .list_with_meta(&request.workspace_id, &request.worktree_id)?
            .into_iter()
            .filter(|summary| {
                summary.meta.owned_run_id().is_none()
                    && summary.meta.dismissed_at.is_none()
                    && self.registry.supports_dispatch(&summary.provider)
            })
            .max_by_key(|summary| summary.last_active_at);
        if let Some(summary) = candidate {
            return Ok(DispatchTarget::from_summary(&summary, false));
        }

        ctx.check()?;
        let start = self.start_request(request);
        let summary = self.gateway.start(&start)?;
        self.log.info(
            "dispatch.session_started",
            format!(
                "run={} session={} provider={} model={}",
                request.run_id, summary.session_id, summary.provider, summary.model
            ),
        );
        let mut target = DispatchTarget::from_summary(&summary, false);
        if target.provider.is_empty() {
            target.provider = start.provider;
        }
        if target.workspace_id.is_empty() {
            target.workspace_id = request.workspace_id.clone();
            target.worktree_id = request.worktree_id.clone();
        }
        target.started = true;
        Ok(target)
    }

    fn start_request(&self, request: &StepDispatchRequest) -> StartSessionRequest {
        let options = request.runtime_options.clone().unwrap_or_default();
        let configured_provider = options
            .provider
            .as_deref()
            .or(self.defaults.provider.as_deref());
        let provider = self.registry.normalize_dispatch_provider(configured_provider);
        StartSessionRequest {
            workspace_id: request.workspace_id.clone(),
            worktree_id: request.worktree_id.clone(),
            provider,
            model: options
                .model
                .or_else(|| self.defaults.model.clone())
                .unwrap_or_default(),
            access_level: options
                .access_level
                .or(self.defaults.access_level)
                .unwrap_or(request.default_access_level),
            reasoning_effort: options
                .reasoning_effort
                .or_else(|| self.defaults.reasoning_effort.clone()),
            workflow_run_id: Some(request.run_id.clone()),
        }
    }

    fn deliver(
        &self,
        ctx: &DispatchContext,
        request: &StepDispatchRequest,
        target: &DispatchTarget,
        options: Option<&RuntimeOptions>,
    ) -> Result<(SendReceipt, u32), DispatchError> {
        let delay = Duration::from_millis(self.defaults.busy_retry_delay_ms);
        let mut attempt = 0;
        loop {
            ctx.check()?;
            attempt += 1;
            let sent = match options {
                Some(options) => self.gateway.send_message_with_options(
                    &target.session_id,
                    &request.prompt,
                    options,
                ),
                None => self.gateway.send_message(&target.session_id, &request.prompt),
            };
            let err = match sent {
                Ok(receipt) => return Ok((receipt, attempt)),
                Err(err) => err.to_string(),
            };

            if !target.owned || !is_busy_error(&err) {
                self.log.error(
                    "dispatch.failed",
                    format!(
                        "run={} step={} session={} attempt={attempt}: {err}",
                        request.run_id, request.step_id, target.session_id
                    ),
                );
                return Err(DispatchError::StepDispatch(format!(
                    "session `{}`: {err}",
                    target.session_id
                )));
            }
            if attempt >= BUSY_RETRY_LIMIT {
                self.log.warn(
                    "dispatch.deferred",
                    format!(
                        "run={} step={} session={} busy after {attempt} attempts",
                        request.run_id, request.step_id, target.session_id
                    ),
                );
                return Err(DispatchError::Deferred {
                    session_id: target.session_id.clone(),
                    attempts: attempt,
                });
            }
            self.log.info(
                "dispatch.retry_busy",
                format!(
                    "run={} session={} attempt={attempt}",
                    request.run_id, target.session_id
                ),
            );
            ctx.sleep(delay)?;
        }
    }

    /// Refreshes the ownership link once delivery succeeded. The turn is
    /// already running at this point, so a failed write is logged only.
    fn record_link(
        &self,
        request: &StepDispatchRequest,
        target: &DispatchTarget,
        options: Option<&RuntimeOptions>,
    ) {
        let existing = match self.meta_store.get(&target.session_id) {
            Ok(existing) => existing,
            Err(err) => {
                self.log.error("dispatch.link_failed", err.to_string());
                return;
            }
        };
        let mut meta = existing.unwrap_or_else(|| {
            SessionMeta::new(
                target.session_id.clone(),
                target.workspace_id.clone(),
                target.worktree_id.clone(),
            )
        });
        meta.workflow_run_id = Some(request.run_id.clone());
        if !target.workspace_id.is_empty() {
            meta.workspace_id = target.workspace_id.clone();
        }
        if !target.worktree_id.is_empty() {
            meta.worktree_id = target.worktree_id.clone();
        }
        meta.last_active_at = Some(self.clock.now_secs());
        if let Some(options) = options {
            meta.runtime_options = Some(options.clone());
        }
        if let Err(err) = self.meta_store.upsert(&meta) {
            self.log.error(
                "dispatch.link_failed",
                format!("session={}: {err}", target.session_id),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_signatures_match_case_insensitively() {
        assert!(is_busy_error("Turn already in progress for thread t-1"));
        assert!(is_busy_error("rejected: SESSION IS BUSY"));
        assert!(!is_busy_error("session not found"));
    }

    #[test]
    fn first_dispatch_leads_with_user_prompt() {
        assert_eq!(
            compose_step_message("Fix X", "overall plan prompt", true, None),
            "Fix X\n\noverall plan prompt"
        );
        assert_eq!(
            compose_step_message("Fix X", "phase plan prompt", false, None),
            "phase plan prompt"
        );
        assert_eq!(
            compose_step_message("", "step", true, Some(" tighten tests ")),
            "step\n\nRevision note: tighten tests"
        );
    }

    #[test]
    fn canceled_context_fails_check() {
        let ctx = DispatchContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(DispatchError::Canceled { .. })));

        let expired = DispatchContext::with_timeout(Duration::from_millis(0));
        assert!(matches!(expired.check(), Err(DispatchError::Canceled { .. })));
    }
}
