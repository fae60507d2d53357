mod common;

use common::{FakeGateway, NOW};
use guidedflow::orchestration::{
    DispatchContext, DispatchDefaults, DispatchError, StepDispatchRequest, StepDispatcher,
    BUSY_RETRY_LIMIT,
};
use guidedflow::provider::{AccessLevel, ProviderRegistry, RuntimeOptions};
use guidedflow::sessions::{FileSessionMetaStore, SessionMeta, SessionMetaStore};
use guidedflow::shared::logging::EventLog;
use guidedflow::shared::time::FixedClock;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

struct Fixture {
    dispatcher: StepDispatcher,
    gateway: Arc<FakeGateway>,
    meta_store: Arc<FileSessionMetaStore>,
}

fn fixture(state_root: &Path, defaults: DispatchDefaults) -> Fixture {
    let meta_store = Arc::new(FileSessionMetaStore::new(state_root));
    let gateway = Arc::new(FakeGateway::new(meta_store.clone()));
    let dispatcher = StepDispatcher::new(
        gateway.clone(),
        meta_store.clone(),
        ProviderRegistry::builtin(),
        defaults,
        Arc::new(FixedClock::new(NOW)),
        EventLog::new(state_root),
    );
    Fixture {
        dispatcher,
        gateway,
        meta_store,
    }
}

fn fast_defaults() -> DispatchDefaults {
    DispatchDefaults {
        busy_retry_delay_ms: 0,
        ..DispatchDefaults::default()
    }
}

fn request(session_id: Option<&str>) -> StepDispatchRequest {
    StepDispatchRequest {
        run_id: "run-1".to_string(),
        session_id: session_id.map(str::to_string),
        workspace_id: "ws-1".to_string(),
        worktree_id: "wt-1".to_string(),
        step_id: "step-1".to_string(),
        prompt: "do the step".to_string(),
        runtime_options: None,
        default_access_level: AccessLevel::ReadOnly,
    }
}

fn own_session(meta_store: &FileSessionMetaStore, session_id: &str, run_id: &str) {
    let mut meta = SessionMeta::new(session_id, "ws-1", "wt-1");
    meta.workflow_run_id = Some(run_id.to_string());
    meta_store.upsert(&meta).expect("write meta");
}

#[test]
fn dispatch_busy_owned_session_defers_after_bounded_retries() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-owned", "ws-1", "wt-1", "codex", 10);
    own_session(&f.meta_store, "sess-owned", "run-1");
    f.gateway.fail_next_sends("sess-owned", &["Turn already in progress"; 5]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect_err("busy session defers");
    match err {
        DispatchError::Deferred {
            session_id,
            attempts,
        } => {
            assert_eq!(session_id, "sess-owned");
            assert_eq!(attempts, BUSY_RETRY_LIMIT);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(f.gateway.send_attempts("sess-owned"), 3);
    assert!(f.gateway.started().is_empty());
}

#[test]
fn dispatch_non_busy_failure_after_busy_retry_is_terminal() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-owned", "ws-1", "wt-1", "codex", 10);
    own_session(&f.meta_store, "sess-owned", "run-1");
    f.gateway
        .fail_next_sends("sess-owned", &["turn in progress", "model overloaded"]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect_err("terminal failure");
    match err {
        DispatchError::StepDispatch(reason) => assert!(reason.contains("model overloaded")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(f.gateway.send_attempts("sess-owned"), 2);
    assert!(f.gateway.started().is_empty());
}

#[test]
fn dispatch_busy_auto_selected_session_fails_without_retry() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-free", "ws-1", "wt-1", "claude", 10);
    f.gateway.fail_next_sends("sess-free", &["session is busy"]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect_err("busy auto-selected session");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
    assert_eq!(f.gateway.send_attempts("sess-free"), 1);
}

#[test]
fn dispatch_prefers_most_recent_dispatchable_session() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-old", "ws-1", "wt-1", "codex", 10);
    f.gateway.add_session("sess-new", "ws-1", "wt-1", "claude", 30);
    f.gateway.add_session("sess-shell", "ws-1", "wt-1", "terminal", 50);
    f.gateway.add_session("sess-taken", "ws-1", "wt-1", "codex", 40);
    own_session(&f.meta_store, "sess-taken", "run-other");

    let result = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect("dispatch");
    assert_eq!(result.session_id, "sess-new");
    assert_eq!(result.provider, "claude");
    assert!(!result.started_session);
    let meta = f
        .meta_store
        .get("sess-new")
        .expect("read meta")
        .expect("meta written");
    assert!(meta.is_owned_by("run-1"));
    assert_eq!(meta.last_active_at, Some(NOW));
}

#[test]
fn dispatch_unsupported_provider_only_starts_one_default_session() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(
        temp.path(),
        DispatchDefaults {
            provider: Some("terminal".to_string()),
            model: Some("gpt-5".to_string()),
            ..fast_defaults()
        },
    );
    f.gateway.add_session("sess-shell", "ws-1", "wt-1", "terminal", 10);

    let result = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect("dispatch");
    let started = f.gateway.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].provider, "codex");
    assert_eq!(started[0].model, "gpt-5");
    assert_eq!(started[0].access_level, AccessLevel::ReadOnly);
    assert_eq!(started[0].workflow_run_id.as_deref(), Some("run-1"));
    assert!(result.started_session);
    assert_eq!(result.provider, "codex");

    let sent = f.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].session_id, result.session_id);
    assert_eq!(f.gateway.send_attempts("sess-shell"), 0);
}

#[test]
fn dispatch_reuses_owned_session_without_starting() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-owned", "ws-1", "wt-1", "codex", 5);
    f.gateway.add_session("sess-free", "ws-1", "wt-1", "codex", 50);
    own_session(&f.meta_store, "sess-owned", "run-1");

    let result = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(None))
        .expect("dispatch");
    assert_eq!(result.session_id, "sess-owned");
    assert!(f.gateway.started().is_empty());
}

#[test]
fn dispatch_canceled_context_makes_no_attempts() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-owned", "ws-1", "wt-1", "codex", 10);
    own_session(&f.meta_store, "sess-owned", "run-1");

    let ctx = DispatchContext::new();
    ctx.cancel();
    let err = f
        .dispatcher
        .dispatch_step_prompt(&ctx, &request(Some("sess-owned")))
        .expect_err("canceled");
    assert!(matches!(err, DispatchError::Canceled { .. }));
    assert_eq!(f.gateway.send_attempts("sess-owned"), 0);
    assert!(f.gateway.started().is_empty());
}

#[test]
fn dispatch_explicit_session_links_before_failed_delivery() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-x", "ws-1", "wt-1", "codex", 10);
    f.meta_store
        .upsert(&SessionMeta::new("sess-x", "ws-1", "wt-1"))
        .expect("write meta");
    f.gateway.fail_next_sends("sess-x", &["connection reset"]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(Some("sess-x")))
        .expect_err("delivery fails");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
    let meta = f
        .meta_store
        .get("sess-x")
        .expect("read meta")
        .expect("meta exists");
    assert!(meta.is_owned_by("run-1"));
}

#[test]
fn dispatch_explicit_session_without_meta_is_linked_before_failed_delivery() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-x", "ws-1", "wt-1", "codex", 10);
    f.gateway.fail_next_sends("sess-x", &["connection reset"]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(Some("sess-x")))
        .expect_err("delivery fails");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
    let meta = f
        .meta_store
        .get("sess-x")
        .expect("read meta")
        .expect("meta created");
    assert!(meta.is_owned_by("run-1"));
    assert_eq!(meta.workspace_id, "ws-1");
    assert_eq!(meta.worktree_id, "wt-1");
}

#[test]
fn dispatch_busy_fallback_session_fails_without_deferring() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-backup", "ws-1", "wt-1", "codex", 10);
    own_session(&f.meta_store, "sess-backup", "run-1");
    f.gateway
        .fail_next_sends("sess-backup", &["Turn already in progress"; 5]);

    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(Some("sess-gone")))
        .expect_err("busy fallback session");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
    assert_eq!(f.gateway.send_attempts("sess-backup"), 1);
    assert!(f.gateway.started().is_empty());
}

#[test]
fn dispatch_missing_explicit_session_falls_back_to_owned_session() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-backup", "ws-1", "wt-1", "codex", 10);
    own_session(&f.meta_store, "sess-backup", "run-1");
    own_session(&f.meta_store, "sess-gone", "run-1");

    let result = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(Some("sess-gone")))
        .expect("fallback dispatch");
    assert_eq!(result.session_id, "sess-backup");

    let lonely = fixture(temp.path().join("other").as_path(), fast_defaults());
    let err = lonely
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &request(Some("sess-gone")))
        .expect_err("no owned session to fall back to");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
    assert!(lonely.gateway.started().is_empty());
}

#[test]
fn dispatch_requires_context_or_session() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    let mut bare = request(None);
    bare.workspace_id.clear();
    let err = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &bare)
        .expect_err("no context");
    assert!(matches!(err, DispatchError::StepDispatch(_)));
}

#[test]
fn dispatch_passes_runtime_options_only_to_capable_providers() {
    let temp = tempdir().expect("tempdir");
    let f = fixture(temp.path(), fast_defaults());
    f.gateway.add_session("sess-oc", "ws-1", "wt-1", "opencode", 10);
    let mut with_options = request(None);
    with_options.runtime_options = Some(RuntimeOptions {
        model: Some("big-model".to_string()),
        ..RuntimeOptions::default()
    });

    let result = f
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &with_options)
        .expect("dispatch");
    assert_eq!(result.session_id, "sess-oc");
    assert_eq!(result.model, "opencode-model");
    assert!(!f.gateway.sent()[0].with_options);

    let codex_root = temp.path().join("codex");
    let g = fixture(&codex_root, fast_defaults());
    g.gateway.add_session("sess-cx", "ws-1", "wt-1", "codex", 10);
    let result = g
        .dispatcher
        .dispatch_step_prompt(&DispatchContext::new(), &with_options)
        .expect("dispatch");
    assert_eq!(result.model, "big-model");
    assert!(g.gateway.sent()[0].with_options);
    let meta = g
        .meta_store
        .get("sess-cx")
        .expect("read meta")
        .expect("meta");
    assert_eq!(
        meta.runtime_options.and_then(|options| options.model),
        Some("big-model".to_string())
    );
}
