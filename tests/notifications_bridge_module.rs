mod common;

use common::{harness, test_settings, Harness, RecordingPublisher};
use guidedflow::notifications::{
    NotificationBridge, NotificationError, NotificationEvent, NotificationPublisher,
    NotificationTrigger,
};
use guidedflow::orchestration::{CreateRunRequest, RunStatus, WorkflowRun};
use guidedflow::shared::logging::EventLog;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn started_run(h: &Harness) -> WorkflowRun {
    let run = h
        .service
        .create_run(CreateRunRequest {
            template_id: "two-step".to_string(),
            workspace_id: "ws-1".to_string(),
            worktree_id: "wt-1".to_string(),
            prompt: "Fix X".to_string(),
            name: Some("Fix X run".to_string()),
            ..CreateRunRequest::default()
        })
        .expect("create run");
    h.service.start_run(&run.id).expect("start run")
}

fn bridge(
    h: &Harness,
    downstream: Arc<dyn NotificationPublisher>,
    state_root: &Path,
) -> NotificationBridge {
    NotificationBridge::new(
        downstream,
        h.service.clone(),
        h.clock.clone(),
        EventLog::new(state_root),
    )
}

fn current_turn(run: &WorkflowRun) -> (String, String) {
    let execution = run.current_execution().expect("step dispatched");
    (
        execution.session_id.clone(),
        execution.turn_id.clone().expect("turn id"),
    )
}

fn ambiguous_turn(session_id: &str, turn_id: &str) -> NotificationEvent {
    NotificationEvent::turn_completed(session_id, turn_id, common::NOW)
        .with_payload("ambiguity", true)
}

fn decisions(events: &[NotificationEvent]) -> Vec<&NotificationEvent> {
    events
        .iter()
        .filter(|event| event.trigger == NotificationTrigger::DecisionNeeded)
        .collect()
}

#[test]
fn bridge_emits_one_decision_for_replayed_turn() {
    let temp = tempdir().expect("tempdir");
    let h = harness(temp.path(), test_settings());
    let recorder = Arc::new(RecordingPublisher::default());
    let bridge = bridge(&h, recorder.clone(), temp.path());
    let run = started_run(&h);
    let (session_id, turn_id) = current_turn(&run);

    let event = ambiguous_turn(&session_id, &turn_id);
    bridge.publish(&event).expect("first publish");
    bridge.publish(&event).expect("replayed publish");

    let events = recorder.events();
    let forwarded = events
        .iter()
        .filter(|event| event.trigger == NotificationTrigger::TurnCompleted)
        .count();
    assert_eq!(forwarded, 2);

    let decisions = decisions(&events);
    assert_eq!(decisions.len(), 1);
    let decision = decisions[0];
    assert_eq!(decision.run_id.as_deref(), Some(run.id.as_str()));
    assert_eq!(decision.payload_str("runName"), Some("Fix X run"));
    assert_eq!(decision.payload_str("stepId"), Some("step-1"));
    assert_eq!(decision.payload_str("recommended_action"), Some("request_revision"));
    let risk = decision
        .payload
        .get("risk_summary")
        .expect("risk summary present");
    assert_eq!(risk["severity"], "high");

    let paused = h.service.get_run(&run.id).expect("get run");
    assert_eq!(paused.status, RunStatus::Paused);
    let pending = paused.latest_decision.expect("decision recorded");
    assert_eq!(decision.payload_str("decisionId"), Some(pending.id.as_str()));
}

#[test]
fn bridge_forwards_other_triggers_untouched() {
    let temp = tempdir().expect("tempdir");
    let h = harness(temp.path(), test_settings());
    let recorder = Arc::new(RecordingPublisher::default());
    let bridge = bridge(&h, recorder.clone(), temp.path());
    let run = started_run(&h);

    let mut error_event = NotificationEvent::new(NotificationTrigger::SessionError, common::NOW);
    error_event.session_id = Some("sess-x".to_string());
    error_event.title = "Session crashed".to_string();
    bridge.publish(&error_event).expect("publish");

    assert_eq!(recorder.events(), vec![error_event]);
    let unchanged = h.service.get_run(&run.id).expect("get run");
    assert_eq!(unchanged.status, RunStatus::Running);
    assert_eq!(h.gateway.sent().len(), 1);
}

#[test]
fn bridge_advances_run_without_decision_on_clean_turn() {
    let temp = tempdir().expect("tempdir");
    let h = harness(temp.path(), test_settings());
    let recorder = Arc::new(RecordingPublisher::default());
    let bridge = bridge(&h, recorder.clone(), temp.path());
    let run = started_run(&h);
    let (session_id, turn_id) = current_turn(&run);

    bridge
        .publish(&NotificationEvent::turn_completed(&session_id, &turn_id, common::NOW))
        .expect("publish");

    assert!(decisions(&recorder.events()).is_empty());
    assert_eq!(h.gateway.sent().len(), 2);
    let run = h.service.get_run(&run.id).expect("get run");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_step().map(|step| step.id.as_str()), Some("step-2"));
}

#[test]
fn bridge_ignores_turns_without_identifiers() {
    let temp = tempdir().expect("tempdir");
    let h = harness(temp.path(), test_settings());
    let recorder = Arc::new(RecordingPublisher::default());
    let bridge = bridge(&h, recorder.clone(), temp.path());
    let run = started_run(&h);

    let mut event = NotificationEvent::new(NotificationTrigger::TurnCompleted, common::NOW);
    event.session_id = Some("sess-x".to_string());
    bridge.publish(&event).expect("publish");

    assert_eq!(recorder.events().len(), 1);
    let run = h.service.get_run(&run.id).expect("get run");
    assert_eq!(run.status, RunStatus::Running);
}

/// Fails the first `failures` decision_needed deliveries, records the rest.
struct FlakyPublisher {
    failures: AtomicUsize,
    delivered: Mutex<Vec<NotificationEvent>>,
}

impl NotificationPublisher for FlakyPublisher {
    fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        if event.trigger == NotificationTrigger::DecisionNeeded
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(NotificationError::Delivery("sink offline".to_string()));
        }
        self.delivered.lock().expect("delivered").push(event.clone());
        Ok(())
    }
}

#[test]
fn bridge_retries_decision_after_failed_delivery() {
    let temp = tempdir().expect("tempdir");
    let h = harness(temp.path(), test_settings());
    let flaky = Arc::new(FlakyPublisher {
        failures: AtomicUsize::new(1),
        delivered: Mutex::new(Vec::new()),
    });
    let bridge = bridge(&h, flaky.clone(), temp.path());
    let run = started_run(&h);
    let (session_id, turn_id) = current_turn(&run);

    let event = ambiguous_turn(&session_id, &turn_id);
    bridge.publish(&event).expect("first publish");
    bridge.publish(&event).expect("second publish");
    bridge.publish(&event).expect("third publish");

    let delivered = flaky.delivered.lock().expect("delivered").clone();
    assert_eq!(decisions(&delivered).len(), 1);
}
