use crate::notifications::{
    NotificationError, NotificationEvent, NotificationPublisher, NotificationTrigger,
};
use crate::orchestration::error::WorkflowError;
use crate::orchestration::run::{RunStatus, WorkflowRun};
use crate::orchestration::run_service::{RunService, TurnCompletedSignal};
use crate::shared::logging::EventLog;
use crate::shared::time::Clock;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Receives finished turns and reports the runs they touched.
pub trait TurnCompletedHandler: Send + Sync {
    fn on_turn_completed(
        &self,
        signal: &TurnCompletedSignal,
    ) -> Result<Vec<WorkflowRun>, WorkflowError>;
}

impl TurnCompletedHandler for RunService {
    fn on_turn_completed(
        &self,
        signal: &TurnCompletedSignal,
    ) -> Result<Vec<WorkflowRun>, WorkflowError> {
        RunService::on_turn_completed(self, signal)
    }
}

/// Publisher wrapper that forwards every event and, on turn completion,
/// drives workflow runs and announces each new pause decision once.
pub struct NotificationBridge {
    downstream: Arc<dyn NotificationPublisher>,
    runs: Arc<dyn TurnCompletedHandler>,
    emitted: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
    log: EventLog,
}

impl NotificationBridge {
    pub fn new(
        downstream: Arc<dyn NotificationPublisher>,
        runs: Arc<dyn TurnCompletedHandler>,
        clock: Arc<dyn Clock>,
        log: EventLog,
    ) -> Self {
        Self {
            downstream,
            runs,
            emitted: Mutex::new(HashSet::new()),
            clock,
            log,
        }
    }

    fn handle_turn_completed(&self, event: &NotificationEvent) {
        let Some(signal) = signal_from_event(event) else {
            self.log.warn(
                "bridge.turn_completed_ignored",
                "turn-completed event without session or turn id",
            );
            return;
        };
        let runs = match self.runs.on_turn_completed(&signal) {
            Ok(runs) => runs,
            Err(err) => {
                self.log.error(
                    "bridge.turn_completed_failed",
                    format!(
                        "session={} turn={}: {err}",
                        signal.session_id, signal.turn_id
                    ),
                );
                return;
            }
        };
        for run in runs {
            self.announce_decision(&run, &signal);
        }
    }

    fn announce_decision(&self, run: &WorkflowRun, signal: &TurnCompletedSignal) {
        if run.status != RunStatus::Paused {
            return;
        }
        let Some(decision) = run
            .latest_decision
            .as_ref()
            .filter(|decision| decision.is_pending_pause())
        else {
            return;
        };

        let key = format!("{}|{}", run.id, decision.id);
        {
            let mut emitted = self
                .emitted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !emitted.insert(key.clone()) {
                return;
            }
        }

        let metadata = &decision.metadata;
        let mut event = NotificationEvent::new(
            NotificationTrigger::DecisionNeeded,
            self.clock.now_secs(),
        )
        .with_payload("runId", run.id.clone())
        .with_payload("runName", run.name.clone())
        .with_payload("decisionId", decision.id.clone())
        .with_payload("phaseId", decision.phase_id.clone())
        .with_payload("stepId", decision.step_id.clone())
        .with_payload("reason", decision.reason.clone())
        .with_payload(
            "risk_summary",
            json!({
                "severity": metadata.severity.as_str(),
                "tier": metadata.tier,
                "score": metadata.score,
                "threshold": metadata.pause_threshold,
            }),
        )
        .with_payload("recommended_action", metadata.recommended_action.as_str())
        .with_payload(
            "trigger_reasons",
            Value::from(metadata.reasons.clone()),
        );
        event.title = format!("Workflow `{}` needs a decision", run.name);
        event.run_id = Some(run.id.clone());
        event.session_id = Some(signal.session_id.clone());
        event.turn_id = decision.turn_id.clone();
        event.workspace_id = Some(run.workspace_id.clone()).filter(|id| !id.is_empty());
        event.worktree_id = Some(run.worktree_id.clone()).filter(|id| !id.is_empty());

        match self.downstream.publish(&event) {
            Ok(()) => self.log.info(
                "bridge.decision_needed",
                format!("run={} decision={}", run.id, decision.id),
            ),
            Err(err) => {
                // Not delivered, so a replay may try again.
                self.emitted
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&key);
                self.log.error(
                    "bridge.decision_needed_failed",
                    format!("run={} decision={}: {err}", run.id, decision.id),
                );
            }
        }
    }
}

impl NotificationPublisher for NotificationBridge {
    fn publish(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        let forwarded = self.downstream.publish(event);
        if event.trigger == NotificationTrigger::TurnCompleted {
            self.handle_turn_completed(event);
        }
        forwarded
    }
}

fn signal_from_event(event: &NotificationEvent) -> Option<TurnCompletedSignal> {
    let session_id = event
        .session_id
        .as_deref()
        .or_else(|| event.payload_str("sessionId"))
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    let turn_id = event
        .turn_id
        .as_deref()
        .or_else(|| event.payload_str("turnId"))
        .map(str::trim)
        .filter(|id| !id.is_empty())?;

    let strings = |key: &str| -> Vec<String> {
        event
            .payload
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let flag = |key: &str| event.payload.get(key).and_then(Value::as_bool).unwrap_or(false);

    Some(TurnCompletedSignal {
        session_id: session_id.to_string(),
        turn_id: turn_id.to_string(),
        workspace_id: event.workspace_id.clone(),
        worktree_id: event.worktree_id.clone(),
        status: event.payload_str("status").map(str::to_string),
        error: event.payload_str("error").map(str::to_string),
        output: event.payload_str("output").unwrap_or_default().to_string(),
        confidence: event.payload.get("confidence").and_then(Value::as_f64),
        ambiguity: flag("ambiguity"),
        files_touched: strings("files_touched"),
        sensitive_files: strings("sensitive_files"),
        checks_failed: flag("checks_failed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_reads_evidence_from_payload() {
        let event = NotificationEvent::turn_completed("sess-1", "turn-1", 10)
            .with_payload("status", "failed")
            .with_payload("error", "boom")
            .with_payload("confidence", 0.4)
            .with_payload("files_touched", json!(["a.rs", "b.rs"]))
            .with_payload("checks_failed", true);
        let signal = signal_from_event(&event).expect("signal");
        assert_eq!(signal.session_id, "sess-1");
        assert_eq!(signal.status.as_deref(), Some("failed"));
        assert_eq!(signal.error.as_deref(), Some("boom"));
        assert_eq!(signal.confidence, Some(0.4));
        assert_eq!(signal.files_touched.len(), 2);
        assert!(signal.checks_failed);
        assert!(!signal.ambiguity);
    }

    #[test]
    fn signal_requires_session_and_turn() {
        let mut event = NotificationEvent::turn_completed("sess-1", " ", 10);
        assert!(signal_from_event(&event).is_none());
        event.turn_id = None;
        event = event.with_payload("turnId", "turn-9");
        assert_eq!(
            signal_from_event(&event).map(|signal| signal.turn_id),
            Some("turn-9".to_string())
        );
    }
}
