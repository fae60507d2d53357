use guidedflow::orchestration::{ErrorKind, RunStatus, WorkflowError};
use guidedflow::provider::ProviderError;
use guidedflow::shared::errors::StoreError;

#[test]
fn orchestration_error_module_describes_invalid_transition() {
    let err = WorkflowError::invalid_transition("run-1", RunStatus::Completed, "pause");
    assert_eq!(
        err.to_string(),
        "workflow run `run-1` cannot pause while completed"
    );
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn orchestration_error_module_classifies_wrapped_errors() {
    let unsupported: WorkflowError =
        ProviderError::DispatchUnsupported("terminal".to_string()).into();
    assert_eq!(unsupported.kind(), ErrorKind::Validation);
    assert_eq!(unsupported.http_status(), 400);

    let store: WorkflowError = StoreError::Unavailable("disk full".to_string()).into();
    assert_eq!(store.kind(), ErrorKind::Unavailable);
    assert_eq!(store.to_string(), "store unavailable: disk full");

    let deferred = WorkflowError::StepDispatchDeferred {
        session_id: "sess-1".to_string(),
        attempts: 3,
    };
    assert!(deferred.is_deferred());
    assert_eq!(deferred.kind().as_str(), "deferred");
}
