use guidedflow::config::{load_settings, ConfigError, Settings};
use guidedflow::orchestration::checkpoint_policy::CheckpointStyle;
use guidedflow::provider::AccessLevel;
use std::fs;
use tempfile::tempdir;

#[test]
fn settings_module_loads_full_workflow_section() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(
        &path,
        r#"
workflows:
  enabled: true
  max_active_runs: 5
  rollout:
    telemetry_enabled: true
    execution_controls_enabled: true
  checkpoint_policy:
    style: strict
    pause_threshold: 0.5
    hard_gates:
      ambiguity_blocker: true
  dispatch:
    provider: claude
    model: sonnet
    access_level: read_only
    busy_retry_delay_ms: 250
  execution_controls:
    capabilities:
      quality_checks: true
      commit: true
    retry:
      max_attempts: 3
"#,
    )
    .expect("write config");

    let settings = load_settings(&path).expect("load settings");
    let workflows = settings.workflows;
    assert_eq!(workflows.max_active_runs, 5);
    assert!(workflows.rollout.telemetry_enabled);
    assert!(workflows.rollout.execution_controls_enabled);
    assert_eq!(workflows.checkpoint_policy.style, CheckpointStyle::Strict);
    assert_eq!(workflows.checkpoint_policy.pause_threshold, 0.5);
    assert_eq!(workflows.checkpoint_policy.confidence_threshold, 0.7);
    assert!(workflows.checkpoint_policy.hard_gates.ambiguity_blocker);
    assert!(!workflows.checkpoint_policy.hard_gates.pre_commit_approval);
    assert_eq!(workflows.dispatch.provider.as_deref(), Some("claude"));
    assert_eq!(workflows.dispatch.access_level, Some(AccessLevel::ReadOnly));
    assert_eq!(workflows.dispatch.busy_retry_delay_ms, 250);
    assert!(workflows.execution_controls.capabilities.commit);
    assert_eq!(workflows.execution_controls.retry.max_attempts, 3);
    assert!(!workflows.execution_controls.sensitive_files.patterns.is_empty());
}

#[test]
fn settings_module_defaults_when_file_missing() {
    let temp = tempdir().expect("tempdir");
    let settings = load_settings(&temp.path().join("absent.yaml")).expect("defaults");
    assert_eq!(settings, Settings::default());
    assert!(settings.workflows.enabled);
    assert_eq!(settings.workflows.max_active_runs, 3);
}

#[test]
fn settings_module_rejects_out_of_range_thresholds() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(
        &path,
        "workflows:\n  checkpoint_policy:\n    confidence_threshold: 1.5\n",
    )
    .expect("write config");

    let err = load_settings(&path).expect_err("threshold out of range");
    match err {
        ConfigError::Invalid { field, reason } => {
            assert_eq!(field, "workflows.checkpoint_policy");
            assert!(reason.contains("confidence_threshold"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn settings_module_rejects_zero_retry_attempts() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(
        &path,
        "workflows:\n  execution_controls:\n    retry:\n      max_attempts: 0\n",
    )
    .expect("write config");

    let err = load_settings(&path).expect_err("zero attempts");
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn settings_module_reports_parse_errors_with_path() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("config.yaml");
    fs::write(&path, "workflows: [not, a, map]\n").expect("write config");

    let err = load_settings(&path).expect_err("parse error");
    match err {
        ConfigError::Parse { path: reported, .. } => {
            assert_eq!(reported, path.display().to_string())
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
