use super::ConfigError;
use crate::orchestration::checkpoint_policy::CheckpointPolicy;
use crate::orchestration::dispatch::DispatchDefaults;
use crate::orchestration::execution_controls::ExecutionControls;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub workflows: WorkflowSettings,
}

/// Feature flags gating behavior that is still rolling out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RolloutFlags {
    #[serde(default)]
    pub telemetry_enabled: bool,
    #[serde(default)]
    pub execution_controls_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,
    #[serde(default)]
    pub rollout: RolloutFlags,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    #[serde(default)]
    pub dispatch: DispatchDefaults,
    #[serde(default)]
    pub execution_controls: ExecutionControls,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_active_runs: default_max_active_runs(),
            rollout: RolloutFlags::default(),
            checkpoint_policy: CheckpointPolicy::default(),
            dispatch: DispatchDefaults::default(),
            execution_controls: ExecutionControls::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_active_runs() -> usize {
    3
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workflows.validate()
    }
}

impl WorkflowSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_runs == 0 {
            return Err(ConfigError::invalid(
                "workflows.max_active_runs",
                "must be at least 1",
            ));
        }
        self.checkpoint_policy
            .validate()
            .map_err(|reason| ConfigError::invalid("workflows.checkpoint_policy", reason))?;
        self.execution_controls
            .validate()
            .map_err(|reason| ConfigError::invalid("workflows.execution_controls", reason))?;
        if let Some(provider) = self.dispatch.provider.as_deref() {
            if provider.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "workflows.dispatch.provider",
                    "must be non-empty when set",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").expect("parse settings");
        assert!(settings.workflows.enabled);
        assert_eq!(settings.workflows.max_active_runs, 3);
        assert!(!settings.workflows.rollout.telemetry_enabled);
        assert_eq!(settings.workflows.dispatch.busy_retry_delay_ms, 500);
        settings.validate().expect("defaults validate");
    }

    #[test]
    fn zero_run_limit_is_rejected() {
        let settings: Settings = serde_yaml::from_str(
            r#"
workflows:
  max_active_runs: 0
"#,
        )
        .expect("parse settings");
        let err = settings.validate().expect_err("validation should fail");
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "workflows.max_active_runs"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
