use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionCapabilities {
    #[serde(default)]
    pub quality_checks: bool,
    #[serde(default)]
    pub commit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveFileControls {
    #[serde(default = "default_sensitive_patterns")]
    pub patterns: Vec<String>,
}

impl Default for SensitiveFileControls {
    fn default() -> Self {
        Self {
            patterns: default_sensitive_patterns(),
        }
    }
}

fn default_sensitive_patterns() -> Vec<String> {
    [".env", ".pem", ".key", "secrets", "credentials", "id_rsa"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Rollout-gated controls for how steps execute. Resolved once per run;
/// everything is inert unless the execution-controls rollout flag is on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionControls {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: ExecutionCapabilities,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sensitive_files: SensitiveFileControls,
}

impl ExecutionControls {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            capabilities: ExecutionCapabilities::default(),
            retry: RetryPolicy::default(),
            sensitive_files: SensitiveFileControls {
                patterns: Vec::new(),
            },
        }
    }

    pub fn resolve(configured: &ExecutionControls, rollout_enabled: bool) -> Self {
        if !rollout_enabled {
            return Self::disabled();
        }
        Self {
            enabled: true,
            ..configured.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("`retry.max_attempts` must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.retry.max_attempts.max(1)
        } else {
            1
        }
    }

    pub fn quality_checks_enabled(&self) -> bool {
        self.enabled && self.capabilities.quality_checks
    }

    pub fn commit_gate_applies(&self, step_commits: bool) -> bool {
        self.enabled && self.capabilities.commit && step_commits
    }

    /// Files among `files` matching a configured sensitive pattern.
    pub fn sensitive_matches(&self, files: &[String]) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        files
            .iter()
            .filter(|file| {
                let lowered = file.to_ascii_lowercase();
                self.sensitive_files
                    .patterns
                    .iter()
                    .any(|pattern| {
                        !pattern.is_empty() && lowered.contains(&pattern.to_ascii_lowercase())
                    })
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_stay_disabled_without_rollout_flag() {
        let configured = ExecutionControls {
            enabled: true,
            capabilities: ExecutionCapabilities {
                quality_checks: true,
                commit: true,
            },
            retry: RetryPolicy { max_attempts: 3 },
            sensitive_files: SensitiveFileControls::default(),
        };
        let resolved = ExecutionControls::resolve(&configured, false);
        assert!(!resolved.enabled);
        assert_eq!(resolved.max_attempts(), 1);
        assert!(!resolved.quality_checks_enabled());
        assert!(!resolved.commit_gate_applies(true));
        assert!(resolved
            .sensitive_matches(&["config/.env".to_string()])
            .is_empty());

        let rolled_out = ExecutionControls::resolve(&configured, true);
        assert_eq!(rolled_out.max_attempts(), 3);
        assert!(rolled_out.commit_gate_applies(true));
        assert!(!rolled_out.commit_gate_applies(false));
        assert_eq!(
            rolled_out.sensitive_matches(&[
                "src/lib.rs".to_string(),
                "deploy/Prod.PEM".to_string()
            ]),
            vec!["deploy/Prod.PEM".to_string()]
        );
    }
}
