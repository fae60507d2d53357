use crate::provider::AccessLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<WorkflowPhase>,
    #[serde(default)]
    pub default_access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub prompt: String,
    /// Step ends in a commit; gated by pre-commit approval when enabled.
    #[serde(default)]
    pub commit: bool,
}

impl WorkflowTemplate {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("template id must be non-empty".to_string());
        }
        if self.phases.is_empty() {
            return Err(format!("template `{}` must declare at least one phase", self.id));
        }
        let mut step_ids = BTreeSet::new();
        for phase in &self.phases {
            if phase.steps.is_empty() {
                return Err(format!(
                    "template `{}` phase `{}` must declare at least one step",
                    self.id, phase.id
                ));
            }
            for step in &phase.steps {
                if step.id.trim().is_empty() {
                    return Err(format!(
                        "template `{}` phase `{}` has a step with an empty id",
                        self.id, phase.id
                    ));
                }
                if !step_ids.insert(step.id.as_str()) {
                    return Err(format!(
                        "template `{}` declares duplicate step id `{}`",
                        self.id, step.id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.steps.len()).sum()
    }
}
