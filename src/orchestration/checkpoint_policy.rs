use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStyle {
    Autonomous,
    #[default]
    Balanced,
    Strict,
}

impl CheckpointStyle {
    fn pause_threshold_factor(self) -> f64 {
        match self {
            Self::Autonomous => 0.75,
            Self::Balanced => 1.0,
            Self::Strict => 1.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointGate {
    AmbiguityBlocker,
    ConfidenceBelowThreshold,
    HighBlastRadius,
    SensitiveFiles,
    PreCommitApproval,
    FailingChecks,
}

impl CheckpointGate {
    pub const ALL: [CheckpointGate; 6] = [
        CheckpointGate::AmbiguityBlocker,
        CheckpointGate::ConfidenceBelowThreshold,
        CheckpointGate::HighBlastRadius,
        CheckpointGate::SensitiveFiles,
        CheckpointGate::PreCommitApproval,
        CheckpointGate::FailingChecks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AmbiguityBlocker => "ambiguity_blocker",
            Self::ConfidenceBelowThreshold => "confidence_below_threshold",
            Self::HighBlastRadius => "high_blast_radius",
            Self::SensitiveFiles => "sensitive_files",
            Self::PreCommitApproval => "pre_commit_approval",
            Self::FailingChecks => "failing_checks",
        }
    }

    /// Score deduction applied when the gate fires. Low confidence is already
    /// reflected in the base score.
    fn penalty(self) -> f64 {
        match self {
            Self::AmbiguityBlocker => 0.35,
            Self::ConfidenceBelowThreshold => 0.0,
            Self::HighBlastRadius => 0.2,
            Self::SensitiveFiles => 0.25,
            Self::PreCommitApproval => 0.1,
            Self::FailingChecks => 0.3,
        }
    }
}

impl std::fmt::Display for CheckpointGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointGates {
    #[serde(default)]
    pub ambiguity_blocker: bool,
    #[serde(default)]
    pub confidence_below_threshold: bool,
    #[serde(default)]
    pub high_blast_radius: bool,
    #[serde(default)]
    pub sensitive_files: bool,
    #[serde(default)]
    pub pre_commit_approval: bool,
    #[serde(default)]
    pub failing_checks: bool,
}

impl CheckpointGates {
    pub fn is_enabled(&self, gate: CheckpointGate) -> bool {
        match gate {
            CheckpointGate::AmbiguityBlocker => self.ambiguity_blocker,
            CheckpointGate::ConfidenceBelowThreshold => self.confidence_below_threshold,
            CheckpointGate::HighBlastRadius => self.high_blast_radius,
            CheckpointGate::SensitiveFiles => self.sensitive_files,
            CheckpointGate::PreCommitApproval => self.pre_commit_approval,
            CheckpointGate::FailingChecks => self.failing_checks,
        }
    }

    fn apply(&mut self, overrides: &CheckpointGateOverrides) {
        if let Some(value) = overrides.ambiguity_blocker {
            self.ambiguity_blocker = value;
        }
        if let Some(value) = overrides.confidence_below_threshold {
            self.confidence_below_threshold = value;
        }
        if let Some(value) = overrides.high_blast_radius {
            self.high_blast_radius = value;
        }
        if let Some(value) = overrides.sensitive_files {
            self.sensitive_files = value;
        }
        if let Some(value) = overrides.pre_commit_approval {
            self.pre_commit_approval = value;
        }
        if let Some(value) = overrides.failing_checks {
            self.failing_checks = value;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    #[serde(default)]
    pub style: CheckpointStyle,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: f64,
    #[serde(default = "default_high_blast_radius_file_count")]
    pub high_blast_radius_file_count: usize,
    #[serde(default = "default_hard_gates")]
    pub hard_gates: CheckpointGates,
    #[serde(default = "default_conditional_gates")]
    pub conditional_gates: CheckpointGates,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            style: CheckpointStyle::default(),
            confidence_threshold: default_confidence_threshold(),
            pause_threshold: default_pause_threshold(),
            high_blast_radius_file_count: default_high_blast_radius_file_count(),
            hard_gates: default_hard_gates(),
            conditional_gates: default_conditional_gates(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_pause_threshold() -> f64 {
    0.6
}

fn default_high_blast_radius_file_count() -> usize {
    20
}

fn default_hard_gates() -> CheckpointGates {
    CheckpointGates {
        ambiguity_blocker: true,
        pre_commit_approval: true,
        ..CheckpointGates::default()
    }
}

fn default_conditional_gates() -> CheckpointGates {
    CheckpointGates {
        confidence_below_threshold: true,
        high_blast_radius: true,
        sensitive_files: true,
        failing_checks: true,
        ..CheckpointGates::default()
    }
}

impl CheckpointPolicy {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("pause_threshold", self.pause_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("`{name}` must be between 0 and 1, got {value}"));
            }
        }
        if self.high_blast_radius_file_count == 0 {
            return Err("`high_blast_radius_file_count` must be at least 1".to_string());
        }
        Ok(())
    }

    /// Pause threshold after applying the style's weighting.
    pub fn effective_pause_threshold(&self) -> f64 {
        round_score((self.pause_threshold * self.style.pause_threshold_factor()).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointGateOverrides {
    #[serde(default)]
    pub ambiguity_blocker: Option<bool>,
    #[serde(default)]
    pub confidence_below_threshold: Option<bool>,
    #[serde(default)]
    pub high_blast_radius: Option<bool>,
    #[serde(default)]
    pub sensitive_files: Option<bool>,
    #[serde(default)]
    pub pre_commit_approval: Option<bool>,
    #[serde(default)]
    pub failing_checks: Option<bool>,
}

/// Per-run adjustments supplied at creation. Every field that is set wins
/// over the configured defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPolicyOverride {
    #[serde(default)]
    pub style: Option<CheckpointStyle>,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub pause_threshold: Option<f64>,
    #[serde(default)]
    pub high_blast_radius_file_count: Option<usize>,
    #[serde(default)]
    pub hard_gates: CheckpointGateOverrides,
    #[serde(default)]
    pub conditional_gates: CheckpointGateOverrides,
}

pub fn resolve_checkpoint_policy(
    defaults: &CheckpointPolicy,
    overrides: Option<&CheckpointPolicyOverride>,
) -> CheckpointPolicy {
    let mut policy = defaults.clone();
    let Some(overrides) = overrides else {
        return policy;
    };
    if let Some(style) = overrides.style {
        policy.style = style;
    }
    if let Some(value) = overrides.confidence_threshold {
        policy.confidence_threshold = value.clamp(0.0, 1.0);
    }
    if let Some(value) = overrides.pause_threshold {
        policy.pause_threshold = value.clamp(0.0, 1.0);
    }
    if let Some(value) = overrides.high_blast_radius_file_count {
        policy.high_blast_radius_file_count = value.max(1);
    }
    policy.hard_gates.apply(&overrides.hard_gates);
    policy.conditional_gates.apply(&overrides.conditional_gates);
    policy
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    #[default]
    Completed,
    Failed,
    Interrupted,
}

impl TurnOutcome {
    /// Unknown or absent labels count as completed.
    pub fn from_label(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("failed") | Some("failure") | Some("error") | Some("errored") => Self::Failed,
            Some("interrupted") | Some("canceled") | Some("cancelled") | Some("aborted") => {
                Self::Interrupted
            }
            _ => Self::Completed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Everything known about a finished turn when its checkpoint is evaluated.
/// File and sensitivity facts are supplied by the caller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnEvidence {
    pub status: TurnOutcome,
    pub error: Option<String>,
    pub output: String,
    pub confidence: Option<f64>,
    pub ambiguity: bool,
    pub files_touched: Vec<String>,
    pub sensitive_files: Vec<String>,
    pub checks_failed: bool,
    pub pre_commit: bool,
}

impl TurnEvidence {
    pub fn is_failure(&self) -> bool {
        self.status != TurnOutcome::Completed || self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    ApproveContinue,
    RequestRevision,
    PauseRun,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApproveContinue => "approve_continue",
            Self::RequestRevision => "request_revision",
            Self::PauseRun => "pause_run",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve_continue" | "approve" => Ok(Self::ApproveContinue),
            "request_revision" | "revise" => Ok(Self::RequestRevision),
            "pause_run" | "pause" => Ok(Self::PauseRun),
            other => Err(format!(
                "decision action must be one of: approve_continue, request_revision, pause_run; got `{other}`"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointDecisionMetadata {
    pub severity: Severity,
    pub tier: u8,
    pub score: f64,
    pub pause_threshold: f64,
    pub hard_gate_triggered: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub triggered_gates: Vec<CheckpointGate>,
    pub recommended_action: DecisionAction,
    pub should_pause: bool,
}

/// Deterministic checkpoint evaluation for one finished turn.
pub fn evaluate_checkpoint(
    policy: &CheckpointPolicy,
    evidence: &TurnEvidence,
) -> CheckpointDecisionMetadata {
    let pause_threshold = policy.effective_pause_threshold();
    let base = evidence.confidence.unwrap_or(1.0).clamp(0.0, 1.0);

    let mut penalty = 0.0;
    let mut hard_gate_triggered = false;
    let mut conditional_triggered = false;
    let mut reasons = Vec::new();
    let mut triggered_gates = Vec::new();

    for gate in CheckpointGate::ALL {
        let hard = policy.hard_gates.is_enabled(gate);
        let conditional = policy.conditional_gates.is_enabled(gate);
        if !hard && !conditional {
            continue;
        }
        let Some(reason) = gate_trigger_reason(gate, policy, evidence) else {
            continue;
        };
        penalty += gate.penalty();
        if hard {
            hard_gate_triggered = true;
        } else {
            conditional_triggered = true;
        }
        triggered_gates.push(gate);
        reasons.push(reason);
    }

    let score = round_score((base - penalty).clamp(0.0, 1.0));
    let severity = if triggered_gates.is_empty() {
        Severity::Low
    } else if hard_gate_triggered && score < 0.3 {
        Severity::Critical
    } else if hard_gate_triggered || score < pause_threshold {
        Severity::High
    } else {
        Severity::Medium
    };
    let should_pause = hard_gate_triggered || (conditional_triggered && score < pause_threshold);
    let recommended_action = if hard_gate_triggered || severity >= Severity::High {
        DecisionAction::RequestRevision
    } else {
        DecisionAction::ApproveContinue
    };

    CheckpointDecisionMetadata {
        severity,
        tier: triggered_gates.len().min(3) as u8,
        score,
        pause_threshold,
        hard_gate_triggered,
        reasons,
        triggered_gates,
        recommended_action,
        should_pause,
    }
}

fn gate_trigger_reason(
    gate: CheckpointGate,
    policy: &CheckpointPolicy,
    evidence: &TurnEvidence,
) -> Option<String> {
    match gate {
        CheckpointGate::AmbiguityBlocker => evidence
            .ambiguity
            .then(|| "agent reported an ambiguity blocker".to_string()),
        CheckpointGate::ConfidenceBelowThreshold => evidence
            .confidence
            .filter(|confidence| *confidence < policy.confidence_threshold)
            .map(|confidence| {
                format!(
                    "confidence {confidence:.2} below threshold {:.2}",
                    policy.confidence_threshold
                )
            }),
        CheckpointGate::HighBlastRadius => {
            let touched = evidence.files_touched.len();
            (touched >= policy.high_blast_radius_file_count).then(|| {
                format!(
                    "{touched} files touched (threshold {})",
                    policy.high_blast_radius_file_count
                )
            })
        }
        CheckpointGate::SensitiveFiles => (!evidence.sensitive_files.is_empty())
            .then(|| format!("sensitive files touched: {}", evidence.sensitive_files.join(", "))),
        CheckpointGate::PreCommitApproval => evidence
            .pre_commit
            .then(|| "step commits changes and requires approval".to_string()),
        CheckpointGate::FailingChecks => evidence
            .checks_failed
            .then(|| "quality checks are failing".to_string()),
    }
}

fn round_score(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_turn_scores_full_and_continues() {
        let decision = evaluate_checkpoint(&CheckpointPolicy::default(), &TurnEvidence::default());
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.severity, Severity::Low);
        assert_eq!(decision.tier, 0);
        assert!(!decision.should_pause);
        assert_eq!(decision.recommended_action, DecisionAction::ApproveContinue);
    }

    #[test]
    fn style_scales_pause_threshold() {
        let mut policy = CheckpointPolicy::default();
        policy.style = CheckpointStyle::Strict;
        policy.pause_threshold = 0.9;
        assert_eq!(policy.effective_pause_threshold(), 1.0);
        policy.style = CheckpointStyle::Autonomous;
        policy.pause_threshold = 0.6;
        assert_eq!(policy.effective_pause_threshold(), 0.45);
    }

    #[test]
    fn turn_outcome_labels_default_to_completed() {
        assert_eq!(TurnOutcome::from_label(None), TurnOutcome::Completed);
        assert_eq!(TurnOutcome::from_label(Some("weird")), TurnOutcome::Completed);
        assert_eq!(TurnOutcome::from_label(Some("ERROR")), TurnOutcome::Failed);
        assert_eq!(
            TurnOutcome::from_label(Some("cancelled")),
            TurnOutcome::Interrupted
        );
    }
}
