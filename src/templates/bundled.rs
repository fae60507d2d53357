use crate::provider::AccessLevel;
use crate::templates::model::{WorkflowPhase, WorkflowStep, WorkflowTemplate};

fn step(id: &str, name: &str, prompt: &str) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: name.to_string(),
        prompt: prompt.to_string(),
        commit: false,
    }
}

fn commit_step(id: &str, name: &str, prompt: &str) -> WorkflowStep {
    WorkflowStep {
        commit: true,
        ..step(id, name, prompt)
    }
}

fn phase(id: &str, name: &str, steps: Vec<WorkflowStep>) -> WorkflowPhase {
    WorkflowPhase {
        id: id.to_string(),
        name: name.to_string(),
        steps,
    }
}

pub fn bundled_workflow_templates() -> Vec<WorkflowTemplate> {
    vec![feature_delivery_template(), bug_fix_template()]
}

fn feature_delivery_template() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "feature-delivery".to_string(),
        name: "Feature delivery".to_string(),
        description: "Plan, implement, verify and commit a feature in phases.".to_string(),
        phases: vec![
            phase(
                "plan",
                "Plan",
                vec![
                    step(
                        "overall-plan",
                        "Overall plan",
                        "Read the request above and the relevant code. Write an overall plan split into phases, with risks and open questions listed explicitly. Do not change files yet.",
                    ),
                    step(
                        "phase-plan",
                        "Phase plan",
                        "Expand the first phase of your plan into concrete file-level tasks. State which files you expect to touch and how you will verify the change.",
                    ),
                ],
            ),
            phase(
                "implement",
                "Implement",
                vec![
                    step(
                        "implement",
                        "Implement",
                        "Implement the tasks from the phase plan. Keep the change focused and report every file you touched.",
                    ),
                    step(
                        "verify",
                        "Verify",
                        "Run the project's checks and tests. Fix failures caused by your change and report the final status of each check.",
                    ),
                ],
            ),
            phase(
                "ship",
                "Ship",
                vec![commit_step(
                    "commit",
                    "Commit",
                    "Summarize the change and create a commit with a descriptive message. Do not push.",
                )],
            ),
        ],
        default_access_level: AccessLevel::WorkspaceWrite,
    }
}

fn bug_fix_template() -> WorkflowTemplate {
    WorkflowTemplate {
        id: "bug-fix".to_string(),
        name: "Bug fix".to_string(),
        description: "Reproduce, fix and verify a defect.".to_string(),
        phases: vec![
            phase(
                "diagnose",
                "Diagnose",
                vec![step(
                    "reproduce",
                    "Reproduce",
                    "Reproduce the defect described above. Identify the root cause and the smallest change that fixes it. Do not change files yet.",
                )],
            ),
            phase(
                "fix",
                "Fix",
                vec![
                    step(
                        "fix",
                        "Fix",
                        "Apply the fix and add a regression test that fails without it.",
                    ),
                    commit_step(
                        "commit",
                        "Commit",
                        "Run the checks, then commit the fix with a message describing the root cause.",
                    ),
                ],
            ),
        ],
        default_access_level: AccessLevel::WorkspaceWrite,
    }
}
