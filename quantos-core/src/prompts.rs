//! Prompt templates as plain data, injected at agent construction.
//!
//! Placeholders use `{name}` and are filled with simple substitution; the
//! agent only supplies data, never template text.

#[derive(Debug, Clone)]
pub struct PromptTemplates {
    /// Role framing for the first call of a turn.
    pub system_prompt: String,
    /// How to choose between answering directly and declaring a plan.
    pub mode_guidance: String,
    /// Role framing for one plan step.
    pub step_system: String,
    /// The per-step user brief.
    pub step_user: String,
    /// Injected after an anomaly to pull the model back on track.
    pub correction: String,
    /// Request for a fresh plan after repeated trouble.
    pub replan_request: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_prompt: "You are a careful coding agent working inside the project \
{project_name} at {project_path}. All file changes go through tools; never describe an \
edit without performing it. Paths are relative to the project root."
                .to_string(),
            mode_guidance: "For multi-step work (several files, or write-then-run), call \
create_plan first with concrete steps. For small, single-shot requests, use the tools \
directly and reply when done."
                .to_string(),
            step_system: "You are executing one step of an approved plan for project \
{project_name} at {project_path}. Work only on the current step; do not start later \
steps. Use tools for every change."
                .to_string(),
            step_user: "Task: {task}\n\n{plan_summary}\n\nCurrent step {step_id} of \
{total_steps}: {step_description}\nExpected outcome: {expected_outcome}\n\nComplete \
this step now, then stop."
                .to_string(),
            correction: "Your last action drifted from the current step: {anomaly}. Return \
to step {step_id}: {step_description} (expected outcome: {expected_outcome})."
                .to_string(),
            replan_request: "Execution ran into trouble: {error}\n\nPlan so far:\n\
{plan_summary}\n\nCall create_plan with a revised set of steps that finishes the task \
from the current state."
                .to_string(),
        }
    }
}

/// Fill `{name}` placeholders. Unknown placeholders are left intact.
pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
