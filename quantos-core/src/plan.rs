use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quantos_tools::{Tool, ToolResult, ToolSpec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CREATE_PLAN_TOOL: &str = "create_plan";
pub const TASK_COMPLETE_TOOL: &str = "task_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    fn icon(self) -> &'static str {
        match self {
            Self::Pending => "⬜",
            Self::InProgress => "🔄",
            Self::Done => "✅",
            Self::Failed => "❌",
            Self::Skipped => "⏭",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One step as the model declared it in `create_plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepInput {
    pub description: String,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default, alias = "tools")]
    pub tools_needed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u32,
    pub description: String,
    pub expected_outcome: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl PlanStep {
    pub fn new(id: u32, input: PlanStepInput) -> Self {
        Self {
            id,
            description: input.description,
            expected_outcome: input
                .expected_outcome
                .unwrap_or_else(|| "complete the step".to_string()),
            tools_needed: input.tools_needed,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            files_changed: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// Step progress counters carried on step events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub done: u32,
    pub failed: u32,
    pub in_progress: u32,
    pub current_step_id: u32,
}

/// The model-authored execution plan. Steps are owned by value; ids are
/// dense 1..N and `current_step_id` always references an existing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub task: String,
    pub steps: Vec<PlanStep>,
    pub current_step_id: u32,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    pub replan_count: u32,
}

impl Plan {
    pub fn new(task: impl Into<String>, inputs: Vec<PlanStepInput>) -> crate::Result<Self> {
        if inputs.is_empty() {
            return Err(crate::AgentError::PlanValidation(
                "plan must contain at least one step".to_string(),
            ));
        }
        let steps = inputs
            .into_iter()
            .enumerate()
            .map(|(idx, input)| PlanStep::new(idx as u32 + 1, input))
            .collect();
        Ok(Self {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            task: task.into(),
            steps,
            current_step_id: 1,
            status: PlanStatus::Planning,
            created_at: Utc::now(),
            version: 1,
            replan_count: 0,
        })
    }

    /// Materialize a plan from `create_plan` tool-call arguments. Malformed
    /// payloads fail validation and the turn falls back to Direct mode.
    pub fn from_create_plan_args(task: &str, args: &serde_json::Value) -> crate::Result<Self> {
        let steps = args
            .get("steps")
            .ok_or_else(|| {
                crate::AgentError::PlanValidation("create_plan is missing steps".to_string())
            })?
            .clone();
        let inputs: Vec<PlanStepInput> = serde_json::from_value(steps).map_err(|e| {
            crate::AgentError::PlanValidation(format!("create_plan steps are malformed: {e}"))
        })?;
        if inputs.iter().any(|s| s.description.trim().is_empty()) {
            return Err(crate::AgentError::PlanValidation(
                "every step needs a non-empty description".to_string(),
            ));
        }
        let task = args
            .get("task")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(task);
        Self::new(task, inputs)
    }

    /// Replace the steps after a replan: same plan identity, bumped version
    /// and replan count, everything downstream reset to pending.
    pub fn replace_steps(&mut self, inputs: Vec<PlanStepInput>) -> crate::Result<()> {
        self.install_steps(inputs)?;
        self.replan_count += 1;
        Ok(())
    }

    /// Replace the steps from an approval-gate modification. Bumps the
    /// version only; this is not a replan.
    pub fn modify_steps(&mut self, inputs: Vec<PlanStepInput>) -> crate::Result<()> {
        self.install_steps(inputs)
    }

    fn install_steps(&mut self, inputs: Vec<PlanStepInput>) -> crate::Result<()> {
        if inputs.is_empty() {
            return Err(crate::AgentError::PlanValidation(
                "replacement plan must contain at least one step".to_string(),
            ));
        }
        self.steps = inputs
            .into_iter()
            .enumerate()
            .map(|(idx, input)| PlanStep::new(idx as u32 + 1, input))
            .collect();
        self.current_step_id = 1;
        self.version += 1;
        Ok(())
    }

    pub fn step(&self, id: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: u32) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.step(self.current_step_id)
    }

    pub fn next_pending_step_id(&self) -> Option<u32> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.id)
    }

    pub fn progress(&self) -> Progress {
        let mut done = 0;
        let mut failed = 0;
        let mut in_progress = 0;
        for step in &self.steps {
            match step.status {
                StepStatus::Done | StepStatus::Skipped => done += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::InProgress => in_progress += 1,
                StepStatus::Pending => {}
            }
        }
        Progress {
            total: self.steps.len() as u32,
            done,
            failed,
            in_progress,
            current_step_id: self.current_step_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Done | StepStatus::Skipped))
    }

    pub fn has_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Render the plan for a step prompt: status icons, current step marked.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Task: {}", self.task), String::new()];
        lines.push("Plan:".to_string());
        for step in &self.steps {
            let marker = if step.id == self.current_step_id {
                "  <- current"
            } else {
                ""
            };
            lines.push(format!(
                "  {} Step {}: {}{}",
                step.status.icon(),
                step.id,
                step.description,
                marker
            ));
        }
        lines.join("\n")
    }

    pub fn files_changed(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for step in &self.steps {
            for path in &step.files_changed {
                if !out.contains(path) {
                    out.push(path.clone());
                }
            }
        }
        out
    }
}

/// Marker tool: the orchestrator intercepts this call to enter Plan mode.
/// It is honored only in the first model reply of a turn.
pub struct CreatePlanTool;

#[async_trait]
impl Tool for CreatePlanTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: CREATE_PLAN_TOOL.to_string(),
            description: "Declare a multi-step execution plan for a non-trivial task. \
                          Use only as the first action of a turn."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "task": { "type": "string" },
                    "analysis": { "type": "string" },
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "string" },
                                "expected_outcome": { "type": "string" },
                                "tools_needed": { "type": "array" }
                            },
                            "required": ["description"]
                        }
                    }
                },
                "required": ["steps"]
            }),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value) -> ToolResult {
        ToolResult::ok("plan received")
    }
}

/// Marker tool: ends the current plan with a summary.
pub struct TaskCompleteTool;

#[async_trait]
impl Tool for TaskCompleteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TASK_COMPLETE_TOOL.to_string(),
            description: "Signal that the current task is finished, with a short summary."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "summary": { "type": "string" }
                }
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        let summary = arguments
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or("task complete");
        ToolResult::ok(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(description: &str) -> PlanStepInput {
        PlanStepInput {
            description: description.to_string(),
            expected_outcome: None,
            tools_needed: vec![],
        }
    }

    #[test]
    fn plan_assigns_dense_ids() {
        let plan = Plan::new("demo", vec![step("one"), step("two"), step("three")]).unwrap();
        let ids: Vec<u32> = plan.steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(plan.current_step_id, 1);
        assert_eq!(plan.status, PlanStatus::Planning);
    }

    #[test]
    fn empty_steps_fail_validation() {
        let err = Plan::from_create_plan_args("t", &serde_json::json!({ "steps": [] }))
            .unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn create_plan_args_accept_tools_alias() {
        let plan = Plan::from_create_plan_args(
            "t",
            &serde_json::json!({
                "steps": [
                    { "description": "write the script", "tools": ["write_file"] },
                    { "description": "run it", "tools_needed": ["shell_exec"] }
                ]
            }),
        )
        .unwrap();
        assert_eq!(plan.steps[0].tools_needed, vec!["write_file"]);
        assert_eq!(plan.steps[1].tools_needed, vec!["shell_exec"]);
    }

    #[test]
    fn replace_steps_bumps_version_and_resets() {
        let mut plan = Plan::new("demo", vec![step("a"), step("b")]).unwrap();
        plan.step_mut(1).unwrap().status = StepStatus::Done;
        plan.current_step_id = 2;

        plan.replace_steps(vec![step("c")]).unwrap();
        assert_eq!(plan.version, 2);
        assert_eq!(plan.replan_count, 1);
        assert_eq!(plan.current_step_id, 1);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn progress_counts_by_status() {
        let mut plan = Plan::new("demo", vec![step("a"), step("b"), step("c")]).unwrap();
        plan.step_mut(1).unwrap().status = StepStatus::Done;
        plan.step_mut(2).unwrap().status = StepStatus::InProgress;
        plan.current_step_id = 2;

        let progress = plan.progress();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.done, 1);
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.current_step_id, 2);
    }

    #[test]
    fn summary_marks_current_step() {
        let mut plan = Plan::new("demo", vec![step("first"), step("second")]).unwrap();
        plan.current_step_id = 2;
        let summary = plan.summary();
        assert!(summary.contains("Step 2: second  <- current"));
        assert!(!summary.contains("Step 1: first  <- current"));
    }
}
