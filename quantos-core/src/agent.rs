//! The Plan-and-Execute orchestrator.
//!
//! One user turn is one call to [`PlanExecuteAgent::chat`]. The first model
//! reply decides the mode: a `create_plan` tool call enters Plan mode,
//! anything else runs as a Direct tool-call loop. Every path emits
//! `response_start` first and `response_end` last, exactly once.

use crate::context::{AgentContext, Message, OutputRecord};
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventSink, RunMode, ToolCallSummary};
use crate::plan::{
    Plan, PlanStatus, PlanStepInput, StepStatus, ToolCallRecord, CREATE_PLAN_TOOL,
    TASK_COMPLETE_TOOL,
};
use crate::prompts::{render, PromptTemplates};
use crate::tracker::{AnomalyKind, PlanTracker};
use chrono::Utc;
use quantos_llm::{ChatClient, ChatMessage, ChatResponse, ToolCall, ToolDefinition};
use quantos_tools::{
    RunRequest, RunTimeout, SandboxEvent, SandboxRunner, ToolError, ToolErrorKind, ToolRegistry,
    ToolResult,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Read-only tools a step may always use regardless of its declared
/// tool list.
const UNIVERSAL_TOOLS: &[&str] = &[
    "read_file",
    "list_directory",
    "grep",
    "get_file_outline",
    "find_references",
    "get_definition",
];

const OUTPUT_SUMMARY_MAX_CHARS: usize = 500;
const HISTORY_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub step_max_iterations: usize,
    pub approval_gate: bool,
    pub llm_retry_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            step_max_iterations: 10,
            approval_gate: false,
            llm_retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Sent to the approval channel when the gate is enabled; the edge answers
/// on `response_tx`.
pub struct ApprovalRequest {
    pub plan: Plan,
    pub response_tx: oneshot::Sender<PlanReview>,
}

#[derive(Debug, Clone)]
pub enum PlanReview {
    Approve,
    Reject { reason: String },
    Modify { steps: Vec<PlanStepInput> },
}

enum StepOutcome {
    Done,
    Failed(String),
    NeedsReplan(String),
    Cancelled,
}

pub struct PlanExecuteAgent {
    ctx: AgentContext,
    llm: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    templates: PromptTemplates,
    config: AgentConfig,
    sink: EventSink,
    cancel: CancellationToken,
    approval_tx: Option<mpsc::Sender<ApprovalRequest>>,
    sandbox: Option<Arc<SandboxRunner>>,
    sandbox_user_id: u64,
    project_name: String,
    tracker: PlanTracker,
    turn: u64,
}

impl PlanExecuteAgent {
    pub fn new(
        ctx: AgentContext,
        llm: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        templates: PromptTemplates,
        config: AgentConfig,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let project_name = ctx.project_id.clone();
        Self {
            ctx,
            llm,
            registry,
            templates,
            config,
            sink,
            cancel,
            approval_tx: None,
            sandbox: None,
            sandbox_user_id: 0,
            project_name,
            tracker: PlanTracker::new(),
            turn: 0,
        }
    }

    pub fn with_approval_channel(mut self, tx: mpsc::Sender<ApprovalRequest>) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    pub fn with_sandbox(mut self, runner: Arc<SandboxRunner>, user_id: u64) -> Self {
        self.sandbox = Some(runner);
        self.sandbox_user_id = user_id;
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut AgentContext {
        &mut self.ctx
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// One user turn. Always terminates the event stream with
    /// `response_end`, whatever happened in between.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %self.ctx.session_id))]
    pub async fn chat(&mut self, user_input: &str) -> Result<()> {
        self.turn += 1;
        let turn = self.turn;
        self.ctx.task = Some(user_input.to_string());
        self.ctx.conversation.push(Message::user(user_input, turn));

        tracing::info!(
            turn,
            history_messages = self.ctx.conversation.len(),
            tools = self.registry.names().len(),
            "turn started"
        );

        let messages = self.direct_messages();
        let tools = self.registry.definitions();
        let first = match self.call_llm(&messages, &tools).await {
            Ok(response) => response,
            Err(AgentError::Cancelled) => {
                self.sink.emit(AgentEvent::ResponseStart { mode: RunMode::Direct });
                return self.finish_direct_cancelled();
            }
            Err(e) => {
                self.sink.emit(AgentEvent::ResponseStart { mode: RunMode::Direct });
                self.emit_turn_error("llm_transport", &e.to_string());
                return Ok(());
            }
        };

        let create_plan_call = first
            .message
            .tool_calls
            .iter()
            .find(|tc| tc.name == CREATE_PLAN_TOOL)
            .cloned();

        match create_plan_call {
            Some(call) => self.run_plan_mode(user_input, first, call).await,
            None => {
                self.sink.emit(AgentEvent::ResponseStart { mode: RunMode::Direct });
                self.run_direct(first).await
            }
        }
    }

    // ---------------------------------------------------------------- direct

    async fn run_direct(&mut self, first: ChatResponse) -> Result<()> {
        let tools = self.registry.definitions();
        let mut response = first;

        for _iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return self.finish_direct_cancelled();
            }

            let text = response.message.content.clone();
            let calls = response.message.tool_calls.clone();

            if calls.is_empty() {
                self.ctx
                    .conversation
                    .push(Message::assistant(text.clone(), vec![], self.turn));
                if !text.is_empty() {
                    self.sink.emit(AgentEvent::Token { content: text });
                }
                self.sink.emit(AgentEvent::ResponseEnd);
                return Ok(());
            }

            self.ctx
                .conversation
                .push(Message::assistant(text.clone(), calls.clone(), self.turn));
            if !text.is_empty() {
                self.sink.emit(AgentEvent::Token { content: text });
            }
            self.sink.emit(AgentEvent::ToolCalls {
                step_id: None,
                calls: summarize_calls(&calls),
            });
            for call in &calls {
                self.execute_call(None, call, None).await;
            }

            let messages = self.direct_messages();
            response = match self.call_llm(&messages, &tools).await {
                Ok(r) => r,
                Err(AgentError::Cancelled) => return self.finish_direct_cancelled(),
                Err(e) => {
                    self.emit_turn_error("llm_transport", &e.to_string());
                    return Ok(());
                }
            };
        }

        self.emit_turn_error(
            "tool_loop_exhausted",
            &format!("no terminal reply after {} iterations", self.config.max_iterations),
        );
        Ok(())
    }

    /// Re-enter the direct loop after a rejected `create_plan`.
    async fn continue_direct(&mut self) -> Result<()> {
        let messages = self.direct_messages();
        let tools = self.registry.definitions();
        let response = match self.call_llm(&messages, &tools).await {
            Ok(r) => r,
            Err(AgentError::Cancelled) => return self.finish_direct_cancelled(),
            Err(e) => {
                self.emit_turn_error("llm_transport", &e.to_string());
                return Ok(());
            }
        };
        self.run_direct(response).await
    }

    // ------------------------------------------------------------------ plan

    async fn run_plan_mode(
        &mut self,
        task: &str,
        first: ChatResponse,
        plan_call: ToolCall,
    ) -> Result<()> {
        let turn = self.turn;
        let args = plan_call
            .parsed_arguments()
            .unwrap_or_else(|_| serde_json::json!({}));

        let plan = match Plan::from_create_plan_args(task, &args) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "create_plan rejected, falling back to direct mode");
                self.sink.emit(AgentEvent::ResponseStart { mode: RunMode::Direct });
                self.ctx.conversation.push(Message::assistant(
                    first.message.content.clone(),
                    first.message.tool_calls.clone(),
                    turn,
                ));
                self.sink.emit(AgentEvent::ToolCalls {
                    step_id: None,
                    calls: summarize_calls(&first.message.tool_calls),
                });
                for call in &first.message.tool_calls {
                    if call.name == CREATE_PLAN_TOOL {
                        let result = ToolResult::fail(
                            ToolErrorKind::InvalidArguments,
                            format!("plan rejected: {e}"),
                        );
                        self.record_result(None, call, result);
                    } else {
                        self.execute_call(None, call, None).await;
                    }
                }
                return self.continue_direct().await;
            }
        };

        self.sink.emit(AgentEvent::ResponseStart { mode: RunMode::Plan });
        self.ctx.conversation.push(Message::assistant(
            first.message.content.clone(),
            first.message.tool_calls.clone(),
            turn,
        ));
        for call in &first.message.tool_calls {
            let result = if call.name == CREATE_PLAN_TOOL {
                ToolResult::ok(format!("plan created with {} steps", plan.steps.len()))
            } else {
                ToolResult::fail(
                    ToolErrorKind::InvalidArguments,
                    "not executed: create_plan starts plan execution",
                )
            };
            self.push_tool_message(call, &result);
        }

        self.ctx.plan = Some(plan.clone());
        self.tracker.reset_for_plan();
        self.sink.emit(AgentEvent::PlanCreated { plan: plan.clone() });
        tracing::info!(plan_id = %plan.id, steps = plan.steps.len(), "plan created");

        if self.config.approval_gate {
            if !self.await_approval(plan).await? {
                return Ok(());
            }
        }

        self.execute_plan().await
    }

    /// Returns false when the turn already ended (rejection / cancellation).
    async fn await_approval(&mut self, plan: Plan) -> Result<bool> {
        let Some(tx) = self.approval_tx.clone() else {
            return Ok(true);
        };
        self.sink.emit(AgentEvent::PlanAwaitingApproval { plan: plan.clone() });

        let (response_tx, response_rx) = oneshot::channel();
        if tx
            .send(ApprovalRequest {
                plan,
                response_tx,
            })
            .await
            .is_err()
        {
            tracing::warn!("approval channel closed; proceeding without review");
            return Ok(true);
        }

        let review = tokio::select! {
            _ = self.cancel.cancelled() => None,
            review = response_rx => review.ok(),
        };

        match review {
            Some(PlanReview::Approve) => {
                self.sink.emit(AgentEvent::PlanApproved);
                Ok(true)
            }
            Some(PlanReview::Reject { reason }) => {
                if let Some(plan) = self.ctx.plan.as_mut() {
                    plan.status = PlanStatus::Cancelled;
                }
                self.sink.emit(AgentEvent::PlanRejected { reason });
                self.sink.emit(AgentEvent::ResponseEnd);
                Ok(false)
            }
            Some(PlanReview::Modify { steps }) => {
                let modified = {
                    let plan = self.ctx.plan.as_mut().ok_or_else(|| {
                        AgentError::PlanValidation("no plan to modify".to_string())
                    })?;
                    plan.modify_steps(steps)?;
                    plan.clone()
                };
                self.sink.emit(AgentEvent::PlanModified { plan: modified });
                Ok(true)
            }
            None => {
                self.finish_plan_cancelled()?;
                Ok(false)
            }
        }
    }

    async fn execute_plan(&mut self) -> Result<()> {
        let started = {
            let Some(plan) = self.ctx.plan.as_mut() else {
                return Err(AgentError::PlanValidation("no active plan".to_string()));
            };
            plan.status = PlanStatus::Executing;
            plan.clone()
        };
        self.sink.emit(AgentEvent::PlanExecutionStarted { plan: started });

        loop {
            if self.cancel.is_cancelled() {
                return self.finish_plan_cancelled();
            }
            let Some(step_id) = self
                .ctx
                .plan
                .as_ref()
                .and_then(|p| p.next_pending_step_id())
            else {
                break;
            };

            match self.execute_step(step_id).await {
                StepOutcome::Cancelled => return self.finish_plan_cancelled(),
                StepOutcome::Done => {}
                StepOutcome::NeedsReplan(reason) => {
                    if !self.attempt_replan(&reason).await {
                        return self.finish_plan_failed(Some(step_id), &reason);
                    }
                }
                StepOutcome::Failed(error) => {
                    if self.tracker.should_replan(true) && self.attempt_replan(&error).await {
                        continue;
                    }
                    return self.finish_plan_failed(Some(step_id), &error);
                }
            }
        }

        let (plan, summary) = {
            let Some(plan) = self.ctx.plan.as_mut() else {
                return Err(AgentError::PlanValidation("no active plan".to_string()));
            };
            plan.status = PlanStatus::Completed;
            let completed = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Done)
                .count();
            let files = plan.files_changed();
            let mut summary = format!(
                "Completed {completed}/{} steps for: {}",
                plan.steps.len(),
                plan.task
            );
            if !files.is_empty() {
                summary.push_str(&format!("\nFiles changed: {}", files.join(", ")));
            }
            (plan.clone(), summary)
        };
        self.ctx
            .memory
            .add_decision(format!("completed: {}", plan.task), summary.clone());

        tracing::info!(plan_id = %plan.id, "plan completed");
        self.sink.emit(AgentEvent::PlanExecutionCompleted { plan, summary });
        self.sink.emit(AgentEvent::ResponseEnd);
        Ok(())
    }

    async fn execute_step(&mut self, step_id: u32) -> StepOutcome {
        let turn = self.turn;
        let (description, expected_outcome, tools_needed, total_steps, task) = {
            let Some(plan) = self.ctx.plan.as_mut() else {
                return StepOutcome::Failed("no active plan".to_string());
            };
            plan.current_step_id = step_id;
            let total = plan.steps.len();
            let task = plan.task.clone();
            let Some(step) = plan.step_mut(step_id) else {
                return StepOutcome::Failed(format!("unknown step: {step_id}"));
            };
            step.status = StepStatus::InProgress;
            step.started_at = Some(Utc::now());
            (
                step.description.clone(),
                step.expected_outcome.clone(),
                step.tools_needed.clone(),
                total,
                task,
            )
        };
        // Summary rendered after the status flip so the icons match.
        let plan_summary = self
            .ctx
            .plan
            .as_ref()
            .map(Plan::summary)
            .unwrap_or_default();

        let progress = self.progress();
        self.sink.emit(AgentEvent::StepStarted {
            step_id,
            description: description.clone(),
            progress,
        });
        tracing::info!(step_id, description = %description, "step started");

        let allowed: Option<HashSet<String>> = if tools_needed.is_empty() {
            None
        } else {
            let mut set: HashSet<String> = tools_needed.iter().cloned().collect();
            set.extend(UNIVERSAL_TOOLS.iter().map(ToString::to_string));
            set.insert(TASK_COMPLETE_TOOL.to_string());
            Some(set)
        };

        let mut messages = self.step_messages(
            &task,
            &plan_summary,
            step_id,
            total_steps,
            &description,
            &expected_outcome,
        );
        let tools = self.registry.definitions();
        let mut files_changed: Vec<String> = Vec::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut step_response = String::new();

        for _iteration in 1..=self.config.step_max_iterations {
            if self.cancel.is_cancelled() {
                self.fail_step(step_id, "cancelled");
                return StepOutcome::Cancelled;
            }

            let response = match self.call_llm(&messages, &tools).await {
                Ok(r) => r,
                Err(AgentError::Cancelled) => {
                    self.fail_step(step_id, "cancelled");
                    return StepOutcome::Cancelled;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.sink.emit(AgentEvent::StepError {
                        step_id,
                        error: error.clone(),
                    });
                    self.fail_step(step_id, &error);
                    self.sink.emit(AgentEvent::StepFailed {
                        step_id,
                        error: error.clone(),
                    });
                    return StepOutcome::Failed(error);
                }
            };

            let text = response.message.content.clone();
            let calls = response.message.tool_calls.clone();
            if !text.is_empty() {
                step_response.push_str(&text);
                step_response.push('\n');
                self.sink.emit(AgentEvent::StepOutput {
                    step_id,
                    content: text.clone(),
                });
            }

            if calls.is_empty() {
                self.ctx
                    .conversation
                    .push(Message::assistant(text.clone(), vec![], turn));
                break;
            }

            // Anomaly pass before executing anything.
            let call_pairs: Vec<(String, String)> = calls
                .iter()
                .map(|c| (c.name.clone(), c.arguments.clone()))
                .collect();
            let focused: HashSet<String> =
                self.ctx.code_context.focused_paths().into_iter().collect();
            let findings = match self.ctx.plan.clone() {
                Some(plan_snapshot) => match plan_snapshot.step(step_id) {
                    Some(step) => self.tracker.observe_reply(
                        &plan_snapshot,
                        step,
                        &text,
                        &call_pairs,
                        &focused,
                    ),
                    None => Vec::new(),
                },
                None => Vec::new(),
            };
            let mut correction_needed = false;
            for finding in &findings {
                match finding.kind {
                    AnomalyKind::Loop => self.sink.emit(AgentEvent::ReplanWarning {
                        message: finding.message.clone(),
                    }),
                    _ => self.sink.emit(AgentEvent::AnomalyDetected {
                        step_id: Some(step_id),
                        message: finding.message.clone(),
                    }),
                }
                correction_needed = true;
            }

            self.ctx
                .conversation
                .push(Message::assistant(text.clone(), calls.clone(), turn));
            messages.push(ChatMessage::assistant(text.clone(), calls.clone()));
            self.sink.emit(AgentEvent::ToolCalls {
                step_id: Some(step_id),
                calls: summarize_calls(&calls),
            });

            let mut saw_task_complete = false;
            let mut aborted: Option<String> = None;
            for call in &calls {
                if let Some(reason) = &aborted {
                    // Preserve id pairing for calls after the abort point.
                    let result = ToolResult::fail(
                        ToolErrorKind::Cancelled,
                        format!("not executed: {reason}"),
                    );
                    self.record_result(Some(step_id), call, result.clone());
                    messages.push(ChatMessage::tool(result.to_message(), call.id.clone()));
                    continue;
                }

                let result = self
                    .execute_call(Some(step_id), call, allowed.as_ref())
                    .await;
                messages.push(ChatMessage::tool(result.to_message(), call.id.clone()));
                records.push(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: call
                        .parsed_arguments()
                        .unwrap_or_else(|_| serde_json::json!({})),
                });
                for path in result.files_changed() {
                    if !files_changed.contains(&path) {
                        files_changed.push(path);
                    }
                }

                if call.name == TASK_COMPLETE_TOOL && result.success {
                    saw_task_complete = true;
                }
                if let Some(kind) = result.error_kind {
                    if kind.is_fatal() {
                        aborted = Some(format!("step aborted after {} failure", kind.as_str()));
                    }
                }
            }

            if let Some(reason) = aborted {
                self.fail_step(step_id, &reason);
                self.sink.emit(AgentEvent::StepFailed {
                    step_id,
                    error: reason.clone(),
                });
                return StepOutcome::Failed(reason);
            }
            if saw_task_complete {
                break;
            }
            if self.tracker.should_replan(false) {
                return StepOutcome::NeedsReplan(
                    "repeated anomalies while executing the current step".to_string(),
                );
            }
            if correction_needed {
                if let Some(finding) = findings.first() {
                    let correction = render(
                        &self.templates.correction,
                        &[
                            ("anomaly", finding.message.as_str()),
                            ("step_id", &step_id.to_string()),
                            ("step_description", &description),
                            ("expected_outcome", &expected_outcome),
                        ],
                    );
                    messages.push(ChatMessage::user(correction));
                }
            }
        }

        // Natural termination: no tool calls, task_complete, or cap hit.
        files_changed.sort();
        files_changed.dedup();
        {
            let Some(plan) = self.ctx.plan.as_mut() else {
                return StepOutcome::Failed("plan vanished mid-step".to_string());
            };
            let Some(step) = plan.step_mut(step_id) else {
                return StepOutcome::Failed(format!("unknown step: {step_id}"));
            };
            step.status = StepStatus::Done;
            step.completed_at = Some(Utc::now());
            step.result = Some(step_response.trim().to_string());
            step.files_changed = files_changed.clone();
            step.tool_calls = records;
        }
        self.tracker.note_step_completed();

        let progress = self.progress();
        self.sink.emit(AgentEvent::StepCompleted {
            step_id,
            files_changed,
            progress,
        });
        tracing::info!(step_id, "step completed");
        StepOutcome::Done
    }

    /// Ask the model for a fresh plan mid-turn. True when a valid
    /// `create_plan` came back and was installed.
    async fn attempt_replan(&mut self, last_error: &str) -> bool {
        let Some(plan_summary) = self.ctx.plan.as_ref().map(Plan::summary) else {
            return false;
        };
        tracing::warn!(error = %last_error, "requesting replan");

        let prompt = render(
            &self.templates.replan_request,
            &[("error", last_error), ("plan_summary", plan_summary.as_str())],
        );
        let messages = vec![
            ChatMessage::system(self.render_system(&self.templates.system_prompt)),
            ChatMessage::user(prompt),
        ];
        let tools = self.registry.definitions();

        let response = match self.call_llm(&messages, &tools).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "replan llm call failed");
                return false;
            }
        };
        let Some(call) = response
            .message
            .tool_calls
            .iter()
            .find(|tc| tc.name == CREATE_PLAN_TOOL)
        else {
            return false;
        };
        let Ok(args) = call.parsed_arguments() else {
            return false;
        };
        let Ok(inputs) = serde_json::from_value::<Vec<PlanStepInput>>(
            args.get("steps").cloned().unwrap_or(serde_json::json!([])),
        ) else {
            return false;
        };

        let installed = {
            let Some(plan) = self.ctx.plan.as_mut() else {
                return false;
            };
            if plan.replace_steps(inputs).is_err() {
                return false;
            }
            plan.clone()
        };
        self.tracker.note_replan();

        // Keep the id pairing coherent in history.
        let turn = self.turn;
        self.ctx.conversation.push(Message::assistant(
            response.message.content.clone(),
            response.message.tool_calls.clone(),
            turn,
        ));
        for tc in &response.message.tool_calls {
            let result = if tc.id == call.id {
                ToolResult::ok("revised plan accepted")
            } else {
                ToolResult::fail(ToolErrorKind::InvalidArguments, "not executed during replan")
            };
            self.push_tool_message(tc, &result);
        }

        tracing::info!(
            version = installed.version,
            replan_count = installed.replan_count,
            "plan replaced after replan"
        );
        self.sink.emit(AgentEvent::PlanCreated { plan: installed });
        true
    }

    // ----------------------------------------------------------- tool calls

    /// Execute one tool call: allow-list check, registry invocation, side
    /// effects, events and history bookkeeping.
    async fn execute_call(
        &mut self,
        step_id: Option<u32>,
        call: &ToolCall,
        allowed: Option<&HashSet<String>>,
    ) -> ToolResult {
        let result = 'run: {
            if call.name == CREATE_PLAN_TOOL {
                break 'run ToolResult::fail(
                    ToolErrorKind::InvalidArguments,
                    "create_plan is only honored as the first action of a turn",
                );
            }
            if let Some(allowed) = allowed {
                if !allowed.contains(&call.name) {
                    break 'run ToolResult::fail(
                        ToolErrorKind::ToolNotAllowed,
                        format!("{} is not in this step's tool list", call.name),
                    );
                }
            }
            let args = match call.parsed_arguments() {
                Ok(args) => args,
                Err(e) => {
                    break 'run ToolResult::fail(
                        ToolErrorKind::InvalidArguments,
                        format!("arguments are not valid JSON: {e}"),
                    );
                }
            };
            self.registry.invoke(&call.name, args).await
        };

        if result.success {
            self.apply_side_effects(&call.name, &result);
        }
        self.record_result(step_id, call, result.clone());
        result
    }

    /// Emit the `tool_result` event and append the paired tool message.
    fn record_result(&mut self, step_id: Option<u32>, call: &ToolCall, result: ToolResult) {
        self.sink.emit(AgentEvent::ToolResult {
            step_id,
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
            success: result.success,
            output_summary: truncate_chars(&result.to_message(), OUTPUT_SUMMARY_MAX_CHARS),
            error: result.error.clone(),
        });
        self.push_tool_message(call, &result);
    }

    fn push_tool_message(&mut self, call: &ToolCall, result: &ToolResult) {
        let mut message = Message::tool(result.to_message(), &call.id, &call.name, self.turn);
        if result.success && matches!(call.name.as_str(), "read_file" | "write_file") {
            if let Some(path) = result
                .data
                .as_ref()
                .and_then(|d| d.get("path"))
                .and_then(|p| p.as_str())
            {
                message = message.with_file_ref(path);
            }
        }
        self.ctx.conversation.push(message);
    }

    /// Keep the code context, symbol index and execution context in sync
    /// with what a successful tool call just did.
    fn apply_side_effects(&mut self, tool: &str, result: &ToolResult) {
        let data = result.data.as_ref();
        let field = |key: &str| {
            data.and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned)
        };

        match tool {
            "read_file" => {
                if let (Some(path), Some(content)) = (field("path"), field("content")) {
                    self.ctx.code_context.insert_file(&path, &content, false);
                    self.ctx.code_context.symbol_index.index_file(&path, &content);
                }
            }
            "write_file" => {
                if let (Some(path), Some(content)) = (field("path"), field("content")) {
                    self.ctx.code_context.insert_file(&path, &content, true);
                    self.ctx.code_context.symbol_index.index_file(&path, &content);
                    self.sink.emit(AgentEvent::FileChange { path });
                }
            }
            "patch_file" => {
                if let (Some(path), Some(content)) = (field("path"), field("new_content")) {
                    self.ctx.code_context.insert_file(&path, &content, true);
                    self.ctx.code_context.symbol_index.index_file(&path, &content);
                    self.sink.emit(AgentEvent::FileChange { path });
                }
            }
            "delete_file" => {
                if let Some(path) = field("path") {
                    self.ctx.code_context.remove_file(&path);
                    self.sink.emit(AgentEvent::FileChange { path });
                }
            }
            "move_file" => {
                if let (Some(from), Some(to)) = (field("from"), field("to")) {
                    self.ctx.code_context.remove_file(&from);
                    self.sink.emit(AgentEvent::FileChange { path: from });
                    self.sink.emit(AgentEvent::FileChange { path: to });
                }
            }
            "shell_exec" => {
                let exit_code = data
                    .and_then(|d| d.get("exit_code"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(-1);
                let duration_ms = data
                    .and_then(|d| d.get("duration_ms"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                self.ctx.execution.record(OutputRecord {
                    command: "shell_exec".to_string(),
                    exit_code,
                    output: truncate_chars(&result.output, OUTPUT_SUMMARY_MAX_CHARS),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------- file runs

    /// Run a workspace file in the sandbox, streaming its output as
    /// `file_run_*` events.
    pub async fn run_file(&mut self, path: &str, timeout: RunTimeout) -> Result<()> {
        let Some(runner) = self.sandbox.clone() else {
            return Err(AgentError::SandboxUnavailable);
        };
        let rel = quantos_tools::normalize_rel_path(path);
        self.sink.emit(AgentEvent::FileRunStarted { file: rel.clone() });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = self.sink.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SandboxEvent::Started { .. } => {}
                    SandboxEvent::Stdout { chunk } => {
                        sink.emit(AgentEvent::FileRunStdout { content: chunk });
                    }
                    SandboxEvent::Stderr { chunk } => {
                        sink.emit(AgentEvent::FileRunStderr { content: chunk });
                    }
                    SandboxEvent::Exit {
                        exit_code,
                        duration_ms,
                        ..
                    } => {
                        sink.emit(AgentEvent::FileRunExit {
                            exit_code,
                            duration_ms,
                        });
                    }
                }
            }
        });

        let command = format!("python3 {rel}");
        let outcome = runner
            .run(
                RunRequest {
                    user_id: self.sandbox_user_id,
                    command: command.clone(),
                    working_dir: PathBuf::from(&self.ctx.code_context.workspace_root),
                    timeout: timeout.as_duration(),
                },
                Some(tx),
                &self.cancel,
            )
            .await;
        let _ = forward.await;

        match outcome {
            Ok(summary) => {
                self.ctx.execution.record(OutputRecord {
                    command,
                    exit_code: summary.exit_code,
                    output: truncate_chars(&summary.stdout, OUTPUT_SUMMARY_MAX_CHARS),
                    duration_ms: summary.duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(ToolError::Busy(message)) => {
                self.sink.emit(AgentEvent::Error {
                    kind: "sandbox_busy".to_string(),
                    message,
                });
                Ok(())
            }
            Err(e) => {
                self.sink.emit(AgentEvent::Error {
                    kind: "sandbox".to_string(),
                    message: e.to_string(),
                });
                Ok(())
            }
        }
    }

    // --------------------------------------------------------------- prompts

    fn render_system(&self, template: &str) -> String {
        render(
            template,
            &[
                ("project_name", self.project_name.as_str()),
                ("project_path", self.ctx.code_context.workspace_root.as_str()),
            ],
        )
    }

    fn direct_messages(&self) -> Vec<ChatMessage> {
        let mut system = self.render_system(&self.templates.system_prompt);
        system.push_str("\n\n");
        system.push_str(&self.templates.mode_guidance);
        let summary = self.context_summary(false);
        if !summary.is_empty() {
            system.push_str("\n\n");
            system.push_str(&summary);
        }

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(self.ctx.conversation.to_llm(self.turn));
        messages
    }

    fn step_messages(
        &self,
        task: &str,
        plan_summary: &str,
        step_id: u32,
        total_steps: usize,
        description: &str,
        expected_outcome: &str,
    ) -> Vec<ChatMessage> {
        let mut system = self.render_system(&self.templates.step_system);
        let summary = self.context_summary(true);
        if !summary.is_empty() {
            system.push_str("\n\n");
            system.push_str(&summary);
        }

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(
            self.ctx
                .conversation
                .project_recent(HISTORY_WINDOW, self.turn),
        );
        messages.push(ChatMessage::user(render(
            &self.templates.step_user,
            &[
                ("task", task),
                ("plan_summary", plan_summary),
                ("step_id", &step_id.to_string()),
                ("total_steps", &total_steps.to_string()),
                ("step_description", description),
                ("expected_outcome", expected_outcome),
            ],
        )));
        messages
    }

    /// Memory, conventions, focused files and the repo map, in prompt order.
    fn context_summary(&self, include_content: bool) -> String {
        let mut parts: Vec<String> = Vec::new();

        let conventions = &self.ctx.memory.conventions;
        if !conventions.is_empty() {
            let listing: Vec<String> = conventions
                .iter()
                .rev()
                .take(5)
                .rev()
                .map(|c| format!("- {c}"))
                .collect();
            parts.push(format!("## Project conventions\n{}", listing.join("\n")));
        }

        let decisions = self.ctx.memory.recent_decisions(5);
        if !decisions.is_empty() {
            let listing: Vec<String> = decisions
                .iter()
                .map(|d| format!("- {}: {}", d.decision, d.reason))
                .collect();
            parts.push(format!("## Recent decisions\n{}", listing.join("\n")));
        }

        let focused = self.ctx.code_context.focused_paths();
        if !focused.is_empty() {
            let listing: Vec<String> =
                focused.iter().take(15).map(|p| format!("- {p}")).collect();
            let mut section = format!(
                "## Active files ({})\n{}",
                focused.len(),
                listing.join("\n")
            );
            if focused.len() > 15 {
                section.push_str(&format!("\n...and {} more", focused.len() - 15));
            }
            parts.push(section);
        }

        let repo_map = self
            .ctx
            .code_context
            .symbol_index
            .with(|index| index.to_repo_map_string(20));
        if !repo_map.is_empty() {
            parts.push(format!("## Repo map\n{repo_map}"));
        }

        if include_content {
            let content = self.ctx.code_context.to_context_string();
            if !content.is_empty() {
                parts.push(content);
            }
        }

        parts.join("\n\n")
    }

    // ----------------------------------------------------------------- misc

    async fn call_llm(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        match self.call_llm_once(messages, tools).await {
            Ok(response) => Ok(response),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(first_error) => {
                tracing::warn!(error = %first_error, "llm call failed, retrying once");
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(self.config.llm_retry_backoff) => {}
                }
                self.call_llm_once(messages, tools).await
            }
        }
    }

    async fn call_llm_once(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.llm.chat(messages, tools) => Ok(result?),
        }
    }

    fn progress(&self) -> crate::plan::Progress {
        self.ctx
            .plan
            .as_ref()
            .map(Plan::progress)
            .unwrap_or(crate::plan::Progress {
                total: 0,
                done: 0,
                failed: 0,
                in_progress: 0,
                current_step_id: 0,
            })
    }

    fn fail_step(&mut self, step_id: u32, error: &str) {
        if let Some(plan) = self.ctx.plan.as_mut() {
            if let Some(step) = plan.step_mut(step_id) {
                step.status = StepStatus::Failed;
                step.error = Some(error.to_string());
                step.completed_at = Some(Utc::now());
            }
        }
    }

    fn finish_plan_failed(&mut self, step_id: Option<u32>, error: &str) -> Result<()> {
        if let Some(plan) = self.ctx.plan.as_mut() {
            plan.status = PlanStatus::Failed;
            // A terminal plan keeps no live steps.
            for step in plan.steps.iter_mut() {
                if step.status == StepStatus::InProgress {
                    step.status = StepStatus::Failed;
                    step.error = Some(error.to_string());
                    step.completed_at = Some(Utc::now());
                }
            }
        }
        self.ctx
            .memory
            .add_decision("plan failed", error.to_string());
        self.sink.emit(AgentEvent::PlanExecutionFailed {
            step_id,
            error: error.to_string(),
        });
        self.sink.emit(AgentEvent::ResponseEnd);
        Ok(())
    }

    fn finish_plan_cancelled(&mut self) -> Result<()> {
        if let Some(plan) = self.ctx.plan.as_mut() {
            plan.status = PlanStatus::Cancelled;
            for step in plan.steps.iter_mut() {
                if step.status == StepStatus::InProgress {
                    step.status = StepStatus::Failed;
                    step.error = Some("cancelled".to_string());
                    step.completed_at = Some(Utc::now());
                }
            }
        }
        self.sink.emit(AgentEvent::PlanExecutionCancelled {
            message: "execution cancelled".to_string(),
        });
        self.sink.emit(AgentEvent::ResponseEnd);
        Ok(())
    }

    fn finish_direct_cancelled(&mut self) -> Result<()> {
        self.sink.emit(AgentEvent::Error {
            kind: "cancelled".to_string(),
            message: "turn cancelled".to_string(),
        });
        self.sink.emit(AgentEvent::ResponseEnd);
        Ok(())
    }

    fn emit_turn_error(&mut self, kind: &str, message: &str) {
        tracing::error!(kind, message, "turn ended with error");
        self.sink.emit(AgentEvent::Error {
            kind: kind.to_string(),
            message: message.to_string(),
        });
        self.sink.emit(AgentEvent::ResponseEnd);
    }
}

fn summarize_calls(calls: &[ToolCall]) -> Vec<ToolCallSummary> {
    calls
        .iter()
        .map(|c| ToolCallSummary {
            id: c.id.clone(),
            name: c.name.clone(),
            arguments: c
                .parsed_arguments()
                .unwrap_or_else(|_| serde_json::json!({})),
        })
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}
