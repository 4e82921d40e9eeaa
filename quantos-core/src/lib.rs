//! Agent orchestration core for QuantOS.
//!
//! One engine powers the rule collector, the rule executor and the code
//! agent: a Plan-and-Execute loop with tool calling, per-session persistent
//! context, a plan/step state machine with anomaly detection, and an ordered
//! event stream consumed by the HTTP edge.

pub mod agent;
pub mod context;
pub mod error;
pub mod events;
pub mod plan;
pub mod prompts;
pub mod session;
pub mod tracker;

pub use agent::{AgentConfig, ApprovalRequest, PlanExecuteAgent, PlanReview};
pub use context::{
    AgentContext, AgentMode, CodeContext, ConversationHistory, Decision, ExecutionContext,
    FileEntry, MemoryContext, Message, MessageRole, OutputRecord,
};
pub use error::{AgentError, Result};
pub use events::{AgentEvent, EventBus, EventFrame, EventSink, RunMode, ToolCallSummary};
pub use plan::{
    CreatePlanTool, Plan, PlanStatus, PlanStep, PlanStepInput, Progress, StepStatus,
    TaskCompleteTool, ToolCallRecord, CREATE_PLAN_TOOL, TASK_COMPLETE_TOOL,
};
pub use prompts::PromptTemplates;
pub use session::SessionRegistry;
pub use tracker::{AnomalyFinding, AnomalyKind, PlanTracker};
