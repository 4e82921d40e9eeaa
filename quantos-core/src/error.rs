use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("llm transport error: {0}")]
    Llm(#[from] quantos_llm::LlmError),

    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("sandbox is not configured for this agent")]
    SandboxUnavailable,
}
