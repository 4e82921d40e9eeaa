use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Machine-readable failure category, carried on failed tool results so the
/// orchestrator can apply per-kind policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArguments,
    ToolNotAllowed,
    ToolIoError,
    PatchAmbiguous,
    PathEscape,
    Busy,
    Timeout,
    Cancelled,
    ExecutionFailed,
}

impl ToolErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalid_arguments",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::ToolIoError => "tool_io_error",
            Self::PatchAmbiguous => "patch_ambiguous",
            Self::PathEscape => "path_escape",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ExecutionFailed => "execution_failed",
        }
    }

    /// Fatal kinds fail the owning step instead of being retried by the model.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::PathEscape | Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("patch is ambiguous: {0}")]
    PatchAmbiguous(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            Self::PathEscape(_) => ToolErrorKind::PathEscape,
            Self::PatchAmbiguous(_) => ToolErrorKind::PatchAmbiguous,
            Self::Io(_) => ToolErrorKind::ToolIoError,
            Self::Busy(_) => ToolErrorKind::Busy,
            Self::Timeout(_) => ToolErrorKind::Timeout,
            Self::Cancelled => ToolErrorKind::Cancelled,
            Self::ExecutionFailed(_) => ToolErrorKind::ExecutionFailed,
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
