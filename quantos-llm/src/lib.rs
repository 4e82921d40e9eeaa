//! LLM adapter for QuantOS agents.
//!
//! The provider is a black-box chat endpoint: it accepts messages plus tool
//! definitions and returns text plus tool-call requests. Tool-call ids must
//! round-trip so tool results can reference them.

mod client;
mod error;
mod provider;
#[cfg(any(test, feature = "test-util"))]
mod scripted;
mod types;

pub use client::{validate_request_payload, validate_tool_name, ChatClient, OpenAiCompatClient};
pub use error::{LlmError, Result};
pub use provider::{select_provider, ProviderConfig};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedClient;
pub use types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition};
