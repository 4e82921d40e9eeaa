use crate::error::{LlmError, Result};
use crate::provider::ProviderConfig;
use crate::types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

const TOOL_NAME_MAX_LEN: usize = 64;

/// Chat endpoint contract: messages + tool definitions in, text + tool-call
/// requests out. Implementations must preserve tool-call ids round-trip.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse>;

    fn model(&self) -> &str;
}

/// Validate a tool name against the strictest provider constraints.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > TOOL_NAME_MAX_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name '{name}' must be 1..={TOOL_NAME_MAX_LEN} chars"
        )));
    }
    let ok = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !ok {
        return Err(LlmError::InvalidInput(format!(
            "tool name '{name}' must match ^[a-zA-Z0-9_-]+$"
        )));
    }
    Ok(())
}

/// Validate a request before it leaves the process: unique tool names and a
/// coherent assistant-tool-call / tool-result pairing.
pub fn validate_request_payload(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
) -> Result<()> {
    let mut tool_names: HashSet<&str> = HashSet::with_capacity(tools.len());
    for tool in tools {
        validate_tool_name(&tool.name)?;
        if !tool_names.insert(tool.name.as_str()) {
            return Err(LlmError::InvalidInput(format!(
                "duplicate tool definition name '{}'",
                tool.name
            )));
        }
    }

    let mut active_tool_call_ids: HashSet<&str> = HashSet::new();
    for (idx, message) in messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                active_tool_call_ids.clear();
                for tool_call in &message.tool_calls {
                    if tool_call.id.trim().is_empty() {
                        return Err(LlmError::InvalidInput(format!(
                            "message[{idx}] has a tool call with an empty id"
                        )));
                    }
                    active_tool_call_ids.insert(tool_call.id.as_str());
                }
            }
            Role::Tool => {
                let tool_call_id = message.tool_call_id.as_deref().ok_or_else(|| {
                    LlmError::InvalidInput(format!(
                        "message[{idx}] is a tool result missing tool_call_id"
                    ))
                })?;
                if !active_tool_call_ids.remove(tool_call_id) {
                    return Err(LlmError::InvalidInput(format!(
                        "message[{idx}] references unknown or duplicate tool_call_id '{tool_call_id}'"
                    )));
                }
            }
            Role::System | Role::User => {
                active_tool_call_ids.clear();
            }
        }
    }
    Ok(())
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    provider: ProviderConfig,
}

impl OpenAiCompatClient {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.provider.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.provider.model))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        validate_request_payload(messages, tools)?;

        let request = WireRequest {
            model: self.provider.model.clone(),
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.iter().map(WireTool::from).collect(),
            temperature: 0.2,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.provider.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "provider returned {status}: {}",
                body.chars().take(500).collect::<String>()
            )));
        }

        let payload: WireResponse = response.json().await?;
        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("response has no choices".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            tool_calls = tool_calls.len(),
            finish_reason = %choice.finish_reason.as_deref().unwrap_or("unknown"),
            "llm call completed"
        );

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                tool_call_id: None,
            },
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    fn model(&self) -> &str {
        &self.provider.model
    }
}

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| WireToolCall {
                        id: tc.id.clone(),
                        kind: "function",
                        function: WireFunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role,
            content: msg.content.clone(),
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

impl From<&ToolDefinition> for WireTool {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: WireFunctionDef {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireResponseToolCall>>,
}

#[derive(Deserialize)]
struct WireResponseToolCall {
    id: String,
    function: WireFunctionCall,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_with_call(id: &str) -> ChatMessage {
        ChatMessage::assistant(
            "",
            vec![ToolCall {
                id: id.to_string(),
                name: "read_file".to_string(),
                arguments: "{}".to_string(),
            }],
        )
    }

    #[test]
    fn validate_accepts_paired_tool_result() {
        let messages = vec![
            ChatMessage::user("hi"),
            assistant_with_call("call-1"),
            ChatMessage::tool("ok", "call-1"),
        ];
        validate_request_payload(&messages, &[]).expect("paired tool result is valid");
    }

    #[test]
    fn validate_rejects_orphan_tool_result() {
        let messages = vec![ChatMessage::user("hi"), ChatMessage::tool("ok", "call-9")];
        let err = validate_request_payload(&messages, &[]).unwrap_err();
        assert!(err.to_string().contains("call-9"));
    }

    #[test]
    fn validate_rejects_duplicate_tool_names() {
        let def = ToolDefinition {
            name: "grep".to_string(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
        };
        let err = validate_request_payload(&[], &[def.clone(), def]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn tool_name_constraints_enforced() {
        validate_tool_name("get_klines").expect("snake case is valid");
        assert!(validate_tool_name("bad name").is_err());
        assert!(validate_tool_name("").is_err());
    }

    #[test]
    fn parsed_arguments_defaults_empty_to_object() {
        let tc = ToolCall {
            id: "c".to_string(),
            name: "t".to_string(),
            arguments: "  ".to_string(),
        };
        assert_eq!(tc.parsed_arguments().unwrap(), serde_json::json!({}));
    }
}
