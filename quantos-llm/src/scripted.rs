use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Test double: replays a fixed script of responses and records every
/// request it saw.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn text(content: &str) -> ChatResponse {
        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: content.to_string(),
                tool_calls: vec![],
                tool_call_id: None,
            },
            finish_reason: "stop".to_string(),
        }
    }

    pub fn tool_calls(content: &str, calls: Vec<(&str, &str, serde_json::Value)>) -> ChatResponse {
        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: content.to_string(),
                tool_calls: calls
                    .into_iter()
                    .map(|(id, name, args)| ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: args.to_string(),
                    })
                    .collect(),
                tool_call_id: None,
            },
            finish_reason: "tool_calls".to_string(),
        }
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn request(&self, idx: usize) -> Option<Vec<ChatMessage>> {
        self.requests.lock().expect("requests lock").get(idx).cloned()
    }
}

#[async_trait]
impl crate::client::ChatClient for ScriptedClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.to_vec());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| LlmError::Http("scripted client exhausted".to_string()))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
