use crate::error::{ToolError, ToolErrorKind};
use crate::schema::validate_arguments;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters_schema: serde_json::Value,
}

/// Uniform tool outcome. Failures are data the model can act on; the
/// orchestrator only treats a few kinds as fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn ok_with_data(output: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(output)
        }
    }

    pub fn fail(kind: ToolErrorKind, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: String::new(),
            data: None,
            error: Some(error),
            error_kind: Some(kind),
        }
    }

    /// Paths this invocation changed, as reported by the tool.
    pub fn files_changed(&self) -> Vec<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get("files_changed"))
            .and_then(|v| v.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rendering used for the tool message appended to history.
    pub fn to_message(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "error[{}]: {}",
                self.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                self.error.as_deref().unwrap_or("tool failed")
            )
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(e: ToolError) -> Self {
        Self::fail(e.kind(), e.to_string())
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> ToolResult;
}

pub fn to_tool_definition(tool: &dyn Tool) -> quantos_llm::ToolDefinition {
    let spec = tool.spec();
    quantos_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

/// Catalog of callable tools. Arguments are validated against the declared
/// schema at this boundary so invokers can assume a typed shape.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.spec().name, tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<quantos_llm::ToolDefinition> {
        self.tools
            .values()
            .map(|t| to_tool_definition(t.as_ref()))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, arguments), fields(tool = %name))]
    pub async fn invoke(&self, name: &str, arguments: serde_json::Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::fail(
                ToolErrorKind::InvalidArguments,
                format!("unknown tool: {name}"),
            );
        };

        if let Err(problem) = validate_arguments(&tool.spec().parameters_schema, &arguments) {
            tracing::debug!(problem = %problem, "tool arguments rejected by schema");
            return ToolResult::fail(ToolErrorKind::InvalidArguments, problem);
        }

        tool.execute(arguments).await
    }
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> crate::Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> crate::Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_u64(args: &serde_json::Value, key: &str) -> crate::Result<Option<u64>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n.as_u64().map(Some).ok_or_else(|| {
            ToolError::InvalidArguments(format!("key {key} must be a non-negative integer"))
        }),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be integer, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_f64(args: &serde_json::Value, key: &str) -> crate::Result<Option<f64>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => Ok(n.as_f64()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be number, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "Echo the given text.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
            match require_string(&arguments, "text") {
                Ok(text) => ToolResult::ok(text),
                Err(e) => e.into(),
            }
        }
    }

    #[tokio::test]
    async fn registry_invokes_known_tool() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        let out = registry
            .invoke("echo", serde_json::json!({ "text": "hi" }))
            .await;
        assert!(out.success);
        assert_eq!(out.output, "hi");
    }

    #[tokio::test]
    async fn registry_rejects_schema_violation_before_invocation() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        let out = registry.invoke("echo", serde_json::json!({})).await;
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ToolErrorKind::InvalidArguments));
    }

    #[tokio::test]
    async fn registry_reports_unknown_tool_as_failed_result() {
        let registry = ToolRegistry::new();
        let out = registry.invoke("nope", serde_json::json!({})).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("unknown tool"));
    }

    #[test]
    fn files_changed_reads_data_field() {
        let result = ToolResult::ok_with_data(
            "written",
            serde_json::json!({ "files_changed": ["a.py", "b.py"] }),
        );
        assert_eq!(result.files_changed(), vec!["a.py", "b.py"]);
    }
}
