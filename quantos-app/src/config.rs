//! Startup configuration: a TOML file with per-section defaults, followed
//! by `QUANTOS_*` environment overrides, then validation.

use quantos_llm::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantOsConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agent: AgentSectionConfig,
    #[serde(default)]
    pub executor: ExecutorSectionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Ordered provider list; the first with a usable key wins.
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: String,
}

fn default_workspace_root() -> String {
    "workspaces".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSectionConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_step_max_iterations")]
    pub step_max_iterations: usize,
    #[serde(default)]
    pub approval_gate: bool,
}

fn default_max_iterations() -> usize {
    20
}

fn default_step_max_iterations() -> usize {
    10
}

impl Default for AgentSectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            step_max_iterations: default_step_max_iterations(),
            approval_gate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSectionConfig {
    #[serde(default = "default_poll_seconds")]
    pub default_poll_seconds: u64,
    #[serde(default = "default_decision_max_iterations")]
    pub decision_max_iterations: usize,
}

fn default_poll_seconds() -> u64 {
    60
}

fn default_decision_max_iterations() -> usize {
    10
}

impl Default for ExecutorSectionConfig {
    fn default() -> Self {
        Self {
            default_poll_seconds: default_poll_seconds(),
            decision_max_iterations: default_decision_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// One of "60s", "5min", "30min", "unlimited".
    #[serde(default = "default_sandbox_timeout")]
    pub default_timeout: String,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_sandbox_timeout() -> String {
    "5min".to_string()
}

fn default_grace_seconds() -> u64 {
    2
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_sandbox_timeout(),
            grace_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
}

fn default_idle_timeout_seconds() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }
}

impl QuantOsConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from("quantos.toml"));
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut config: QuantOsConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        // A fully env-specified provider is prepended so it takes priority.
        if let (Ok(api_key), Ok(base_url), Ok(model)) = (
            std::env::var("QUANTOS_API_KEY"),
            std::env::var("QUANTOS_BASE_URL"),
            std::env::var("QUANTOS_MODEL"),
        ) {
            if !api_key.trim().is_empty() {
                self.general.providers.insert(
                    0,
                    ProviderConfig {
                        api_key,
                        base_url,
                        model,
                    },
                );
            }
        }
        if let Ok(v) = std::env::var("QUANTOS_WORKSPACE_ROOT") {
            if !v.trim().is_empty() {
                self.workspace.root = v;
            }
        }
        if let Ok(v) = std::env::var("QUANTOS_EXECUTOR_POLL_SECONDS") {
            self.executor.default_poll_seconds = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid QUANTOS_EXECUTOR_POLL_SECONDS={v:?}: {e}"))?;
        }
        if let Ok(v) = std::env::var("QUANTOS_APPROVAL_GATE") {
            self.agent.approval_gate = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => anyhow::bail!("invalid QUANTOS_APPROVAL_GATE={other:?}"),
            };
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.providers.is_empty() {
            anyhow::bail!("general.providers must list at least one provider");
        }
        quantos_tools::RunTimeout::parse(&self.sandbox.default_timeout)
            .map_err(|e| anyhow::anyhow!("sandbox.default_timeout: {e}"))?;
        if self.agent.max_iterations == 0 || self.agent.step_max_iterations == 0 {
            anyhow::bail!("agent iteration caps must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
[general]
[[general.providers]]
api_key = "sk-test"
base_url = "https://api.example.com/v1"
model = "deepseek-chat"
"#;
        let config: QuantOsConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.workspace.root, "workspaces");
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.executor.default_poll_seconds, 60);
        assert_eq!(config.sandbox.default_timeout, "5min");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_sections() {
        let raw = r#"
[general]
providers = []

[telemetry]
enabled = true
"#;
        assert!(toml::from_str::<QuantOsConfig>(raw).is_err());
    }

    #[test]
    fn rejects_bad_sandbox_timeout() {
        let raw = r#"
[general]
[[general.providers]]
api_key = "k"
base_url = "u"
model = "m"

[sandbox]
default_timeout = "90s"
"#;
        let config: QuantOsConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
