use crate::error::{Result, ToolError};
use crate::traits::{optional_string, require_string, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};

const MATCHES_MAX: usize = 200;
const WALK_STEPS_MAX: usize = 50_000;

/// Literal or regex content search over the workspace, with an optional
/// `*`-glob filter on relative paths.
pub struct GrepTool {
    root: PathBuf,
}

impl GrepTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn search(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let pattern = require_string(args, "pattern")?;
        let use_regex = args.get("regex").and_then(|v| v.as_bool()).unwrap_or(false);
        let glob = optional_string(args, "glob")?;

        let matcher = if use_regex {
            Regex::new(&pattern)
                .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?
        } else {
            Regex::new(&regex::escape(&pattern))
                .map_err(|e| ToolError::InvalidArguments(format!("invalid pattern: {e}")))?
        };
        let glob_regex = match glob.as_deref() {
            Some(g) => Some(glob_to_regex(g)?),
            None => None,
        };

        let mut stack = vec![self.root.clone()];
        let mut matches = Vec::new();
        let mut truncated = false;
        let mut steps = 0usize;

        'walk: while let Some(dir) = stack.pop() {
            steps += 1;
            if steps >= WALK_STEPS_MAX {
                break;
            }
            let mut rd = match tokio::fs::read_dir(&dir).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            while let Some(entry) = rd
                .next_entry()
                .await
                .map_err(|e| ToolError::Io(e.to_string()))?
            {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || name == "__pycache__" {
                    continue;
                }
                let meta = match entry.metadata().await {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }

                let rel = match path.strip_prefix(&self.root) {
                    Ok(r) => r.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };
                if let Some(g) = &glob_regex {
                    if !g.is_match(&rel) {
                        continue;
                    }
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                for (line_no, line) in content.lines().enumerate() {
                    if matcher.is_match(line) {
                        matches.push(format!("{rel}:{}: {}", line_no + 1, line.trim_end()));
                        if matches.len() >= MATCHES_MAX {
                            truncated = true;
                            break 'walk;
                        }
                    }
                }
            }
        }

        let mut output = if matches.is_empty() {
            "no matches".to_string()
        } else {
            matches.join("\n")
        };
        if truncated {
            output.push_str(&format!("\n...[stopped after {MATCHES_MAX} matches]"));
        }
        Ok(ToolResult::ok_with_data(
            output,
            serde_json::json!({ "match_count": matches.len(), "truncated": truncated }),
        ))
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "grep".to_string(),
            description: "Search file contents. Literal by default; set regex=true for regex; \
                          optional glob filters the relative path."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "pattern": { "type": "string" },
                    "regex": { "type": "boolean" },
                    "glob": { "type": "string" }
                },
                "required": ["pattern"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.search(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| ToolError::InvalidArguments(format!("invalid glob: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("strategy"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("strategy/rsi.py"),
            "PERIOD = 14\ndef rsi(series):\n    pass\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.md"), "rsi threshold is 20\n")
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn literal_search_finds_lines() {
        let dir = fixture().await;
        let grep = GrepTool::new(dir.path());
        let out = grep
            .execute(serde_json::json!({ "pattern": "PERIOD" }))
            .await;
        assert!(out.success);
        assert!(out.output.contains("strategy/rsi.py:1"));
    }

    #[tokio::test]
    async fn glob_filter_limits_files() {
        let dir = fixture().await;
        let grep = GrepTool::new(dir.path());
        let out = grep
            .execute(serde_json::json!({ "pattern": "rsi", "glob": "*.md" }))
            .await;
        assert!(out.success);
        assert!(out.output.contains("notes.md"));
        assert!(!out.output.contains("rsi.py"));
    }

    #[tokio::test]
    async fn invalid_regex_is_reported() {
        let dir = fixture().await;
        let grep = GrepTool::new(dir.path());
        let out = grep
            .execute(serde_json::json!({ "pattern": "[unclosed", "regex": true }))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("invalid regex"));
    }
}
