use crate::error::{Result, ToolError};
use std::path::{Component, Path, PathBuf};

/// Resolve a model-supplied relative path against the workspace root.
/// Absolute paths and any parent/root component are rejected; file tools
/// can therefore never touch anything outside the workspace.
pub fn resolve_path(root: &Path, user_path: &str) -> Result<PathBuf> {
    let rel = Path::new(user_path);
    if rel.is_absolute() {
        return Err(ToolError::PathEscape(
            "absolute paths are not allowed".to_string(),
        ));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(ToolError::PathEscape(
                    "path traversal is not allowed".to_string(),
                ));
            }
            Component::CurDir | Component::Normal(_) => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::PathEscape(format!("invalid path: {user_path}")));
            }
        }
    }
    Ok(root.join(rel))
}

/// Normalize a relative path for storage: strip `./` segments and use `/`
/// separators regardless of platform.
pub fn normalize_rel_path(user_path: &str) -> String {
    Path::new(user_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn language_for_path(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("py") => "python",
        Some("rs") => "rust",
        Some("js") => "javascript",
        Some("ts") => "typescript",
        Some("json") => "json",
        Some("yaml") | Some("yml") => "yaml",
        Some("toml") => "toml",
        Some("md") => "markdown",
        Some("sh") => "bash",
        _ => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_traversal() {
        let err = resolve_path(Path::new("/ws"), "../outside.txt").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
    }

    #[test]
    fn resolve_rejects_absolute() {
        let err = resolve_path(Path::new("/ws"), "/etc/passwd").unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
    }

    #[test]
    fn resolve_joins_relative() {
        let path = resolve_path(Path::new("/ws"), "strategy/rsi.py").unwrap();
        assert_eq!(path, Path::new("/ws/strategy/rsi.py"));
    }

    #[test]
    fn normalize_strips_curdir() {
        assert_eq!(normalize_rel_path("./strategy/rsi.py"), "strategy/rsi.py");
    }
}
