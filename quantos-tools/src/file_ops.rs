use crate::error::{Result, ToolError};
use crate::traits::{optional_u64, require_string, Tool, ToolResult, ToolSpec};
use crate::workspace::{normalize_rel_path, resolve_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const FILE_BYTES_MAX: usize = 1_000_000;
const LARGE_FILE_LINES: usize = 2_000;
const LARGE_FILE_PREVIEW_LINES: usize = 200;

/// Read a file, optionally a line range. Very large files return a preview
/// and an instruction to re-read with a range.
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn read(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let path = require_string(args, "path")?;
        let start_line = optional_u64(args, "start_line")?.map(|v| v as usize);
        let end_line = optional_u64(args, "end_line")?.map(|v| v as usize);
        let resolved = resolve_path(&self.root, &path)?;

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("read {path}: {e}")))?;
        if bytes.len() > FILE_BYTES_MAX {
            return Err(ToolError::Io(format!(
                "file too large: {} bytes (max {FILE_BYTES_MAX})",
                bytes.len()
            )));
        }
        let content = String::from_utf8_lossy(&bytes).to_string();
        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let rel = normalize_rel_path(&path);

        if let (None, None) = (start_line, end_line) {
            if total_lines > LARGE_FILE_LINES {
                let preview = lines[..LARGE_FILE_PREVIEW_LINES].join("\n");
                let output = format!(
                    "{rel} has {total_lines} lines; showing the first {LARGE_FILE_PREVIEW_LINES}. \
                     Re-read with start_line/end_line for the section you need.\n```\n{preview}\n```"
                );
                return Ok(ToolResult::ok_with_data(
                    output,
                    serde_json::json!({
                        "path": rel,
                        "content": preview,
                        "line_count": total_lines,
                        "truncated": true,
                    }),
                ));
            }
            return Ok(ToolResult::ok_with_data(
                format!("{rel} ({total_lines} lines):\n```\n{content}\n```"),
                serde_json::json!({
                    "path": rel,
                    "content": content,
                    "line_count": total_lines,
                }),
            ));
        }

        let start = start_line.unwrap_or(1).max(1);
        let end = end_line.unwrap_or(total_lines).min(total_lines);
        if start > end || start > total_lines {
            return Err(ToolError::InvalidArguments(format!(
                "line range {start}..{end} is outside 1..{total_lines}"
            )));
        }
        let slice = lines[start - 1..end].join("\n");
        Ok(ToolResult::ok_with_data(
            format!("{rel} (lines {start}-{end} of {total_lines}):\n```\n{slice}\n```"),
            serde_json::json!({
                "path": rel,
                "content": slice,
                "line_count": total_lines,
                "start_line": start,
                "end_line": end,
            }),
        ))
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description:
                "Read a file relative to the project root. Supports an optional line range."
                    .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" },
                    "start_line": { "type": "integer" },
                    "end_line": { "type": "integer" }
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.read(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

/// Create or overwrite a file.
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn write(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let path = require_string(args, "path")?;
        let content = require_string(args, "content")?;
        let resolved = resolve_path(&self.root, &path)?;
        if content.len() > FILE_BYTES_MAX {
            return Err(ToolError::Io(format!(
                "content too large: {} bytes (max {FILE_BYTES_MAX})",
                content.len()
            )));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Io(format!("create dirs for {path}: {e}")))?;
        }
        tokio::fs::write(&resolved, &content)
            .await
            .map_err(|e| ToolError::Io(format!("write {path}: {e}")))?;

        let rel = normalize_rel_path(&path);
        Ok(ToolResult::ok_with_data(
            format!("wrote {rel} ({} chars)", content.chars().count()),
            serde_json::json!({
                "path": rel,
                "content": content,
                "files_changed": [rel],
            }),
        ))
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Create or fully overwrite a file relative to the project root."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.write(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

/// Exact search/replace edit. The search text must occur exactly once.
pub struct PatchFileTool {
    root: PathBuf,
}

impl PatchFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn patch(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let path = require_string(args, "path")?;
        let search = require_string(args, "search")?;
        let replace = require_string(args, "replace")?;
        if search.is_empty() {
            return Err(ToolError::InvalidArguments(
                "search must not be empty".to_string(),
            ));
        }
        let resolved = resolve_path(&self.root, &path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("read {path}: {e}")))?;

        let occurrences = content.matches(&search).count();
        match occurrences {
            0 => Err(ToolError::Io(format!(
                "search text not found in {path}; re-read the file and retry with exact text"
            ))),
            1 => {
                let new_content = content.replacen(&search, &replace, 1);
                tokio::fs::write(&resolved, &new_content)
                    .await
                    .map_err(|e| ToolError::Io(format!("write {path}: {e}")))?;
                let rel = normalize_rel_path(&path);
                Ok(ToolResult::ok_with_data(
                    format!("patched {rel} (1 replacement)"),
                    serde_json::json!({
                        "path": rel,
                        "new_content": new_content,
                        "files_changed": [rel],
                    }),
                ))
            }
            n => Err(ToolError::PatchAmbiguous(format!(
                "search text occurs {n} times in {path}; include more surrounding context"
            ))),
        }
    }
}

#[async_trait]
impl Tool for PatchFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "patch_file".to_string(),
            description: "Replace one exact occurrence of `search` with `replace` in a file. \
                          Fails if the search text is missing or ambiguous."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" },
                    "search": { "type": "string" },
                    "replace": { "type": "string" }
                },
                "required": ["path", "search", "replace"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.patch(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

pub struct ListDirectoryTool {
    root: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn list(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let path = crate::traits::optional_string(args, "path")?.unwrap_or_default();
        let resolved = if path.is_empty() {
            self.root.clone()
        } else {
            resolve_path(&self.root, &path)?
        };

        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("list {path}: {e}")))?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| ToolError::Io(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == "__pycache__" {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        Ok(ToolResult::ok_with_data(
            if entries.is_empty() {
                "directory is empty".to_string()
            } else {
                entries.join("\n")
            },
            serde_json::json!({ "path": normalize_rel_path(&path), "entries": entries }),
        ))
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_directory".to_string(),
            description: "List entries of a directory relative to the project root.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" }
                }
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.list(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

pub struct DeleteFileTool {
    root: PathBuf,
}

impl DeleteFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn delete(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let path = require_string(args, "path")?;
        let resolved = resolve_path(&self.root, &path)?;
        tokio::fs::remove_file(&resolved)
            .await
            .map_err(|e| ToolError::Io(format!("delete {path}: {e}")))?;
        let rel = normalize_rel_path(&path);
        Ok(ToolResult::ok_with_data(
            format!("deleted {rel}"),
            serde_json::json!({ "path": rel, "files_changed": [rel] }),
        ))
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "delete_file".to_string(),
            description: "Delete a file relative to the project root.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.delete(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

pub struct MoveFileTool {
    root: PathBuf,
}

impl MoveFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn rename(&self, args: &serde_json::Value) -> Result<ToolResult> {
        let from = require_string(args, "from")?;
        let to = require_string(args, "to")?;
        let from_resolved = resolve_path(&self.root, &from)?;
        let to_resolved = resolve_path(&self.root, &to)?;
        if let Some(parent) = to_resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Io(format!("create dirs for {to}: {e}")))?;
        }
        tokio::fs::rename(&from_resolved, &to_resolved)
            .await
            .map_err(|e| ToolError::Io(format!("move {from} -> {to}: {e}")))?;
        let from_rel = normalize_rel_path(&from);
        let to_rel = normalize_rel_path(&to);
        Ok(ToolResult::ok_with_data(
            format!("moved {from_rel} -> {to_rel}"),
            serde_json::json!({
                "from": from_rel,
                "to": to_rel,
                "files_changed": [from_rel, to_rel],
            }),
        ))
    }
}

#[async_trait]
impl Tool for MoveFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "move_file".to_string(),
            description: "Move or rename a file within the project root.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "from": { "type": "string" },
                    "to": { "type": "string" }
                },
                "required": ["from", "to"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        match self.rename(&arguments).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorKind;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let read = ReadFileTool::new(dir.path());

        let out = write
            .execute(serde_json::json!({ "path": "main.py", "content": "print('hi')\n" }))
            .await;
        assert!(out.success);
        assert_eq!(out.files_changed(), vec!["main.py"]);

        let out = read.execute(serde_json::json!({ "path": "main.py" })).await;
        assert!(out.success);
        assert!(out.output.contains("print('hi')"));
    }

    #[tokio::test]
    async fn read_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path());
        let out = read
            .execute(serde_json::json!({ "path": "../secrets.txt" }))
            .await;
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ToolErrorKind::PathEscape));
    }

    #[tokio::test]
    async fn patch_applies_unique_replacement() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("rsi.py"), "PERIOD = 14\nWINDOW = 3\n")
            .await
            .unwrap();
        let patch = PatchFileTool::new(dir.path());
        let out = patch
            .execute(serde_json::json!({
                "path": "rsi.py",
                "search": "PERIOD = 14",
                "replace": "PERIOD = 21"
            }))
            .await;
        assert!(out.success);
        let updated = tokio::fs::read_to_string(dir.path().join("rsi.py"))
            .await
            .unwrap();
        assert_eq!(updated, "PERIOD = 21\nWINDOW = 3\n");
    }

    #[tokio::test]
    async fn patch_reverse_restores_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let original = "a = 1\nb = 2\nc = 3\n";
        tokio::fs::write(dir.path().join("m.py"), original).await.unwrap();
        let patch = PatchFileTool::new(dir.path());

        let out = patch
            .execute(serde_json::json!({ "path": "m.py", "search": "b = 2", "replace": "b = 20" }))
            .await;
        assert!(out.success);
        let out = patch
            .execute(serde_json::json!({ "path": "m.py", "search": "b = 20", "replace": "b = 2" }))
            .await;
        assert!(out.success);

        let restored = tokio::fs::read_to_string(dir.path().join("m.py"))
            .await
            .unwrap();
        assert_eq!(restored, original);
    }

    #[tokio::test]
    async fn patch_with_duplicate_search_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("m.py"), "x = 1\nx = 1\n")
            .await
            .unwrap();
        let patch = PatchFileTool::new(dir.path());
        let out = patch
            .execute(serde_json::json!({ "path": "m.py", "search": "x = 1", "replace": "x = 2" }))
            .await;
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ToolErrorKind::PatchAmbiguous));
    }

    #[tokio::test]
    async fn large_file_read_returns_preview() {
        let dir = tempfile::tempdir().unwrap();
        let body = (0..2500)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(dir.path().join("big.py"), &body).await.unwrap();
        let read = ReadFileTool::new(dir.path());
        let out = read.execute(serde_json::json!({ "path": "big.py" })).await;
        assert!(out.success);
        assert!(out.output.contains("Re-read with start_line/end_line"));
        assert_eq!(out.data.unwrap()["truncated"], true);
    }

    #[tokio::test]
    async fn move_reports_both_paths_changed() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("old.py"), "x").await.unwrap();
        let mv = MoveFileTool::new(dir.path());
        let out = mv
            .execute(serde_json::json!({ "from": "old.py", "to": "lib/new.py" }))
            .await;
        assert!(out.success);
        assert_eq!(out.files_changed(), vec!["old.py", "lib/new.py"]);
        assert!(dir.path().join("lib/new.py").exists());
    }
}
