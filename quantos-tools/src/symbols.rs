use crate::traits::{require_string, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Variable,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Variable => "variable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub signature: String,
    pub line_start: usize,
    pub line_end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

/// Per-file symbol summary plus import edges. The repo map rendered from it
/// is the high-signal project context handed to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolIndex {
    pub symbols_by_file: BTreeMap<String, Vec<SymbolInfo>>,
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl SymbolIndex {
    /// Re-index one file from its current content. Line-oriented Python
    /// extraction: classes, functions, methods, top-level assignments and
    /// import edges.
    pub fn index_file(&mut self, path: &str, content: &str) {
        let lines: Vec<&str> = content.lines().collect();
        let mut symbols = Vec::new();
        let mut imports = Vec::new();
        let mut current_class_indent: Option<usize> = None;

        for (idx, raw) in lines.iter().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = raw.len() - trimmed.len();

            if let Some(class_indent) = current_class_indent {
                if indent <= class_indent && !trimmed.is_empty() {
                    current_class_indent = None;
                }
            }

            if let Some(rest) = trimmed.strip_prefix("import ") {
                imports.push(rest.split(&[' ', ',']).next().unwrap_or(rest).to_string());
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("from ") {
                if let Some(module) = rest.split_whitespace().next() {
                    imports.push(module.to_string());
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("class ") {
                let name = identifier_prefix(rest);
                if !name.is_empty() {
                    symbols.push(SymbolInfo {
                        name,
                        kind: SymbolKind::Class,
                        signature: trimmed.trim_end_matches(':').to_string(),
                        line_start: line_no,
                        line_end: block_end(&lines, idx, indent),
                        docstring: docstring_after(&lines, idx),
                    });
                    current_class_indent = Some(indent);
                }
                continue;
            }

            let def_rest = trimmed
                .strip_prefix("def ")
                .or_else(|| trimmed.strip_prefix("async def "));
            if let Some(rest) = def_rest {
                let name = identifier_prefix(rest);
                if !name.is_empty() {
                    let kind = if current_class_indent.is_some() && indent > 0 {
                        SymbolKind::Method
                    } else {
                        SymbolKind::Function
                    };
                    symbols.push(SymbolInfo {
                        name,
                        kind,
                        signature: trimmed.trim_end_matches(':').to_string(),
                        line_start: line_no,
                        line_end: block_end(&lines, idx, indent),
                        docstring: docstring_after(&lines, idx),
                    });
                }
                continue;
            }

            if indent == 0 {
                if let Some(eq) = trimmed.find('=') {
                    let lhs = trimmed[..eq].trim();
                    if is_identifier(lhs) && !trimmed[eq..].starts_with("==") {
                        symbols.push(SymbolInfo {
                            name: lhs.to_string(),
                            kind: SymbolKind::Variable,
                            signature: trimmed.to_string(),
                            line_start: line_no,
                            line_end: line_no,
                            docstring: None,
                        });
                    }
                }
            }
        }

        imports.sort();
        imports.dedup();
        self.symbols_by_file.insert(path.to_string(), symbols);
        self.dependencies.insert(path.to_string(), imports);
    }

    pub fn remove_file(&mut self, path: &str) {
        self.symbols_by_file.remove(path);
        self.dependencies.remove(path);
    }

    pub fn file_count(&self) -> usize {
        self.symbols_by_file.len()
    }

    pub fn outline(&self, path: &str) -> Option<&[SymbolInfo]> {
        self.symbols_by_file.get(path).map(Vec::as_slice)
    }

    /// First definition site for a symbol name; classes and functions win
    /// over variables with the same name.
    pub fn definition(&self, name: &str) -> Option<(String, SymbolInfo)> {
        let mut variable_hit = None;
        for (file, symbols) in &self.symbols_by_file {
            for symbol in symbols {
                if symbol.name != name {
                    continue;
                }
                if symbol.kind == SymbolKind::Variable {
                    if variable_hit.is_none() {
                        variable_hit = Some((file.clone(), symbol.clone()));
                    }
                } else {
                    return Some((file.clone(), symbol.clone()));
                }
            }
        }
        variable_hit
    }

    /// Files that define a symbol with this name or import its defining
    /// module.
    pub fn find_references(&self, name: &str) -> Vec<String> {
        let mut files = Vec::new();
        let mut defining_modules = Vec::new();
        for (file, symbols) in &self.symbols_by_file {
            if symbols.iter().any(|s| s.name == name) {
                files.push(file.clone());
                if let Some(stem) = file.strip_suffix(".py") {
                    defining_modules.push(stem.replace('/', "."));
                }
            }
        }
        for (file, imports) in &self.dependencies {
            let references = imports.iter().any(|module| {
                module == name || defining_modules.iter().any(|m| m == module)
            });
            if references && !files.contains(file) {
                files.push(file.clone());
            }
        }
        files.sort();
        files
    }

    /// Pure function of the index: a compact per-file listing capped at
    /// `max_files` files.
    pub fn to_repo_map_string(&self, max_files: usize) -> String {
        let mut out = String::new();
        for (file, symbols) in self.symbols_by_file.iter().take(max_files) {
            out.push_str(file);
            out.push('\n');
            for symbol in symbols {
                out.push_str(&format!(
                    "  {} {} (L{})\n",
                    symbol.kind.as_str(),
                    symbol.signature,
                    symbol.line_start
                ));
            }
        }
        if self.symbols_by_file.len() > max_files {
            out.push_str(&format!(
                "...and {} more files\n",
                self.symbols_by_file.len() - max_files
            ));
        }
        out
    }
}

fn identifier_prefix(text: &str) -> String {
    text.chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !text.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn block_end(lines: &[&str], start_idx: usize, indent: usize) -> usize {
    for (idx, raw) in lines.iter().enumerate().skip(start_idx + 1) {
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if raw.len() - trimmed.len() <= indent {
            return idx;
        }
    }
    lines.len()
}

fn docstring_after(lines: &[&str], def_idx: usize) -> Option<String> {
    let next = lines
        .iter()
        .skip(def_idx + 1)
        .map(|l| l.trim())
        .find(|l| !l.is_empty())?;
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = next.strip_prefix(quote) {
            let text = rest.strip_suffix(quote).unwrap_or(rest).trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
            return None;
        }
    }
    None
}

/// Index shared between the agent's code context and the outline tools.
#[derive(Debug, Clone, Default)]
pub struct SharedSymbolIndex {
    inner: Arc<RwLock<SymbolIndex>>,
}

impl SharedSymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_index(index: SymbolIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(index)),
        }
    }

    pub fn index_file(&self, path: &str, content: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .index_file(path, content);
    }

    pub fn remove_file(&self, path: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_file(path);
    }

    pub fn replace(&self, index: SymbolIndex) {
        *self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = index;
    }

    pub fn snapshot(&self) -> SymbolIndex {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&SymbolIndex) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct GetFileOutlineTool {
    index: SharedSymbolIndex,
}

impl GetFileOutlineTool {
    pub fn new(index: SharedSymbolIndex) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for GetFileOutlineTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_file_outline".to_string(),
            description: "List the classes, functions and top-level variables of a file."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        let path = match require_string(&arguments, "path") {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        self.index.with(|index| match index.outline(&path) {
            Some(symbols) if !symbols.is_empty() => {
                let listing = symbols
                    .iter()
                    .map(|s| format!("{} {} (L{}-L{})", s.kind.as_str(), s.signature, s.line_start, s.line_end))
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolResult::ok_with_data(
                    listing,
                    serde_json::json!({ "path": path, "symbols": symbols }),
                )
            }
            Some(_) => ToolResult::ok(format!("{path} has no indexed symbols")),
            None => ToolResult::ok(format!("{path} is not indexed; read it first")),
        })
    }
}

pub struct FindReferencesTool {
    index: SharedSymbolIndex,
}

impl FindReferencesTool {
    pub fn new(index: SharedSymbolIndex) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for FindReferencesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "find_references".to_string(),
            description: "Find files that define or import a symbol.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "symbol": { "type": "string" } },
                "required": ["symbol"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        let symbol = match require_string(&arguments, "symbol") {
            Ok(s) => s,
            Err(e) => return e.into(),
        };
        let files = self.index.with(|index| index.find_references(&symbol));
        if files.is_empty() {
            ToolResult::ok(format!("no references to {symbol}"))
        } else {
            ToolResult::ok_with_data(
                files.join("\n"),
                serde_json::json!({ "symbol": symbol, "files": files }),
            )
        }
    }
}

pub struct GetDefinitionTool {
    index: SharedSymbolIndex,
}

impl GetDefinitionTool {
    pub fn new(index: SharedSymbolIndex) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for GetDefinitionTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_definition".to_string(),
            description: "Locate the definition of a symbol by name.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "symbol": { "type": "string" } },
                "required": ["symbol"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        let symbol = match require_string(&arguments, "symbol") {
            Ok(s) => s,
            Err(e) => return e.into(),
        };
        match self.index.with(|index| index.definition(&symbol)) {
            Some((file, info)) => ToolResult::ok_with_data(
                format!("{file}:{} {}", info.line_start, info.signature),
                serde_json::json!({ "file": file, "symbol": info }),
            ),
            None => ToolResult::ok(format!("no definition found for {symbol}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
import json
from indicators import rsi

PERIOD = 14

class Strategy:
    """RSI mean reversion."""

    def __init__(self, period):
        self.period = period

    def evaluate(self, closes):
        return rsi(closes, self.period)

def main():
    print("run")
"#;

    #[test]
    fn indexes_classes_functions_and_variables() {
        let mut index = SymbolIndex::default();
        index.index_file("strategy.py", SAMPLE);
        let symbols = index.outline("strategy.py").unwrap();

        let names: Vec<(&str, SymbolKind)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind))
            .collect();
        assert!(names.contains(&("PERIOD", SymbolKind::Variable)));
        assert!(names.contains(&("Strategy", SymbolKind::Class)));
        assert!(names.contains(&("evaluate", SymbolKind::Method)));
        assert!(names.contains(&("main", SymbolKind::Function)));
    }

    #[test]
    fn captures_docstring_and_imports() {
        let mut index = SymbolIndex::default();
        index.index_file("strategy.py", SAMPLE);
        let class = index.definition("Strategy").unwrap().1;
        assert_eq!(class.docstring.as_deref(), Some("RSI mean reversion."));
        assert_eq!(
            index.dependencies["strategy.py"],
            vec!["indicators".to_string(), "json".to_string()]
        );
    }

    #[test]
    fn repo_map_is_pure_function_of_index() {
        let mut index = SymbolIndex::default();
        index.index_file("strategy.py", SAMPLE);
        let first = index.to_repo_map_string(20);
        let second = index.to_repo_map_string(20);
        assert_eq!(first, second);
        assert!(first.contains("class Strategy"));
    }

    #[test]
    fn references_follow_import_edges() {
        let mut index = SymbolIndex::default();
        index.index_file("indicators.py", "def rsi(series, period):\n    pass\n");
        index.index_file("strategy.py", SAMPLE);
        let refs = index.find_references("rsi");
        assert_eq!(refs, vec!["indicators.py".to_string(), "strategy.py".to_string()]);
    }

    #[tokio::test]
    async fn outline_tool_reads_shared_index() {
        let shared = SharedSymbolIndex::new();
        shared.index_file("strategy.py", SAMPLE);
        let tool = GetFileOutlineTool::new(shared);
        let out = tool
            .execute(serde_json::json!({ "path": "strategy.py" }))
            .await;
        assert!(out.success);
        assert!(out.output.contains("def main"));
    }
}
