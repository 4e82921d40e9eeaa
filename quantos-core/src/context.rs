use crate::plan::Plan;
use chrono::{DateTime, Utc};
use quantos_llm::{ChatMessage, ToolCall};
use serde::{Deserialize, Serialize};

const DECISIONS_MAX: usize = 50;
const CONVENTIONS_MAX: usize = 20;
const RECENT_OUTPUTS_MAX: usize = 5;
const SHELL_HISTORY_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// One conversation entry. `turn` drives the content-duplication policy:
/// file-backed tool messages from earlier turns are abbreviated in the
/// prompt projection because their bytes live in `focused_files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_abbreviated: bool,
    #[serde(default)]
    pub full_content_ref: Option<String>,
    #[serde(default)]
    pub turn: u64,
}

impl Message {
    pub fn user(content: impl Into<String>, turn: u64) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            tool_name: None,
            is_abbreviated: false,
            full_content_ref: None,
            turn,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>, turn: u64) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            is_abbreviated: false,
            full_content_ref: None,
            turn,
        }
    }

    pub fn tool(
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        turn: u64,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            is_abbreviated: false,
            full_content_ref: None,
            turn,
        }
    }

    pub fn with_file_ref(mut self, path: impl Into<String>) -> Self {
        self.full_content_ref = Some(path.into());
        self
    }
}

/// Bounded conversation. Eviction drops whole conversational units from the
/// front and never separates an assistant tool-call message from its
/// results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub messages: Vec<Message>,
    pub max_messages: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(4),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        while self.messages.len() > self.max_messages {
            let unit = self.first_unit_len();
            if unit == 0 || unit >= self.messages.len() {
                break;
            }
            self.messages.drain(..unit);
        }
    }

    /// Length of the oldest user/assistant/tool unit.
    fn first_unit_len(&self) -> usize {
        let Some(first) = self.messages.first() else {
            return 0;
        };
        match first.role {
            MessageRole::User => {
                let mut len = 1;
                while let Some(next) = self.messages.get(len) {
                    if next.role == MessageRole::User {
                        break;
                    }
                    len += 1;
                }
                len
            }
            MessageRole::Assistant => {
                let ids: Vec<&str> = first
                    .tool_calls
                    .iter()
                    .map(|tc| tc.id.as_str())
                    .collect();
                let mut len = 1;
                while let Some(next) = self.messages.get(len) {
                    let paired = next.role == MessageRole::Tool
                        && next
                            .tool_call_id
                            .as_deref()
                            .is_some_and(|id| ids.contains(&id));
                    if !paired {
                        break;
                    }
                    len += 1;
                }
                len
            }
            // An orphan tool message cannot exist ahead of its assistant
            // message; drop it alone if it somehow does.
            MessageRole::Tool => 1,
        }
    }

    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Prompt projection. File-backed tool results from earlier turns are
    /// collapsed to a pointer; oversized shell output is truncated with a
    /// length marker; everything else goes through verbatim.
    pub fn to_llm(&self, current_turn: u64) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| self.project_message(m, current_turn))
            .collect()
    }

    pub fn project_recent(&self, n: usize, current_turn: u64) -> Vec<ChatMessage> {
        let recent = self.recent(n);
        // The window must not open on an orphan tool result.
        let start = recent
            .iter()
            .position(|m| m.role != MessageRole::Tool)
            .unwrap_or(recent.len());
        recent[start..]
            .iter()
            .map(|m| self.project_message(m, current_turn))
            .collect()
    }

    fn project_message(&self, message: &Message, current_turn: u64) -> ChatMessage {
        match message.role {
            MessageRole::User => ChatMessage::user(message.content.clone()),
            MessageRole::Assistant => {
                ChatMessage::assistant(message.content.clone(), message.tool_calls.clone())
            }
            MessageRole::Tool => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let content = if let Some(path) = &message.full_content_ref {
                    if message.turn < current_turn {
                        format!(
                            "[{} {path}; full content in focused_files]",
                            message.tool_name.as_deref().unwrap_or("tool")
                        )
                    } else {
                        message.content.clone()
                    }
                } else if message.tool_name.as_deref() == Some("shell_exec")
                    && message.content.chars().count() > SHELL_HISTORY_MAX_CHARS
                {
                    let kept: String = message
                        .content
                        .chars()
                        .take(SHELL_HISTORY_MAX_CHARS)
                        .collect();
                    let dropped = message.content.chars().count() - SHELL_HISTORY_MAX_CHARS;
                    format!("{kept}\n...[shell output truncated: {dropped} chars dropped]")
                } else {
                    message.content.clone()
                };
                ChatMessage::tool(content, id)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    pub language: String,
    pub is_editing: bool,
    /// Logical access clock, monotonic per code context.
    pub last_accessed: u64,
}

mod shared_index_serde {
    use quantos_tools::{SharedSymbolIndex, SymbolIndex};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        index: &SharedSymbolIndex,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        index.snapshot().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<SharedSymbolIndex, D::Error> {
        Ok(SharedSymbolIndex::from_index(SymbolIndex::deserialize(
            deserializer,
        )?))
    }
}

/// Focused files plus the symbol index. Insertion keeps total characters
/// under the cap by evicting the least-recently-accessed non-editing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeContext {
    pub workspace_root: String,
    pub file_tree: Vec<String>,
    pub focused_files: Vec<FileEntry>,
    #[serde(with = "shared_index_serde")]
    pub symbol_index: quantos_tools::SharedSymbolIndex,
    pub max_total_chars: usize,
    access_clock: u64,
}

impl CodeContext {
    pub fn new(workspace_root: impl Into<String>, max_total_chars: usize) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            file_tree: Vec::new(),
            focused_files: Vec::new(),
            symbol_index: quantos_tools::SharedSymbolIndex::new(),
            max_total_chars: max_total_chars.max(1_000),
            access_clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    pub fn insert_file(&mut self, path: &str, content: &str, is_editing: bool) {
        let clock = self.tick();
        let capped: String = content.chars().take(self.max_total_chars).collect();
        let language = quantos_tools::language_for_path(path).to_string();

        if let Some(entry) = self.focused_files.iter_mut().find(|f| f.path == path) {
            entry.content = capped;
            entry.language = language;
            entry.is_editing = entry.is_editing || is_editing;
            entry.last_accessed = clock;
        } else {
            self.focused_files.push(FileEntry {
                path: path.to_string(),
                content: capped,
                language,
                is_editing,
                last_accessed: clock,
            });
        }
        if !self.file_tree.iter().any(|p| p == path) {
            self.file_tree.push(path.to_string());
            self.file_tree.sort();
        }
        self.evict_to_cap();
    }

    fn evict_to_cap(&mut self) {
        while self.total_chars() > self.max_total_chars {
            let Some(lru_idx) = self
                .focused_files
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.is_editing)
                .min_by_key(|(_, f)| f.last_accessed)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            let evicted = self.focused_files.remove(lru_idx);
            tracing::debug!(path = %evicted.path, "evicted focused file to stay under char cap");
        }
    }

    pub fn touch(&mut self, path: &str) {
        let clock = self.tick();
        if let Some(entry) = self.focused_files.iter_mut().find(|f| f.path == path) {
            entry.last_accessed = clock;
        }
    }

    pub fn remove_file(&mut self, path: &str) {
        self.focused_files.retain(|f| f.path != path);
        self.file_tree.retain(|p| p != path);
        self.symbol_index.remove_file(path);
    }

    pub fn is_focused(&self, path: &str) -> bool {
        self.focused_files.iter().any(|f| f.path == path)
    }

    pub fn total_chars(&self) -> usize {
        self.focused_files
            .iter()
            .map(|f| f.content.chars().count())
            .sum()
    }

    pub fn focused_paths(&self) -> Vec<String> {
        self.focused_files.iter().map(|f| f.path.clone()).collect()
    }

    /// Render focused files with full content for Plan-mode step prompts.
    pub fn to_context_string(&self) -> String {
        if self.focused_files.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Focused files\n");
        for file in &self.focused_files {
            out.push_str(&format!(
                "\n### {}\n```{}\n{}\n```\n",
                file.path, file.language, file.content
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable per-session memory: project conventions plus recent decisions,
/// both length-capped and rendered into the system prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    pub conventions: Vec<String>,
    pub decisions: Vec<Decision>,
}

impl MemoryContext {
    pub fn add_decision(&mut self, decision: impl Into<String>, reason: impl Into<String>) {
        self.decisions.push(Decision {
            decision: decision.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        });
        if self.decisions.len() > DECISIONS_MAX {
            let overflow = self.decisions.len() - DECISIONS_MAX;
            self.decisions.drain(..overflow);
        }
    }

    pub fn add_convention(&mut self, convention: impl Into<String>) {
        self.conventions.push(convention.into());
        if self.conventions.len() > CONVENTIONS_MAX {
            let overflow = self.conventions.len() - CONVENTIONS_MAX;
            self.conventions.drain(..overflow);
        }
    }

    pub fn recent_decisions(&self, n: usize) -> &[Decision] {
        let start = self.decisions.len().saturating_sub(n);
        &self.decisions[start..]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub command: String,
    pub exit_code: i64,
    pub output: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub recent_outputs: Vec<OutputRecord>,
}

impl ExecutionContext {
    pub fn record(&mut self, record: OutputRecord) {
        self.recent_outputs.push(record);
        if self.recent_outputs.len() > RECENT_OUTPUTS_MAX {
            let overflow = self.recent_outputs.len() - RECENT_OUTPUTS_MAX;
            self.recent_outputs.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    CodeEdit,
    Debug,
    Plan,
    Explain,
}

/// The per-session data model: owned by one agent instance, mutated only by
/// it, discarded when the session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: String,
    pub project_id: String,
    pub agent_mode: AgentMode,
    pub task: Option<String>,
    pub plan: Option<Plan>,
    pub conversation: ConversationHistory,
    pub code_context: CodeContext,
    pub memory: MemoryContext,
    pub execution: ExecutionContext,
}

impl AgentContext {
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        workspace_root: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            agent_mode: AgentMode::CodeEdit,
            task: None,
            plan: None,
            conversation: ConversationHistory::new(50),
            code_context: CodeContext::new(workspace_root, 40_000),
            memory: MemoryContext::default(),
            execution: ExecutionContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantos_llm::Role;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "read_file".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn eviction_never_splits_tool_call_pairs() {
        let mut history = ConversationHistory::new(4);
        history.push(Message::user("first", 1));
        history.push(Message::assistant("", vec![call("c1"), call("c2")], 1));
        history.push(Message::tool("r1", "c1", "read_file", 1));
        history.push(Message::tool("r2", "c2", "read_file", 1));
        history.push(Message::user("second", 2));
        history.push(Message::assistant("done", vec![], 2));

        // The whole first unit (user + assistant + its two tool results)
        // must have been dropped together.
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages[0].content, "second");

        for (idx, message) in history.messages.iter().enumerate() {
            if message.role == MessageRole::Tool {
                let id = message.tool_call_id.as_deref().unwrap();
                let paired = history.messages[..idx].iter().any(|m| {
                    m.role == MessageRole::Assistant
                        && m.tool_calls.iter().any(|tc| tc.id == id)
                });
                assert!(paired, "tool message {id} lost its assistant pair");
            }
        }
    }

    #[test]
    fn projection_abbreviates_file_results_from_earlier_turns() {
        let mut history = ConversationHistory::new(50);
        history.push(Message::assistant("", vec![call("c1")], 1));
        history.push(
            Message::tool("the whole file body", "c1", "read_file", 1)
                .with_file_ref("strategy/rsi.py"),
        );

        // Same turn: full content goes to the model.
        let same_turn = history.to_llm(1);
        assert_eq!(same_turn[1].content, "the whole file body");

        // Later turn: abbreviated pointer.
        let later = history.to_llm(2);
        assert!(later[1].content.contains("strategy/rsi.py"));
        assert!(later[1].content.contains("focused_files"));
        assert_eq!(later[1].role, Role::Tool);
    }

    #[test]
    fn recent_projection_never_opens_on_orphan_tool_message() {
        let mut history = ConversationHistory::new(50);
        history.push(Message::user("q", 1));
        history.push(Message::assistant("", vec![call("c1")], 1));
        history.push(Message::tool("r1", "c1", "read_file", 1));
        history.push(Message::assistant("done", vec![], 1));

        let projected = history.project_recent(2, 1);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].content, "done");
    }

    #[test]
    fn projection_truncates_long_shell_output() {
        let mut history = ConversationHistory::new(50);
        history.push(Message::assistant("", vec![call("c1")], 1));
        history.push(Message::tool("x".repeat(5_000), "c1", "shell_exec", 1));

        let projected = history.to_llm(1);
        assert!(projected[1].content.len() < 2_200);
        assert!(projected[1].content.contains("truncated"));
    }

    #[test]
    fn focused_files_respect_char_cap_with_lru_eviction() {
        let mut ctx = CodeContext::new("/ws", 1_000);
        ctx.insert_file("a.py", &"a".repeat(400), false);
        ctx.insert_file("b.py", &"b".repeat(400), false);
        ctx.touch("a.py");
        ctx.insert_file("c.py", &"c".repeat(400), false);

        assert!(ctx.total_chars() <= 1_000);
        // b was least recently accessed and not editing, so it went first.
        assert!(!ctx.is_focused("b.py"));
        assert!(ctx.is_focused("a.py"));
        assert!(ctx.is_focused("c.py"));
    }

    #[test]
    fn editing_entries_survive_eviction() {
        let mut ctx = CodeContext::new("/ws", 1_000);
        ctx.insert_file("editing.py", &"e".repeat(600), true);
        ctx.insert_file("reading.py", &"r".repeat(600), false);

        assert!(ctx.is_focused("editing.py"));
        assert!(!ctx.is_focused("reading.py"));
    }

    #[test]
    fn agent_context_round_trips_through_serde() {
        let mut ctx = AgentContext::new("sess-1", "proj-1", "/ws");
        ctx.task = Some("rework the strategy".to_string());
        ctx.conversation.push(Message::user("hello", 1));
        ctx.conversation
            .push(Message::assistant("hi", vec![], 1));
        ctx.code_context
            .insert_file("main.py", "print('x')\n", true);
        ctx.code_context
            .symbol_index
            .index_file("main.py", "def main():\n    pass\n");
        ctx.memory.add_decision("used RSI", "user asked for it");
        ctx.plan = Some(
            Plan::new(
                "demo",
                vec![crate::plan::PlanStepInput {
                    description: "write".to_string(),
                    expected_outcome: None,
                    tools_needed: vec![],
                }],
            )
            .unwrap(),
        );

        let encoded = serde_json::to_string(&ctx).unwrap();
        let decoded: AgentContext = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.session_id, ctx.session_id);
        assert_eq!(decoded.conversation.len(), ctx.conversation.len());
        assert_eq!(
            decoded.conversation.to_llm(2).len(),
            ctx.conversation.to_llm(2).len()
        );
        assert_eq!(decoded.code_context.focused_paths(), ctx.code_context.focused_paths());
        assert_eq!(
            decoded.code_context.symbol_index.snapshot(),
            ctx.code_context.symbol_index.snapshot()
        );
        assert_eq!(
            decoded.plan.as_ref().unwrap().status,
            ctx.plan.as_ref().unwrap().status
        );
        assert_eq!(decoded.memory.decisions.len(), 1);
    }
}
