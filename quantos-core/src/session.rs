use crate::agent::PlanExecuteAgent;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct SessionEntry {
    agent: Arc<Mutex<PlanExecuteAgent>>,
    cancel: CancellationToken,
    last_active: Instant,
}

/// Owns the live agents, keyed by session id. An agent survives across
/// requests for the lifetime of its session; idle sessions are evicted by
/// the sweep. Operations within one session are serialized by the agent's
/// mutex; distinct sessions run concurrently.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Register a session. The builder receives the session's cancel token
    /// so the agent and the registry share it.
    pub fn open<F>(&self, session_id: &str, build: F) -> Arc<Mutex<PlanExecuteAgent>>
    where
        F: FnOnce(CancellationToken) -> PlanExecuteAgent,
    {
        let cancel = CancellationToken::new();
        let agent = Arc::new(Mutex::new(build(cancel.clone())));
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                agent: agent.clone(),
                cancel,
                last_active: Instant::now(),
            },
        );
        tracing::info!(session_id, "session opened");
        agent
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<PlanExecuteAgent>>> {
        let mut entry = self.sessions.get_mut(session_id)?;
        entry.last_active = Instant::now();
        Some(entry.agent.clone())
    }

    /// Post a cancel signal to a session's in-flight work.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(session_id, "session cancelled");
                true
            }
            None => false,
        }
    }

    pub fn close(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                tracing::info!(session_id, "session closed");
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle past the timeout; returns how many went.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.idle_timeout;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_active.elapsed() > cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &stale {
            if let Some((_, entry)) = self.sessions.remove(session_id) {
                entry.cancel.cancel();
                tracing::info!(session_id = %session_id, "idle session evicted");
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use crate::events::EventBus;
    use crate::prompts::PromptTemplates;
    use quantos_llm::ScriptedClient;
    use quantos_tools::ToolRegistry;

    fn build_agent(cancel: CancellationToken) -> PlanExecuteAgent {
        PlanExecuteAgent::new(
            AgentContext::new("s", "p", "/tmp/ws"),
            Arc::new(ScriptedClient::new(vec![])),
            Arc::new(ToolRegistry::new()),
            PromptTemplates::default(),
            crate::agent::AgentConfig::default(),
            EventBus::new(64).sink(),
            cancel,
        )
    }

    #[tokio::test]
    async fn open_get_close_lifecycle() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        registry.open("sess-1", build_agent);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("sess-1").is_some());
        assert!(registry.close("sess-1"));
        assert!(registry.get("sess-1").is_none());
        assert!(!registry.close("sess-1"));
    }

    #[tokio::test]
    async fn cancel_reaches_the_session_token() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let agent = registry.open("sess-1", build_agent);
        let token = agent.lock().await.cancel_token();
        assert!(!token.is_cancelled());
        assert!(registry.cancel("sess-1"));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let registry = SessionRegistry::new(Duration::from_millis(10));
        registry.open("sess-1", build_agent);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }
}
