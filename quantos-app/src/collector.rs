//! The rule collector: a conversational host over the orchestration core
//! that elicits a complete strategy and persists it through `save_rule`.

use crate::rules::{RuleStore, SaveRuleTool};
use quantos_core::{
    AgentConfig, AgentContext, EventBus, EventFrame, PlanExecuteAgent, PromptTemplates,
};
use quantos_llm::ChatClient;
use quantos_tools::ToolRegistry;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const COLLECTOR_SYSTEM_PROMPT: &str = "You are a quantitative strategy collector. Through \
dialogue, gather every field of a complete trading strategy: market (spot or contract), \
symbols, timeframe, entry rules, take profit, stop loss, max position ratio and total \
capital. Ask for what is missing, one or two questions at a time. Once every field is \
known, call save_rule exactly once and confirm the saved rule to the user.";

pub struct RuleCollector {
    agent: PlanExecuteAgent,
}

impl RuleCollector {
    /// Build a collector session. Returns the host plus the event stream the
    /// edge forwards to the client.
    pub fn new(
        session_id: &str,
        llm: Arc<dyn ChatClient>,
        store: Arc<dyn RuleStore>,
        cancel: CancellationToken,
    ) -> (Self, UnboundedReceiver<EventFrame>) {
        let registry = ToolRegistry::new().with(Arc::new(SaveRuleTool::new(store)));

        let templates = PromptTemplates {
            system_prompt: COLLECTOR_SYSTEM_PROMPT.to_string(),
            mode_guidance: String::new(),
            ..PromptTemplates::default()
        };

        let bus = EventBus::new(512);
        let events = bus.subscribe();
        let agent = PlanExecuteAgent::new(
            AgentContext::new(session_id, "rule-collector", "."),
            llm,
            Arc::new(registry),
            templates,
            AgentConfig::default(),
            bus.sink(),
            cancel,
        )
        .with_project_name("rule-collector");

        (Self { agent }, events)
    }

    pub async fn chat(&mut self, user_input: &str) -> anyhow::Result<()> {
        self.agent
            .chat(user_input)
            .await
            .map_err(|e| anyhow::anyhow!("collector turn failed: {e}"))
    }

    pub fn context(&self) -> &quantos_core::AgentContext {
        self.agent.context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MemoryRuleStore;
    use quantos_llm::ScriptedClient;
    use serde_json::json;

    #[tokio::test]
    async fn collector_elicits_and_saves_a_rule() {
        let store = Arc::new(MemoryRuleStore::new());
        let llm = Arc::new(ScriptedClient::new(vec![
            // Turn 1: the collector asks for the missing capital field.
            ScriptedClient::text(
                "明白了：RSI<20 买入，RSI>60 卖出，BTC/USDT 日线。请问总资金和单次最大仓位比例是多少？",
            ),
            // Turn 2: everything known, save the rule.
            ScriptedClient::tool_calls(
                "",
                vec![(
                    "c1",
                    "save_rule",
                    json!({
                        "market": "spot",
                        "symbols": ["BTC/USDT"],
                        "timeframe": "1d",
                        "entry_rules": "buy when RSI(14) < 20",
                        "take_profit": "sell when RSI(14) > 60",
                        "stop_loss": "exit if price drops 5% below entry",
                        "max_position_ratio": 0.1,
                        "total_capital": 10000.0
                    }),
                )],
            ),
            ScriptedClient::text("策略已保存：RSI<20 买入，RSI>60 卖出。"),
        ]));

        let (mut collector, _events) =
            RuleCollector::new("sess-collect", llm, store.clone(), CancellationToken::new());

        collector
            .chat("我想用RSI<20买入，RSI>60卖出，BTC/USDT 日线")
            .await
            .unwrap();
        assert!(store.list_rules().await.unwrap().is_empty());

        collector.chat("总资金1万U，每次最多10%").await.unwrap();
        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].requirements.entry_rules.contains("RSI(14) < 20"));
        assert!(rules[0].requirements.take_profit.contains("RSI(14) > 60"));
        assert_eq!(rules[0].requirements.symbols, vec!["BTC/USDT"]);
        assert_eq!(rules[0].requirements.timeframe, "1d");
    }
}
