//! Trading rules: the persisted strategy specification plus live runtime
//! status, the store seam, and the collector's `save_rule` tool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quantos_tools::{Side, Tool, ToolErrorKind, ToolResult, ToolSpec};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    Contract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingRequirements {
    pub market: MarketKind,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub entry_rules: String,
    pub take_profit: String,
    pub stop_loss: String,
    pub max_position_ratio: f64,
    pub total_capital: f64,
}

fn default_exchange() -> String {
    "Binance".to_string()
}

impl TradingRequirements {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("at least one symbol is required");
        }
        if self.timeframe.trim().is_empty() {
            anyhow::bail!("timeframe must not be empty");
        }
        if self.entry_rules.trim().is_empty() {
            anyhow::bail!("entry_rules must not be empty");
        }
        if !(0.0..=1.0).contains(&self.max_position_ratio) || self.max_position_ratio == 0.0 {
            anyhow::bail!("max_position_ratio must be in (0, 1]");
        }
        if self.total_capital <= 0.0 {
            anyhow::bail!("total_capital must be positive");
        }
        Ok(())
    }
}

/// Live position state. For spot, `position_side` stays `None` and
/// `quantity >= 0`; `is_holding` flips always pair the entry price and
/// quantity with their nulled counterparts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub is_holding: bool,
    pub entry_price: Option<f64>,
    pub quantity: f64,
    pub position_side: Option<PositionSide>,
    pub position_value: f64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleActivity {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleState {
    pub rule_id: u64,
    pub requirements: TradingRequirements,
    pub runtime_status: RuntimeStatus,
    pub active: RuleActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub rule_id: u64,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub status: String,
    pub pnl: f64,
    pub created_at: DateTime<Utc>,
}

/// Persistence boundary for rules and their order history. The relational
/// store behind the edge implements this; the in-memory variant backs tests
/// and development.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn save_rule(&self, requirements: TradingRequirements) -> anyhow::Result<u64>;
    async fn get_rule(&self, rule_id: u64) -> anyhow::Result<Option<RuleState>>;
    async fn list_rules(&self) -> anyhow::Result<Vec<RuleState>>;
    async fn update_runtime_status(
        &self,
        rule_id: u64,
        status: RuntimeStatus,
    ) -> anyhow::Result<()>;
    async fn set_active(&self, rule_id: u64, active: RuleActivity) -> anyhow::Result<()>;
    async fn record_order(&self, order: Order) -> anyhow::Result<()>;
    async fn orders(&self, rule_id: u64) -> anyhow::Result<Vec<Order>>;
}

pub struct MemoryRuleStore {
    rules: DashMap<u64, RuleState>,
    orders: Mutex<Vec<Order>>,
    next_id: AtomicU64,
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            orders: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn save_rule(&self, requirements: TradingRequirements) -> anyhow::Result<u64> {
        requirements.validate()?;
        let rule_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rules.insert(
            rule_id,
            RuleState {
                rule_id,
                requirements,
                runtime_status: RuntimeStatus::default(),
                active: RuleActivity::Stopped,
            },
        );
        tracing::info!(rule_id, "rule saved");
        Ok(rule_id)
    }

    async fn get_rule(&self, rule_id: u64) -> anyhow::Result<Option<RuleState>> {
        Ok(self.rules.get(&rule_id).map(|r| r.clone()))
    }

    async fn list_rules(&self) -> anyhow::Result<Vec<RuleState>> {
        let mut rules: Vec<RuleState> = self.rules.iter().map(|r| r.clone()).collect();
        rules.sort_by_key(|r| r.rule_id);
        Ok(rules)
    }

    async fn update_runtime_status(
        &self,
        rule_id: u64,
        status: RuntimeStatus,
    ) -> anyhow::Result<()> {
        let mut rule = self
            .rules
            .get_mut(&rule_id)
            .ok_or_else(|| anyhow::anyhow!("rule not found: {rule_id}"))?;
        rule.runtime_status = status;
        Ok(())
    }

    async fn set_active(&self, rule_id: u64, active: RuleActivity) -> anyhow::Result<()> {
        let mut rule = self
            .rules
            .get_mut(&rule_id)
            .ok_or_else(|| anyhow::anyhow!("rule not found: {rule_id}"))?;
        rule.active = active;
        Ok(())
    }

    async fn record_order(&self, order: Order) -> anyhow::Result<()> {
        self.orders.lock().await.push(order);
        Ok(())
    }

    async fn orders(&self, rule_id: u64) -> anyhow::Result<Vec<Order>> {
        Ok(self
            .orders
            .lock()
            .await
            .iter()
            .filter(|o| o.rule_id == rule_id)
            .cloned()
            .collect())
    }
}

/// The collector agent persists an elicited strategy through this tool.
pub struct SaveRuleTool {
    store: Arc<dyn RuleStore>,
}

impl SaveRuleTool {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveRuleTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_rule".to_string(),
            description: "Persist a fully specified trading strategy once every required \
                          field has been collected from the user."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "market": { "type": "string" },
                    "exchange": { "type": "string" },
                    "symbols": { "type": "array" },
                    "timeframe": { "type": "string" },
                    "entry_rules": { "type": "string" },
                    "take_profit": { "type": "string" },
                    "stop_loss": { "type": "string" },
                    "max_position_ratio": { "type": "number" },
                    "total_capital": { "type": "number" }
                },
                "required": [
                    "market", "symbols", "timeframe", "entry_rules",
                    "take_profit", "stop_loss", "max_position_ratio", "total_capital"
                ]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolResult {
        let requirements: TradingRequirements = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => {
                return ToolResult::fail(
                    ToolErrorKind::InvalidArguments,
                    format!("rule payload is malformed: {e}"),
                );
            }
        };
        if let Err(e) = requirements.validate() {
            return ToolResult::fail(ToolErrorKind::InvalidArguments, e.to_string());
        }
        match self.store.save_rule(requirements).await {
            Ok(rule_id) => ToolResult::ok_with_data(
                format!("rule saved with id {rule_id}"),
                serde_json::json!({ "rule_id": rule_id }),
            ),
            Err(e) => ToolResult::fail(ToolErrorKind::ExecutionFailed, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements() -> TradingRequirements {
        TradingRequirements {
            market: MarketKind::Spot,
            exchange: "Binance".to_string(),
            symbols: vec!["BTC/USDT".to_string()],
            timeframe: "1d".to_string(),
            entry_rules: "RSI(14) < 20".to_string(),
            take_profit: "RSI(14) > 60".to_string(),
            stop_loss: "drop more than 5% from entry".to_string(),
            max_position_ratio: 0.1,
            total_capital: 10_000.0,
        }
    }

    #[tokio::test]
    async fn store_round_trips_a_rule() {
        let store = MemoryRuleStore::new();
        let rule_id = store.save_rule(requirements()).await.unwrap();
        let rule = store.get_rule(rule_id).await.unwrap().unwrap();
        assert_eq!(rule.requirements.entry_rules, "RSI(14) < 20");
        assert!(!rule.runtime_status.is_holding);
        assert_eq!(rule.active, RuleActivity::Stopped);
    }

    #[tokio::test]
    async fn validation_rejects_bad_position_ratio() {
        let store = MemoryRuleStore::new();
        let mut bad = requirements();
        bad.max_position_ratio = 1.5;
        assert!(store.save_rule(bad).await.is_err());
    }

    #[tokio::test]
    async fn save_rule_tool_persists_payload() {
        let store = Arc::new(MemoryRuleStore::new());
        let tool = SaveRuleTool::new(store.clone());
        let out = tool
            .execute(serde_json::json!({
                "market": "spot",
                "symbols": ["BTC/USDT"],
                "timeframe": "1d",
                "entry_rules": "buy when RSI(14) < 20",
                "take_profit": "sell when RSI(14) > 60",
                "stop_loss": "5% below entry",
                "max_position_ratio": 0.1,
                "total_capital": 10000.0
            }))
            .await;
        assert!(out.success, "{:?}", out.error);

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].requirements.entry_rules.contains("RSI(14) < 20"));
        assert!(rules[0].requirements.take_profit.contains("RSI(14) > 60"));
    }

    #[tokio::test]
    async fn save_rule_tool_rejects_missing_fields() {
        let tool = SaveRuleTool::new(Arc::new(MemoryRuleStore::new()));
        let out = tool
            .execute(serde_json::json!({ "market": "spot", "symbols": ["BTC/USDT"] }))
            .await;
        assert!(!out.success);
        assert_eq!(out.error_kind, Some(ToolErrorKind::InvalidArguments));
    }
}
