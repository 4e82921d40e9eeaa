//! The rule executor: one cooperative loop per running rule, each cycle a
//! one-shot agent run whose terminal reply is parsed into a trading
//! decision and applied under spot/contract position semantics.

use crate::rules::{
    MarketKind, Order, PositionSide, RuleActivity, RuleState, RuleStore, RuntimeStatus,
    TradingRequirements,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quantos_core::{
    AgentConfig, AgentContext, EventBus, MessageRole, PlanExecuteAgent, PromptTemplates,
};
use quantos_llm::ChatClient;
use quantos_tools::{
    CalculateIndicatorTool, GetKlinesTool, Kline, MarketData, OrderGateway, OrderType,
    PlaceOrderTool, Side, ToolRegistry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Buy,
    Sell,
    Hold,
}

/// The fixed shape of the model's terminal reply. Anything richer must be
/// emitted as status events during the run, not in the terminal reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl Decision {
    fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Hold,
            reason: reason.into(),
            confidence: 0.0,
        }
    }
}

/// Parse the terminal assistant reply. Markdown fences are stripped; a
/// reply that does not parse is a hold.
pub fn parse_decision(reply: &str) -> Decision {
    let trimmed = reply.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            tracing::warn!(reply_len = trimmed.len(), "decision reply has no JSON object");
            return Decision::hold("no JSON object in reply");
        }
    };
    match serde_json::from_str::<Decision>(candidate) {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(error = %e, "decision reply failed to parse, holding");
            Decision::hold(format!("unparseable reply: {e}"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub side: Side,
    pub quantity: f64,
    pub pnl: f64,
}

/// Apply a decision to the live position state. Returns the accepted order
/// intent, or `None` when position state forbids the action. Pure apart
/// from the status mutation, so the invariants are testable in isolation.
pub fn apply_decision(
    requirements: &TradingRequirements,
    status: &mut RuntimeStatus,
    action: DecisionAction,
    price: f64,
    now: DateTime<Utc>,
) -> Option<OrderIntent> {
    if price <= 0.0 {
        return None;
    }
    let open_quantity = (requirements.total_capital * requirements.max_position_ratio / price)
        .floor();

    match (requirements.market, action) {
        (_, DecisionAction::Hold) => None,

        (MarketKind::Spot, DecisionAction::Buy) => {
            if status.is_holding || open_quantity <= 0.0 {
                return None;
            }
            status.is_holding = true;
            status.entry_price = Some(price);
            status.quantity = open_quantity;
            status.position_side = None;
            status.position_value = open_quantity * price;
            status.last_update = Some(now);
            Some(OrderIntent {
                side: Side::Buy,
                quantity: open_quantity,
                pnl: 0.0,
            })
        }

        (MarketKind::Spot, DecisionAction::Sell) => {
            if !status.is_holding {
                return None;
            }
            let quantity = status.quantity;
            let pnl = status
                .entry_price
                .map(|entry| (price - entry) * quantity)
                .unwrap_or(0.0);
            clear_position(status, now);
            Some(OrderIntent {
                side: Side::Sell,
                quantity,
                pnl,
            })
        }

        (MarketKind::Contract, DecisionAction::Buy) => {
            if !status.is_holding {
                if open_quantity <= 0.0 {
                    return None;
                }
                open_position(status, PositionSide::Long, open_quantity, price, now);
                Some(OrderIntent {
                    side: Side::Buy,
                    quantity: open_quantity,
                    pnl: 0.0,
                })
            } else if status.position_side == Some(PositionSide::Short) {
                let quantity = status.quantity;
                let pnl = status
                    .entry_price
                    .map(|entry| (entry - price) * quantity)
                    .unwrap_or(0.0);
                clear_position(status, now);
                Some(OrderIntent {
                    side: Side::Buy,
                    quantity,
                    pnl,
                })
            } else {
                None
            }
        }

        (MarketKind::Contract, DecisionAction::Sell) => {
            if !status.is_holding {
                if open_quantity <= 0.0 {
                    return None;
                }
                open_position(status, PositionSide::Short, open_quantity, price, now);
                Some(OrderIntent {
                    side: Side::Sell,
                    quantity: open_quantity,
                    pnl: 0.0,
                })
            } else if status.position_side == Some(PositionSide::Long) {
                let quantity = status.quantity;
                let pnl = status
                    .entry_price
                    .map(|entry| (price - entry) * quantity)
                    .unwrap_or(0.0);
                clear_position(status, now);
                Some(OrderIntent {
                    side: Side::Sell,
                    quantity,
                    pnl,
                })
            } else {
                None
            }
        }
    }
}

fn open_position(
    status: &mut RuntimeStatus,
    side: PositionSide,
    quantity: f64,
    price: f64,
    now: DateTime<Utc>,
) {
    status.is_holding = true;
    status.entry_price = Some(price);
    status.quantity = quantity;
    status.position_side = Some(side);
    status.position_value = quantity * price;
    status.last_update = Some(now);
}

fn clear_position(status: &mut RuntimeStatus, now: DateTime<Utc>) {
    status.is_holding = false;
    status.entry_price = None;
    status.quantity = 0.0;
    status.position_side = None;
    status.position_value = 0.0;
    status.last_update = Some(now);
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Poll interval for rules whose timeframe has no mapping of its own.
    pub default_poll: Duration,
    /// Forces every rule onto one interval when set; used for fast
    /// re-checks and tests.
    pub poll_override: Option<Duration>,
    pub decision_max_iterations: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_poll: Duration::from_secs(60),
            poll_override: None,
            decision_max_iterations: 10,
        }
    }
}

/// Runs every active rule on its own cooperative loop. State mutations for
/// one rule are serialized by its loop; distinct rules run in parallel.
pub struct RuleExecutor {
    store: Arc<dyn RuleStore>,
    market: Arc<dyn MarketData>,
    gateway: Arc<dyn OrderGateway>,
    llm: Arc<dyn ChatClient>,
    config: ExecutorConfig,
    running: DashMap<u64, CancellationToken>,
    shutdown: CancellationToken,
}

impl RuleExecutor {
    pub fn new(
        store: Arc<dyn RuleStore>,
        market: Arc<dyn MarketData>,
        gateway: Arc<dyn OrderGateway>,
        llm: Arc<dyn ChatClient>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            market,
            gateway,
            llm,
            config,
            running: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_running(&self, rule_id: u64) -> bool {
        self.running.contains_key(&rule_id)
    }

    /// Start the evaluation loop for a rule. Returns false when it was
    /// already running.
    pub async fn start_rule(self: &Arc<Self>, rule_id: u64) -> anyhow::Result<bool> {
        if self.running.contains_key(&rule_id) {
            return Ok(false);
        }
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("rule not found: {rule_id}"))?;
        self.store.set_active(rule_id, RuleActivity::Running).await?;

        let token = self.shutdown.child_token();
        self.running.insert(rule_id, token.clone());
        let interval = self.config.poll_override.unwrap_or_else(|| {
            poll_interval(&rule.requirements.timeframe).unwrap_or(self.config.default_poll)
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(rule_id, interval_secs = interval.as_secs(), "rule loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = this.evaluate_rule(rule_id, &token).await {
                    tracing::error!(rule_id, error = %e, "rule evaluation failed");
                }
            }
            this.running.remove(&rule_id);
            tracing::info!(rule_id, "rule loop exited");
        });
        Ok(true)
    }

    /// Cooperative stop: the loop observes the signal and exits after its
    /// current iteration.
    pub async fn stop_rule(&self, rule_id: u64) -> anyhow::Result<bool> {
        let Some(entry) = self.running.get(&rule_id) else {
            return Ok(false);
        };
        entry.cancel();
        drop(entry);
        self.store.set_active(rule_id, RuleActivity::Stopped).await?;
        Ok(true)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// One evaluation cycle for every symbol of a rule. Public so the edge
    /// can trigger an immediate re-check and tests can drive cycles.
    pub async fn evaluate_rule(&self, rule_id: u64, cancel: &CancellationToken) -> anyhow::Result<()> {
        let rule = self
            .store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("rule not found: {rule_id}"))?;
        let symbols = rule.requirements.symbols.clone();

        for symbol in &symbols {
            if cancel.is_cancelled() {
                break;
            }
            // Refetch so multi-symbol rules see the status the previous
            // symbol left behind.
            let Some(rule) = self.store.get_rule(rule_id).await? else {
                break;
            };
            if let Err(e) = self.evaluate_symbol(&rule, symbol, cancel).await {
                tracing::error!(rule_id, symbol = %symbol, error = %e, "symbol evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_symbol(
        &self,
        rule: &RuleState,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let requirements = &rule.requirements;
        let klines = self
            .market
            .get_klines(&requirements.exchange, symbol, &requirements.timeframe, 100)
            .await
            .map_err(|e| anyhow::anyhow!("kline fetch failed: {e}"))?;
        let Some(price) = klines.last().map(|k| k.close) else {
            tracing::warn!(rule_id = rule.rule_id, symbol, "no klines, skipping cycle");
            return Ok(());
        };

        let decision = self.decide(rule, symbol, &klines, price, cancel).await;
        tracing::info!(
            rule_id = rule.rule_id,
            symbol,
            action = ?decision.action,
            confidence = decision.confidence,
            reason = %decision.reason,
            "decision"
        );

        let mut status = rule.runtime_status.clone();
        let Some(intent) =
            apply_decision(requirements, &mut status, decision.action, price, Utc::now())
        else {
            if decision.action != DecisionAction::Hold {
                tracing::info!(
                    rule_id = rule.rule_id,
                    symbol,
                    action = ?decision.action,
                    "decision rejected by position state"
                );
            }
            return Ok(());
        };

        let receipt = self
            .gateway
            .place_order(
                &requirements.exchange,
                symbol,
                intent.side,
                OrderType::Market,
                intent.quantity,
                Some(price),
            )
            .await
            .map_err(|e| anyhow::anyhow!("order placement failed: {e}"))?;

        self.store
            .record_order(Order {
                rule_id: rule.rule_id,
                symbol: symbol.to_string(),
                side: receipt.side,
                price: receipt.price,
                amount: receipt.quantity,
                status: "filled".to_string(),
                pnl: intent.pnl,
                created_at: Utc::now(),
            })
            .await?;
        self.store
            .update_runtime_status(rule.rule_id, status)
            .await?;
        Ok(())
    }

    /// One-shot agent run: Direct mode, domain tools only, terminal reply
    /// parsed as the decision.
    async fn decide(
        &self,
        rule: &RuleState,
        symbol: &str,
        klines: &[Kline],
        price: f64,
        cancel: &CancellationToken,
    ) -> Decision {
        let registry = ToolRegistry::new()
            .with(Arc::new(GetKlinesTool::new(self.market.clone())))
            .with(Arc::new(CalculateIndicatorTool))
            .with(Arc::new(PlaceOrderTool::new(self.gateway.clone())));

        let bus = EventBus::new(256);
        let ctx = AgentContext::new(
            format!("rule-{}-{symbol}", rule.rule_id),
            format!("rule-{}", rule.rule_id),
            ".",
        );
        let config = AgentConfig {
            max_iterations: self.config.decision_max_iterations,
            ..AgentConfig::default()
        };
        let mut agent = PlanExecuteAgent::new(
            ctx,
            self.llm.clone(),
            Arc::new(registry),
            PromptTemplates::default(),
            config,
            bus.sink(),
            cancel.child_token(),
        );

        let brief = decision_brief(rule, symbol, klines, price);
        if let Err(e) = agent.chat(&brief).await {
            tracing::warn!(rule_id = rule.rule_id, error = %e, "decision run failed, holding");
            return Decision::hold(format!("agent run failed: {e}"));
        }

        let reply = agent
            .context()
            .conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.tool_calls.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        parse_decision(&reply)
    }
}

fn decision_brief(rule: &RuleState, symbol: &str, klines: &[Kline], price: f64) -> String {
    let status = &rule.runtime_status;
    let pnl_line = match (status.is_holding, status.entry_price) {
        (true, Some(entry)) if entry > 0.0 => {
            format!("{:.2}%", (price - entry) / entry * 100.0)
        }
        _ => "n/a".to_string(),
    };
    let closes: Vec<f64> = klines.iter().rev().take(10).rev().map(|k| k.close).collect();
    let requirements_json = serde_json::to_string_pretty(&rule.requirements)
        .unwrap_or_else(|_| "{}".to_string());
    let status_side = status
        .position_side
        .map(|s| format!("{s:?}").to_lowercase())
        .unwrap_or_else(|| "none".to_string());

    format!(
        "Evaluate the trading strategy for {symbol}.\n\n\
Position state:\n\
- holding: {}\n\
- position side: {status_side}\n\
- entry price: {}\n\
- current price: {price}\n\
- unrealized pnl: {pnl_line}\n\n\
Strategy:\n{requirements_json}\n\n\
Recent closes: {closes:?}\n\n\
If flat, check the entry rules. If holding, check take profit and stop \
loss. Use get_klines or calculate_indicator when you need more data. \
Finish with ONLY a JSON object:\n\
{{\"action\": \"buy\" | \"sell\" | \"hold\", \"reason\": \"...\", \"confidence\": 0.0}}",
        if status.is_holding { "yes" } else { "no" },
        status
            .entry_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "n/a".to_string()),
    )
}

fn poll_interval(timeframe: &str) -> Option<Duration> {
    let secs = match timeframe.trim().to_ascii_lowercase().as_str() {
        "1m" => 60,
        "5m" => 5 * 60,
        "15m" => 15 * 60,
        "30m" => 30 * 60,
        "1h" => 60 * 60,
        "4h" => 4 * 60 * 60,
        "1d" => 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{PaperOrderGateway, ScriptedMarketData};
    use crate::rules::MemoryRuleStore;
    use quantos_llm::ScriptedClient;

    fn requirements(market: MarketKind) -> TradingRequirements {
        TradingRequirements {
            market,
            exchange: "Binance".to_string(),
            symbols: vec!["BTC/USDT".to_string()],
            timeframe: "1d".to_string(),
            entry_rules: "buy when RSI(14) < 20".to_string(),
            take_profit: "sell when RSI(14) > 60".to_string(),
            stop_loss: "5% below entry".to_string(),
            max_position_ratio: 0.1,
            total_capital: 10_000.0,
        }
    }

    #[test]
    fn poll_interval_maps_known_timeframes_only() {
        assert_eq!(poll_interval("1m"), Some(Duration::from_secs(60)));
        assert_eq!(poll_interval("1d"), Some(Duration::from_secs(24 * 60 * 60)));
        assert_eq!(poll_interval("3w"), None);
    }

    #[test]
    fn unknown_timeframe_falls_back_to_configured_default() {
        let config = ExecutorConfig {
            default_poll: Duration::from_secs(120),
            ..ExecutorConfig::default()
        };
        let interval = config
            .poll_override
            .unwrap_or_else(|| poll_interval("3w").unwrap_or(config.default_poll));
        assert_eq!(interval, Duration::from_secs(120));
    }

    #[test]
    fn parse_decision_accepts_plain_and_fenced_json() {
        let plain = parse_decision(r#"{"action": "buy", "reason": "rsi low", "confidence": 0.9}"#);
        assert_eq!(plain.action, DecisionAction::Buy);
        assert_eq!(plain.confidence, 0.9);

        let fenced = parse_decision(
            "Here is my decision:\n```json\n{\"action\": \"sell\", \"reason\": \"tp hit\"}\n```",
        );
        assert_eq!(fenced.action, DecisionAction::Sell);
        assert_eq!(fenced.confidence, 0.5);
    }

    #[test]
    fn parse_decision_treats_garbage_as_hold() {
        let decision = parse_decision("I think we should probably wait and see.");
        assert_eq!(decision.action, DecisionAction::Hold);

        let decision = parse_decision(r#"{"action": "yolo"}"#);
        assert_eq!(decision.action, DecisionAction::Hold);
    }

    #[test]
    fn spot_buy_requires_flat_and_sell_requires_holding() {
        let req = requirements(MarketKind::Spot);
        let mut status = RuntimeStatus::default();
        let now = Utc::now();

        assert!(apply_decision(&req, &mut status, DecisionAction::Sell, 10.0, now).is_none());

        let buy = apply_decision(&req, &mut status, DecisionAction::Buy, 10.0, now).unwrap();
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.quantity, 100.0);
        assert!(status.is_holding);
        assert_eq!(status.entry_price, Some(10.0));
        assert_eq!(status.position_side, None);

        // A second buy while holding is rejected.
        assert!(apply_decision(&req, &mut status, DecisionAction::Buy, 9.0, now).is_none());

        let sell = apply_decision(&req, &mut status, DecisionAction::Sell, 12.0, now).unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.quantity, 100.0);
        assert_eq!(sell.pnl, 200.0);
        assert!(!status.is_holding);
        assert_eq!(status.entry_price, None);
        assert_eq!(status.quantity, 0.0);
    }

    #[test]
    fn spot_accepted_orders_alternate_sides() {
        let req = requirements(MarketKind::Spot);
        let mut status = RuntimeStatus::default();
        let now = Utc::now();
        let script = [
            DecisionAction::Buy,
            DecisionAction::Buy,
            DecisionAction::Sell,
            DecisionAction::Sell,
            DecisionAction::Buy,
            DecisionAction::Hold,
            DecisionAction::Sell,
        ];

        let mut accepted = Vec::new();
        for action in script {
            if let Some(intent) = apply_decision(&req, &mut status, action, 10.0, now) {
                accepted.push(intent.side);
            }
        }
        assert_eq!(accepted, vec![Side::Buy, Side::Sell, Side::Buy, Side::Sell]);
        for pair in accepted.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn contract_opens_and_closes_form_brackets() {
        let req = requirements(MarketKind::Contract);
        let mut status = RuntimeStatus::default();
        let now = Utc::now();

        // Sell while flat opens a short.
        let open = apply_decision(&req, &mut status, DecisionAction::Sell, 10.0, now).unwrap();
        assert_eq!(open.side, Side::Sell);
        assert_eq!(status.position_side, Some(PositionSide::Short));

        // Another sell while short is a no-op.
        assert!(apply_decision(&req, &mut status, DecisionAction::Sell, 9.0, now).is_none());

        // Buy closes the short at a profit.
        let close = apply_decision(&req, &mut status, DecisionAction::Buy, 8.0, now).unwrap();
        assert_eq!(close.side, Side::Buy);
        assert_eq!(close.pnl, 200.0);
        assert!(!status.is_holding);
        assert_eq!(status.position_side, None);

        // Buy while flat opens a long; sell closes it.
        apply_decision(&req, &mut status, DecisionAction::Buy, 10.0, now).unwrap();
        assert_eq!(status.position_side, Some(PositionSide::Long));
        let close = apply_decision(&req, &mut status, DecisionAction::Sell, 11.0, now).unwrap();
        assert_eq!(close.pnl, 100.0);
        assert_eq!(status.position_side, None);
    }

    fn descending_then_ascending() -> (Vec<Kline>, Vec<Kline>) {
        let descending: Vec<f64> = (0..30).map(|i| 20.0 - i as f64 * 0.4).collect();
        let ascending: Vec<f64> = (0..30).map(|i| 8.0 + i as f64 * 0.4).collect();
        (
            ScriptedMarketData::closes_to_klines(&descending),
            ScriptedMarketData::closes_to_klines(&ascending),
        )
    }

    #[tokio::test]
    async fn spot_rule_buys_then_sells_over_two_cycles() {
        let store = Arc::new(MemoryRuleStore::new());
        let rule_id = store.save_rule(requirements(MarketKind::Spot)).await.unwrap();

        let (falling, rising) = descending_then_ascending();
        let market = Arc::new(ScriptedMarketData::new(vec![falling, rising]));
        let llm = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::text(
                r#"{"action": "buy", "reason": "RSI at 15, entry rule met", "confidence": 0.9}"#,
            ),
            ScriptedClient::text(
                r#"{"action": "sell", "reason": "RSI at 70, take profit met", "confidence": 0.8}"#,
            ),
        ]));
        let executor = RuleExecutor::new(
            store.clone(),
            market,
            Arc::new(PaperOrderGateway::new()),
            llm,
            ExecutorConfig::default(),
        );
        let cancel = CancellationToken::new();

        executor.evaluate_rule(rule_id, &cancel).await.unwrap();
        let mid = store.get_rule(rule_id).await.unwrap().unwrap();
        assert!(mid.runtime_status.is_holding);
        assert!(mid.runtime_status.quantity > 0.0);
        assert!(mid.runtime_status.entry_price.is_some());

        executor.evaluate_rule(rule_id, &cancel).await.unwrap();
        let end = store.get_rule(rule_id).await.unwrap().unwrap();
        assert!(!end.runtime_status.is_holding);
        assert_eq!(end.runtime_status.quantity, 0.0);
        assert_eq!(end.runtime_status.entry_price, None);

        let orders = store.orders(rule_id).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[1].side, Side::Sell);
        assert!(orders[1].pnl > 0.0);
    }

    #[tokio::test]
    async fn hold_decisions_place_no_orders() {
        let store = Arc::new(MemoryRuleStore::new());
        let rule_id = store.save_rule(requirements(MarketKind::Spot)).await.unwrap();
        let (falling, _) = descending_then_ascending();
        let market = Arc::new(ScriptedMarketData::new(vec![falling]));
        let llm = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(
            r#"{"action": "hold", "reason": "entry not met"}"#,
        )]));
        let executor = RuleExecutor::new(
            store.clone(),
            market,
            Arc::new(PaperOrderGateway::new()),
            llm,
            ExecutorConfig::default(),
        );

        executor
            .evaluate_rule(rule_id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.orders(rule_id).await.unwrap().is_empty());
        let rule = store.get_rule(rule_id).await.unwrap().unwrap();
        assert!(!rule.runtime_status.is_holding);
    }

    #[tokio::test]
    async fn stopping_a_rule_is_cooperative() {
        let store = Arc::new(MemoryRuleStore::new());
        let rule_id = store.save_rule(requirements(MarketKind::Spot)).await.unwrap();
        let (falling, _) = descending_then_ascending();
        let market = Arc::new(ScriptedMarketData::new(vec![falling]));
        // Exhausted script: every decision run fails over to hold.
        let llm = Arc::new(ScriptedClient::new(vec![]));
        let executor = Arc::new(RuleExecutor::new(
            store.clone(),
            market,
            Arc::new(PaperOrderGateway::new()),
            llm,
            ExecutorConfig {
                poll_override: Some(Duration::from_millis(20)),
                ..ExecutorConfig::default()
            },
        ));

        assert!(executor.start_rule(rule_id).await.unwrap());
        assert!(!executor.start_rule(rule_id).await.unwrap(), "already running");
        assert!(executor.is_running(rule_id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(executor.stop_rule(rule_id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!executor.is_running(rule_id));

        let rule = store.get_rule(rule_id).await.unwrap().unwrap();
        assert_eq!(rule.active, RuleActivity::Stopped);
    }
}
