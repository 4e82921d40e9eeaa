//! QuantOS application layer: configuration, workspaces, trading rules,
//! the collector and executor hosts, and the market collaborators. The
//! HTTP/SSE edge links this library and drives sessions through
//! [`quantos_core::SessionRegistry`] and [`executor::RuleExecutor`].

pub mod collector;
pub mod config;
pub mod executor;
pub mod market;
pub mod rules;
pub mod workspace;

pub use collector::RuleCollector;
pub use config::QuantOsConfig;
pub use executor::{
    apply_decision, parse_decision, Decision, DecisionAction, ExecutorConfig, OrderIntent,
    RuleExecutor,
};
pub use market::{BinanceMarketData, PaperOrderGateway, ScriptedMarketData};
pub use rules::{
    MarketKind, MemoryRuleStore, Order, PositionSide, RuleActivity, RuleState, RuleStore,
    RuntimeStatus, SaveRuleTool, TradingRequirements,
};
pub use workspace::{ProjectMeta, WorkspaceManager};
