//! QuantOS server process: wires the LLM provider, workspaces, rule store,
//! session registry and rule executor together, then runs until ctrl-c.
//! The HTTP/SSE edge lives in a separate service and drives this process
//! through the session registry and executor handles.

use anyhow::Result;
use quantos_app::config::QuantOsConfig;
use quantos_app::executor::{ExecutorConfig, RuleExecutor};
use quantos_app::market::{BinanceMarketData, PaperOrderGateway};
use quantos_app::rules::{MemoryRuleStore, RuleActivity, RuleStore};
use quantos_core::SessionRegistry;
use quantos_llm::{select_provider, OpenAiCompatClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = QuantOsConfig::load(config_path).await?;

    let provider = select_provider(&config.general.providers)?;
    tracing::info!(model = %provider.model, "provider selected");
    let llm = Arc::new(OpenAiCompatClient::new(provider));

    tokio::fs::create_dir_all(&config.workspace.root).await?;
    let store: Arc<dyn RuleStore> = Arc::new(MemoryRuleStore::new());
    let market = Arc::new(BinanceMarketData::new());
    let gateway = Arc::new(PaperOrderGateway::new());

    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
        config.session.idle_timeout_seconds,
    )));
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let evicted = sessions.evict_idle();
                if evicted > 0 {
                    tracing::info!(evicted, "idle sessions evicted");
                }
            }
        });
    }

    let executor = Arc::new(RuleExecutor::new(
        store.clone(),
        market,
        gateway,
        llm,
        ExecutorConfig {
            default_poll: Duration::from_secs(config.executor.default_poll_seconds),
            poll_override: None,
            decision_max_iterations: config.executor.decision_max_iterations,
        },
    ));
    for rule in store.list_rules().await? {
        if rule.active == RuleActivity::Running {
            executor.start_rule(rule.rule_id).await?;
        }
    }

    tracing::info!(
        workspace_root = %config.workspace.root,
        sessions = sessions.len(),
        "quantos is up"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    executor.shutdown();
    Ok(())
}
