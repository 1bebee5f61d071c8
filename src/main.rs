use anyhow::Context;
use lending_ledger::{config::Config, db::init_db, JsonRpcClient, Orchestrator, Repository};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;

    let pool = init_db(&config.database_path)
        .await
        .context("failed to initialize database")?;
    let repo = Arc::new(Repository::new(pool));
    let client = Arc::new(JsonRpcClient::new(config.rpc_url.clone()));

    let orchestrator = Orchestrator::new(repo, client.clone(), client, config.sync_config());
    let outcomes = orchestrator.sync_all(config.sync_mode).await?;

    let mut failed = 0usize;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => tracing::info!(
                market = %outcome.market,
                report = %serde_json::to_string(report).unwrap_or_default(),
                "sync report"
            ),
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} market(s) failed to sync", failed, outcomes.len());
    }
    Ok(())
}
