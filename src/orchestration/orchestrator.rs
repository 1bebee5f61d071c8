use crate::datasource::{ChainReader, LogSource};
use crate::db::Repository;
use crate::domain::MarketId;
use crate::error::SyncError;
use crate::sync::{SyncConfig, SyncController, SyncMode, SyncReport};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Result of one market within a `sync_all` run.
#[derive(Debug)]
pub struct MarketOutcome {
    pub market: MarketId,
    pub result: Result<SyncReport, SyncError>,
}

/// Drives every active market. Each market has one controller behind its own
/// lock, so a market never has two writers while different markets run
/// concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<Repository>,
    source: Arc<dyn LogSource>,
    reader: Arc<dyn ChainReader>,
    config: SyncConfig,
    controllers: Arc<Mutex<HashMap<MarketId, Arc<Mutex<SyncController>>>>>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<Repository>,
        source: Arc<dyn LogSource>,
        reader: Arc<dyn ChainReader>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repo,
            source,
            reader,
            config,
            controllers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn controller(&self, market: MarketId) -> Arc<Mutex<SyncController>> {
        let mut controllers = self.controllers.lock().await;
        controllers
            .entry(market)
            .or_insert_with(|| {
                Arc::new(Mutex::new(SyncController::new(
                    market,
                    self.source.clone(),
                    self.reader.clone(),
                    self.repo.clone(),
                    self.config.clone(),
                )))
            })
            .clone()
    }

    /// Sync one market, waiting for any run already in progress on it.
    pub async fn sync_market(&self, market: MarketId, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let controller = self.controller(market).await;
        let controller = controller.lock().await;
        controller.sync(mode).await
    }

    /// Sync every active, unpaused market concurrently.
    pub async fn sync_all(&self, mode: SyncMode) -> Result<Vec<MarketOutcome>, SyncError> {
        let markets = self.repo.list_active_markets().await?;
        if markets.is_empty() {
            warn!("no active markets to sync");
        }

        let outcomes = join_all(markets.into_iter().map(|market| async move {
            let result = self.sync_market(market, mode).await;
            if let Err(e) = &result {
                error!(market = %market, error = %e, retryable = e.is_retryable(), "market sync failed");
            }
            MarketOutcome { market, result }
        }))
        .await;
        Ok(outcomes)
    }
}
