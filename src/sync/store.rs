//! Durable-store port used by the sync controller.

use super::verify::PendingChunk;
use crate::domain::MarketId;
use crate::error::SyncError;
use crate::ledger::{LedgerSnapshot, MutationSet};
use async_trait::async_trait;

/// Persisted market state plus any chunk that committed but never verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMarket {
    pub snapshot: LedgerSnapshot,
    pub pending: Option<PendingChunk>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load_market_state(&self, market: MarketId) -> Result<StoredMarket, SyncError>;

    /// Write a chunk's mutations and its verification plan in one transaction.
    ///
    /// The checkpoint is not moved.
    async fn commit_chunk(
        &self,
        market: MarketId,
        mutations: &MutationSet,
        pending: &PendingChunk,
    ) -> Result<(), SyncError>;

    async fn read_checkpoint(&self, market: MarketId) -> Result<Option<u64>, SyncError>;

    /// Mark the pending chunk verified and move the checkpoint to `to_block`.
    async fn advance_checkpoint(&self, market: MarketId, to_block: u64) -> Result<(), SyncError>;

    async fn pause_market(&self, market: MarketId, reason: &str) -> Result<(), SyncError>;
}
