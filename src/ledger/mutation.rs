//! Buffered chunk mutations, flushed to the durable store in one transaction.

use crate::domain::{
    Address, Asset, ContractRevision, GhoConfig, GhoUserState, Position, PositionKey, User, B256,
};
use serde::{Deserialize, Serialize};

/// Last event that touched a ledger entity within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Touch {
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Every entity a chunk changed, in its final post-chunk state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationSet {
    pub from_block: u64,
    pub to_block: u64,
    /// Set when the chunk changed the discount token or strategy.
    pub gho: Option<GhoConfig>,
    pub assets: Vec<Asset>,
    pub users: Vec<User>,
    pub positions: Vec<Position>,
    pub gho_users: Vec<GhoUserState>,
    /// Revision history rows appended by upgrades.
    pub revisions: Vec<ContractRevision>,
    pub touched_positions: Vec<(PositionKey, Touch)>,
    pub touched_gho_users: Vec<(Address, Touch)>,
    pub events_applied: usize,
}

impl MutationSet {
    pub fn is_empty(&self) -> bool {
        self.gho.is_none()
            && self.assets.is_empty()
            && self.users.is_empty()
            && self.positions.is_empty()
            && self.gho_users.is_empty()
            && self.revisions.is_empty()
    }

    pub fn block_count(&self) -> u64 {
        self.to_block.saturating_sub(self.from_block) + 1
    }
}
