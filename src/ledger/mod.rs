//! In-memory Ledger Store for one market.
//!
//! The committed state only changes through [`LedgerStore::apply_mutations`],
//! fed by a [`ChunkScope`] that buffered and validated every write.

pub mod mutation;
pub mod scope;

pub use mutation::{MutationSet, Touch};
pub use scope::{ChunkScope, IndexUpdate, PositionChange};

use crate::domain::{
    Address, Asset, ContractRevision, GhoUserState, Market, MarketId, Position, PositionKey,
    PositionKind, TokenRole, User,
};
use std::collections::{BTreeMap, HashMap};

/// Full market state as loaded from the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub market: Market,
    pub assets: Vec<Asset>,
    pub users: Vec<User>,
    pub positions: Vec<Position>,
    pub gho_users: Vec<GhoUserState>,
    pub revisions: Vec<ContractRevision>,
}

/// A scaled-balance token resolved to its reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRef {
    pub token: Address,
    /// Underlying asset address.
    pub asset: Address,
    pub role: TokenRole,
}

impl TokenRef {
    pub fn kind(&self) -> PositionKind {
        self.role.position_kind()
    }
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    market: Market,
    assets: BTreeMap<Address, Asset>,
    tokens: HashMap<Address, TokenRef>,
    users: HashMap<Address, User>,
    positions: HashMap<PositionKey, Position>,
    gho_users: HashMap<Address, GhoUserState>,
    revisions: Vec<ContractRevision>,
}

impl LedgerStore {
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut store = LedgerStore {
            market: snapshot.market,
            assets: BTreeMap::new(),
            tokens: HashMap::new(),
            users: snapshot.users.into_iter().map(|u| (u.address, u)).collect(),
            positions: snapshot.positions.into_iter().map(|p| (p.key, p)).collect(),
            gho_users: snapshot.gho_users.into_iter().map(|g| (g.user, g)).collect(),
            revisions: snapshot.revisions,
        };
        for asset in snapshot.assets {
            store.insert_asset(asset);
        }
        store
    }

    fn insert_asset(&mut self, asset: Asset) {
        self.tokens.insert(
            asset.collateral_token,
            TokenRef {
                token: asset.collateral_token,
                asset: asset.underlying,
                role: TokenRole::Collateral,
            },
        );
        self.tokens.insert(
            asset.debt_token,
            TokenRef {
                token: asset.debt_token,
                asset: asset.underlying,
                role: asset.debt_role(),
            },
        );
        self.assets.insert(asset.underlying, asset);
    }

    /// Export the state in a stable order.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by_key(|u| u.address);
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.key);
        let mut gho_users: Vec<GhoUserState> = self.gho_users.values().cloned().collect();
        gho_users.sort_by_key(|g| g.user);

        LedgerSnapshot {
            market: self.market.clone(),
            assets: self.assets.values().cloned().collect(),
            users,
            positions,
            gho_users,
            revisions: self.revisions.clone(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn market_id(&self) -> MarketId {
        self.market.id
    }

    pub fn checkpoint(&self) -> Option<u64> {
        self.market.last_processed_block
    }

    pub fn asset(&self, underlying: &Address) -> Option<&Asset> {
        self.assets.get(underlying)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn discount_asset(&self) -> Option<&Asset> {
        self.assets.values().find(|a| a.discount_eligible)
    }

    pub fn token(&self, address: &Address) -> Option<TokenRef> {
        self.tokens.get(address).copied()
    }

    pub fn user(&self, address: &Address) -> Option<&User> {
        self.users.get(address)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn position(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn gho_user(&self, address: &Address) -> Option<&GhoUserState> {
        self.gho_users.get(address)
    }

    pub fn revisions(&self) -> &[ContractRevision] {
        &self.revisions
    }

    /// Contracts whose logs feed this market: the pool, every reserve token
    /// and the discount token when one is configured.
    pub fn watched_addresses(&self) -> Vec<Address> {
        let mut addresses = vec![self.market.pool];
        for asset in self.assets.values() {
            addresses.push(asset.collateral_token);
            addresses.push(asset.debt_token);
        }
        if let Some(token) = self.market.gho.discount_token {
            addresses.push(token);
        }
        addresses.sort();
        addresses.dedup();
        addresses
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Open a chunk-scoped transaction over blocks `[from_block, to_block]`.
    pub fn begin_chunk(&self, from_block: u64, to_block: u64) -> ChunkScope<'_> {
        ChunkScope::new(self, from_block, to_block)
    }

    /// Merge a committed chunk into the in-memory state.
    pub fn apply_mutations(&mut self, mutations: &MutationSet) {
        if let Some(gho) = &mutations.gho {
            self.market.gho = gho.clone();
        }
        for asset in &mutations.assets {
            self.insert_asset(asset.clone());
        }
        for user in &mutations.users {
            self.users.insert(user.address, user.clone());
        }
        for position in &mutations.positions {
            self.positions.insert(position.key, position.clone());
        }
        for state in &mutations.gho_users {
            self.gho_users.insert(state.user, state.clone());
        }
        self.revisions.extend(mutations.revisions.iter().cloned());
    }

    pub fn advance_checkpoint(&mut self, block: u64) {
        self.market.last_processed_block = Some(block);
    }

    pub fn pause(&mut self, reason: impl Into<String>) {
        self.market.paused_reason = Some(reason.into());
    }
}
