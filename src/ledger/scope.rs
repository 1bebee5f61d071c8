//! Chunk-scoped transaction over the Ledger Store.
//!
//! Reads fall through to the committed store; the first write to an entity
//! copies it into the scope. Dropping the scope discards every change.

use super::mutation::{MutationSet, Touch};
use super::{LedgerStore, TokenRef};
use crate::domain::{
    Address, Asset, ContractRevision, DiscountPercent, GhoConfig, GhoUserState, Market, Position,
    PositionKey, PositionKind, ScaledDelta, User, U256,
};
use crate::error::LedgerInvariantViolation;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// New reserve state from a `ReserveDataUpdated` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexUpdate {
    pub liquidity_index: U256,
    pub variable_borrow_index: U256,
    pub liquidity_rate: U256,
    pub variable_borrow_rate: U256,
    pub block_number: u64,
}

/// Change to one position computed by the accrual engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionChange {
    pub delta: ScaledDelta,
    /// New index snapshot.
    pub index: U256,
    /// Interest credited to the position's counter.
    pub interest: U256,
}

pub struct ChunkScope<'a> {
    base: &'a LedgerStore,
    from_block: u64,
    to_block: u64,
    gho: Option<GhoConfig>,
    assets: BTreeMap<Address, Asset>,
    users: BTreeMap<Address, User>,
    positions: BTreeMap<PositionKey, Position>,
    gho_users: BTreeMap<Address, GhoUserState>,
    revisions: Vec<ContractRevision>,
    touched_positions: BTreeMap<PositionKey, Touch>,
    touched_gho_users: BTreeMap<Address, Touch>,
    events_applied: usize,
}

impl<'a> ChunkScope<'a> {
    pub(super) fn new(base: &'a LedgerStore, from_block: u64, to_block: u64) -> Self {
        ChunkScope {
            base,
            from_block,
            to_block,
            gho: None,
            assets: BTreeMap::new(),
            users: BTreeMap::new(),
            positions: BTreeMap::new(),
            gho_users: BTreeMap::new(),
            revisions: Vec::new(),
            touched_positions: BTreeMap::new(),
            touched_gho_users: BTreeMap::new(),
            events_applied: 0,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn market(&self) -> &Market {
        self.base.market()
    }

    pub fn range(&self) -> (u64, u64) {
        (self.from_block, self.to_block)
    }

    pub fn gho_config(&self) -> &GhoConfig {
        self.gho.as_ref().unwrap_or(&self.base.market().gho)
    }

    pub fn asset(&self, underlying: &Address) -> Option<&Asset> {
        self.assets
            .get(underlying)
            .or_else(|| self.base.asset(underlying))
    }

    /// The discount-eligible reserve, if the market lists one.
    pub fn discount_asset(&self) -> Option<&Asset> {
        let underlying = self.base.discount_asset()?.underlying;
        self.asset(&underlying)
    }

    pub fn token(&self, address: &Address) -> Option<TokenRef> {
        self.base.token(address)
    }

    pub fn user(&self, address: &Address) -> Option<&User> {
        self.users
            .get(address)
            .or_else(|| self.base.user(address))
    }

    pub fn position(&self, key: &PositionKey) -> Option<&Position> {
        self.positions
            .get(key)
            .or_else(|| self.base.position(key))
    }

    pub fn gho_user(&self, address: &Address) -> Option<&GhoUserState> {
        self.gho_users
            .get(address)
            .or_else(|| self.base.gho_user(address))
    }

    pub fn discount_percent(&self, user: &Address) -> DiscountPercent {
        self.gho_user(user)
            .map(|state| state.discount_percent)
            .unwrap_or_default()
    }

    /// Balance of the current discount token; zero if never seeded for it.
    pub fn discount_token_balance(&self, user: &Address) -> U256 {
        match self.user(user) {
            Some(u) if self.discount_balance_known(u) => u.discount_token_balance,
            _ => U256::ZERO,
        }
    }

    /// True if `user` holds a balance snapshot for the current discount token.
    pub fn is_discount_balance_seeded(&self, user: &Address) -> bool {
        self.user(user)
            .map(|u| self.discount_balance_known(u))
            .unwrap_or(false)
    }

    fn discount_balance_known(&self, user: &User) -> bool {
        user.discount_balance_token.is_some()
            && user.discount_balance_token == self.gho_config().discount_token
    }

    // =========================================================================
    // Entity creation
    // =========================================================================

    pub fn get_or_create_user(&mut self, address: Address) -> &mut User {
        let base = self.base;
        self.users.entry(address).or_insert_with(|| {
            base.user(&address)
                .cloned()
                .unwrap_or_else(|| User::new(address))
        })
    }

    pub fn get_or_create_collateral_position(&mut self, user: Address, asset: Address) -> &mut Position {
        self.get_or_create_position(PositionKey::collateral(user, asset))
    }

    pub fn get_or_create_debt_position(&mut self, user: Address, asset: Address) -> &mut Position {
        self.get_or_create_position(PositionKey::debt(user, asset))
    }

    fn get_or_create_position(&mut self, key: PositionKey) -> &mut Position {
        let base = self.base;
        self.positions.entry(key).or_insert_with(|| {
            base.position(&key)
                .cloned()
                .unwrap_or_else(|| Position::new(key))
        })
    }

    pub fn get_or_create_gho_user(&mut self, user: Address) -> &mut GhoUserState {
        let base = self.base;
        self.gho_users.entry(user).or_insert_with(|| {
            base.gho_user(&user)
                .cloned()
                .unwrap_or_else(|| GhoUserState::new(user))
        })
    }

    fn asset_mut(&mut self, underlying: Address) -> Result<&mut Asset, LedgerInvariantViolation> {
        match self.assets.entry(underlying) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let asset = self
                    .base
                    .asset(&underlying)
                    .cloned()
                    .ok_or(LedgerInvariantViolation::UnknownAsset(underlying))?;
                Ok(entry.insert(asset))
            }
        }
    }

    // =========================================================================
    // Validated mutations
    // =========================================================================

    /// Move a reserve's indices forward. Either index going backwards is refused.
    pub fn apply_index_update(
        &mut self,
        asset: Address,
        update: IndexUpdate,
    ) -> Result<(), LedgerInvariantViolation> {
        let entry = self.asset_mut(asset)?;
        if update.liquidity_index < entry.liquidity_index {
            return Err(LedgerInvariantViolation::IndexRegression {
                asset,
                index_name: "liquidity index",
                current: entry.liquidity_index,
                attempted: update.liquidity_index,
            });
        }
        if update.variable_borrow_index < entry.variable_borrow_index {
            return Err(LedgerInvariantViolation::IndexRegression {
                asset,
                index_name: "variable borrow index",
                current: entry.variable_borrow_index,
                attempted: update.variable_borrow_index,
            });
        }

        entry.liquidity_index = update.liquidity_index;
        entry.variable_borrow_index = update.variable_borrow_index;
        entry.liquidity_rate = update.liquidity_rate;
        entry.variable_borrow_rate = update.variable_borrow_rate;
        entry.last_update_block = Some(update.block_number);
        Ok(())
    }

    /// Apply a signed scaled delta and move the position's index snapshot.
    ///
    /// Fails without modifying the position if the balance would go negative
    /// or the snapshot would move backwards.
    pub fn apply_scaled_delta(
        &mut self,
        key: PositionKey,
        change: PositionChange,
    ) -> Result<&Position, LedgerInvariantViolation> {
        let position = self.get_or_create_position(key);
        if change.index < position.last_index {
            return Err(LedgerInvariantViolation::PositionIndexRegression {
                key,
                current: position.last_index,
                attempted: change.index,
            });
        }

        let scaled_balance = match change.delta.apply_to(position.scaled_balance) {
            Some(balance) => balance,
            None if matches!(change.delta, ScaledDelta::Decrease(_)) => {
                return Err(LedgerInvariantViolation::NegativeBalance {
                    key,
                    balance: position.scaled_balance,
                    delta: change.delta,
                })
            }
            None => {
                return Err(LedgerInvariantViolation::CounterOverflow(format!(
                    "scaled balance of {}",
                    key
                )))
            }
        };
        let accumulated_interest = position
            .accumulated_interest
            .checked_add(change.interest)
            .ok_or_else(|| {
                LedgerInvariantViolation::CounterOverflow(format!("accumulated interest of {}", key))
            })?;

        position.scaled_balance = scaled_balance;
        position.last_index = change.index;
        position.accumulated_interest = accumulated_interest;
        Ok(position)
    }

    /// Add net-of-discount interest to a user's discount-asset counter.
    pub fn credit_gho_interest(
        &mut self,
        user: Address,
        amount: U256,
    ) -> Result<(), LedgerInvariantViolation> {
        let state = self.get_or_create_gho_user(user);
        state.accumulated_debt_interest = state
            .accumulated_debt_interest
            .checked_add(amount)
            .ok_or_else(|| {
                LedgerInvariantViolation::CounterOverflow(format!(
                    "accumulated debt interest of {}",
                    user
                ))
            })?;
        Ok(())
    }

    /// Store a strategy-derived discount percent. Returns true if it changed.
    pub fn refresh_discount_percent(&mut self, user: Address, percent: DiscountPercent) -> bool {
        let state = self.get_or_create_gho_user(user);
        let changed = state.discount_percent != percent;
        state.discount_percent = percent;
        changed
    }

    /// Replace a user's discount-token snapshot with a balance read from chain.
    pub fn seed_discount_token_balance(&mut self, user: Address, token: Address, balance: U256) {
        let entry = self.get_or_create_user(user);
        entry.discount_token_balance = balance;
        entry.discount_balance_token = Some(token);
    }

    /// Move discount tokens between two users; the zero address is the mint/burn side.
    ///
    /// Both non-zero sides must already be seeded for the current discount token.
    pub fn transfer_discount_token(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), LedgerInvariantViolation> {
        for user in [from, to] {
            if user != Address::ZERO && !self.is_discount_balance_seeded(&user) {
                return Err(LedgerInvariantViolation::UnseededDiscountBalance {
                    user,
                    token: self.gho_config().discount_token,
                });
            }
        }
        if from != Address::ZERO {
            let sender = self.get_or_create_user(from);
            sender.discount_token_balance = sender
                .discount_token_balance
                .checked_sub(amount)
                .ok_or(LedgerInvariantViolation::DiscountTokenUnderflow {
                    user: from,
                    balance: sender.discount_token_balance,
                    amount,
                })?;
        }
        if to != Address::ZERO {
            let recipient = self.get_or_create_user(to);
            recipient.discount_token_balance = recipient
                .discount_token_balance
                .checked_add(amount)
                .ok_or_else(|| {
                    LedgerInvariantViolation::CounterOverflow(format!(
                        "discount-token balance of {}",
                        to
                    ))
                })?;
        }
        Ok(())
    }

    /// Record a token upgrade. Revisions never move backwards.
    pub fn record_upgrade(
        &mut self,
        token: TokenRef,
        revision: u32,
        block_number: u64,
    ) -> Result<bool, LedgerInvariantViolation> {
        let kind = token.role.position_kind();
        let asset = self.asset_mut(token.asset)?;
        let current = asset.revision(kind);
        if revision < current {
            return Err(LedgerInvariantViolation::RevisionRegression {
                token: token.token,
                current,
                attempted: revision,
            });
        }
        if revision == current {
            return Ok(false);
        }

        match kind {
            PositionKind::Collateral => asset.collateral_revision = revision,
            PositionKind::Debt => asset.debt_revision = revision,
        }
        self.revisions.push(ContractRevision {
            token: token.token,
            role: token.role,
            revision,
            since_block: block_number,
        });
        Ok(true)
    }

    /// Switch the discount token and clear every balance snapshot taken for
    /// earlier tokens. Holders are re-seeded on first use.
    pub fn set_discount_token(&mut self, token: Address) {
        let mut config = self.gho_config().clone();
        config.discount_token = Some(token);
        self.gho = Some(config);

        let seeded: Vec<Address> = self
            .base
            .users()
            .chain(self.users.values())
            .filter(|u| u.discount_balance_token.is_some())
            .map(|u| u.address)
            .collect();
        for address in seeded {
            let user = self.get_or_create_user(address);
            user.discount_token_balance = U256::ZERO;
            user.discount_balance_token = None;
        }
    }

    pub fn set_discount_rate_strategy(&mut self, strategy: Address) {
        let mut config = self.gho_config().clone();
        config.discount_rate_strategy = Some(strategy);
        self.gho = Some(config);
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    pub fn touch_position(&mut self, key: PositionKey, touch: Touch) {
        self.touched_positions.insert(key, touch);
    }

    pub fn touch_gho_user(&mut self, user: Address, touch: Touch) {
        self.touched_gho_users.insert(user, touch);
    }

    pub fn note_event_applied(&mut self) {
        self.events_applied += 1;
    }

    /// True if the discount token differs from the committed configuration.
    pub fn discount_token_changed(&self) -> bool {
        self.gho_config().discount_token != self.base.market().gho.discount_token
    }

    /// Close the scope, yielding every buffered change.
    pub fn into_mutations(self) -> MutationSet {
        MutationSet {
            from_block: self.from_block,
            to_block: self.to_block,
            gho: self.gho,
            assets: self.assets.into_values().collect(),
            users: self.users.into_values().collect(),
            positions: self.positions.into_values().collect(),
            gho_users: self.gho_users.into_values().collect(),
            revisions: self.revisions,
            touched_positions: self.touched_positions.into_iter().collect(),
            touched_gho_users: self.touched_gho_users.into_iter().collect(),
            events_applied: self.events_applied,
        }
    }
}
