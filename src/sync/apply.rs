//! Event application: one decoded event against a chunk scope.
//!
//! Every ledger write goes through [`ChunkScope`], so an error here leaves
//! the committed store untouched and the caller simply drops the scope.

use crate::config::VerboseFilter;
use crate::domain::{Address, DecodedEvent, DiscountPercent, DomainEvent, PositionKey, TokenRole, U256};
use crate::engine::accrual::{self, AccrualError, AccrualOutcome, PositionSnapshot, TransferSide};
use crate::engine::math::MathError;
use crate::engine::{AccrualRules, GhoDiscountRateStrategy, VersionResolver};
use crate::error::{AccrualArithmeticError, LedgerInvariantViolation, SyncError};
use crate::ledger::{ChunkScope, IndexUpdate, LedgerStore, PositionChange, TokenRef, Touch};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, trace};

/// Inputs shared by every event of a chunk.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub strategy: &'a GhoDiscountRateStrategy,
    pub verbose: &'a VerboseFilter,
    /// Chain balances for users first seen by this chunk.
    pub discount_balances: &'a DiscountBalances,
}

/// A discount-token `balanceOf` a chunk needs before it can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscountBalanceRead {
    pub token: Address,
    pub user: Address,
    pub block: u64,
}

impl DiscountBalanceRead {
    fn before(token: Address, user: Address, event: &DecodedEvent) -> Self {
        DiscountBalanceRead {
            token,
            user,
            block: event.block_number.saturating_sub(1),
        }
    }
}

pub type DiscountBalances = HashMap<DiscountBalanceRead, U256>;

/// Discount-token balances `events` will need that the ledger has never seen.
///
/// Each user is read at the block before their first discount-token
/// transfer or GHO debt change in the chunk, under the discount token
/// current at that event. A token switch inside the chunk forgets every
/// earlier snapshot. A transfer of the new token in the switch block, logged
/// before the switch itself, is not reflected in the read.
pub fn discount_balance_reads(ledger: &LedgerStore, events: &[DecodedEvent]) -> Vec<DiscountBalanceRead> {
    let gho_debt = ledger.discount_asset().map(|a| a.debt_token);
    let mut current = ledger.market().gho.discount_token;
    let mut switched = false;
    let mut seen = HashSet::new();
    let mut reads = Vec::new();

    for event in events {
        let emitter = Some(event.emitter);
        let users = match &event.event {
            DomainEvent::DiscountTokenUpdated { new_address, .. } if emitter == gho_debt => {
                current = Some(*new_address);
                switched = true;
                seen.clear();
                continue;
            }
            DomainEvent::BalanceTransfer {
                from,
                to,
                index: None,
                ..
            } if emitter == current && from != to => [Some(*from), Some(*to)],
            DomainEvent::Mint { on_behalf_of, .. } if emitter == gho_debt => [Some(*on_behalf_of), None],
            DomainEvent::Burn { from, .. } if emitter == gho_debt => [Some(*from), None],
            _ => continue,
        };
        let Some(token) = current else {
            continue;
        };

        for user in users.into_iter().flatten() {
            if user == Address::ZERO || !seen.insert(user) {
                continue;
            }
            let tagged = ledger.user(&user).and_then(|u| u.discount_balance_token);
            if !switched && tagged == Some(token) {
                continue;
            }
            reads.push(DiscountBalanceRead::before(token, user, event));
        }
    }
    reads
}

/// Apply one event. Events must arrive in (block, log index) order.
pub fn apply_event(
    scope: &mut ChunkScope<'_>,
    event: &DecodedEvent,
    ctx: &ApplyContext<'_>,
) -> Result<(), SyncError> {
    let verbose = ctx.verbose.matches(event);
    if verbose {
        info!(
            target: "verbose",
            tx = %event.tx_hash,
            position = %event.position(),
            emitter = %event.emitter,
            event = ?event.event,
            "applying event"
        );
    }
    trace!(
        position = %event.position(),
        emitter = %event.emitter,
        event = event.event.name(),
        "applying event"
    );

    let step = Step { event, ctx, verbose };
    match &event.event {
        DomainEvent::ReserveDataUpdated {
            asset,
            liquidity_rate,
            variable_borrow_rate,
            liquidity_index,
            variable_borrow_index,
            ..
        } => {
            require_pool(scope, event)?;
            if scope.asset(asset).is_none() {
                trace!(%asset, "reserve not tracked by this market");
                return Ok(());
            }
            scope.apply_index_update(
                *asset,
                IndexUpdate {
                    liquidity_index: *liquidity_index,
                    variable_borrow_index: *variable_borrow_index,
                    liquidity_rate: *liquidity_rate,
                    variable_borrow_rate: *variable_borrow_rate,
                    block_number: event.block_number,
                },
            )?;
        }
        DomainEvent::UserEModeSet { user, category_id } => {
            require_pool(scope, event)?;
            scope.get_or_create_user(*user).e_mode = *category_id;
        }
        DomainEvent::Upgraded {
            implementation,
            new_revision,
        } => apply_upgrade(scope, event, *implementation, *new_revision)?,
        DomainEvent::DiscountTokenUpdated {
            old_address,
            new_address,
        } => {
            require_gho_debt_token(scope, event)?;
            info!(
                market = %scope.market().id,
                old = %old_address,
                new = %new_address,
                block = event.block_number,
                "discount token updated"
            );
            scope.set_discount_token(*new_address);
        }
        DomainEvent::DiscountRateStrategyUpdated {
            old_address,
            new_address,
        } => {
            require_gho_debt_token(scope, event)?;
            info!(
                market = %scope.market().id,
                old = %old_address,
                new = %new_address,
                block = event.block_number,
                "discount rate strategy updated"
            );
            scope.set_discount_rate_strategy(*new_address);
        }
        DomainEvent::Mint {
            on_behalf_of,
            value,
            balance_increase,
            index,
            ..
        } => {
            let token = require_token(scope, event)?;
            step.apply_scaled(scope, token, *on_behalf_of, |rules, snapshot, discount| {
                accrual::process_mint(rules, snapshot, *value, *balance_increase, *index, discount)
            })?;
        }
        DomainEvent::Burn {
            from,
            value,
            balance_increase,
            index,
            ..
        } => {
            let token = require_token(scope, event)?;
            step.apply_scaled(scope, token, *from, |rules, snapshot, discount| {
                accrual::process_burn(rules, snapshot, *value, *balance_increase, *index, discount)
            })?;
        }
        DomainEvent::BalanceTransfer {
            from,
            to,
            amount,
            index: Some(index),
        } => {
            let token = require_token(scope, event)?;
            if token.role != TokenRole::Collateral {
                return Err(LedgerInvariantViolation::UnexpectedEvent {
                    event: event.event.name(),
                    token: token.token,
                    role: token.role,
                }
                .into());
            }
            for (user, side) in [(*from, TransferSide::Sender), (*to, TransferSide::Recipient)] {
                step.apply_scaled(scope, token, user, |rules, snapshot, _| {
                    accrual::process_transfer(rules, snapshot, *amount, *index, side)
                })?;
            }
        }
        DomainEvent::BalanceTransfer {
            from,
            to,
            amount,
            index: None,
        } => {
            if scope.gho_config().discount_token != Some(event.emitter) {
                trace!(emitter = %event.emitter, "transfer from a replaced discount token");
                return Ok(());
            }
            if from == to {
                trace!(user = %from, "discount-token self-transfer");
                scope.note_event_applied();
                return Ok(());
            }
            for user in [*from, *to] {
                step.seed_discount_balance(scope, user)?;
            }
            scope.transfer_discount_token(*from, *to, *amount)?;
            for user in [*from, *to] {
                if user != Address::ZERO {
                    step.rebalance_discount(scope, user)?;
                }
            }
        }
    }

    scope.note_event_applied();
    Ok(())
}

fn require_pool(scope: &ChunkScope<'_>, event: &DecodedEvent) -> Result<(), LedgerInvariantViolation> {
    if event.emitter == scope.market().pool {
        Ok(())
    } else {
        Err(LedgerInvariantViolation::UnknownContract {
            event: event.event.name(),
            address: event.emitter,
        })
    }
}

fn require_token(scope: &ChunkScope<'_>, event: &DecodedEvent) -> Result<TokenRef, LedgerInvariantViolation> {
    scope
        .token(&event.emitter)
        .ok_or(LedgerInvariantViolation::UnknownContract {
            event: event.event.name(),
            address: event.emitter,
        })
}

fn require_gho_debt_token(
    scope: &ChunkScope<'_>,
    event: &DecodedEvent,
) -> Result<TokenRef, LedgerInvariantViolation> {
    let token = require_token(scope, event)?;
    if token.role != TokenRole::GhoDebt {
        return Err(LedgerInvariantViolation::UnexpectedEvent {
            event: event.event.name(),
            token: token.token,
            role: token.role,
        });
    }
    Ok(token)
}

fn apply_upgrade(
    scope: &mut ChunkScope<'_>,
    event: &DecodedEvent,
    implementation: Address,
    revision: u32,
) -> Result<(), SyncError> {
    let emitter = event.emitter;
    if emitter == scope.market().pool || scope.gho_config().discount_token == Some(emitter) {
        info!(
            market = %scope.market().id,
            proxy = %emitter,
            %implementation,
            revision,
            "non-token proxy upgraded"
        );
        return Ok(());
    }

    let token = require_token(scope, event)?;
    VersionResolver::resolve(token.token, token.role, revision)?;
    if scope.record_upgrade(token, revision, event.block_number)? {
        info!(
            market = %scope.market().id,
            token = %token.token,
            role = %token.role,
            %implementation,
            revision,
            block = event.block_number,
            "token revision upgraded"
        );
    } else {
        debug!(token = %token.token, revision, "upgrade to the current revision");
    }
    Ok(())
}

fn resolve_rules(
    scope: &ChunkScope<'_>,
    token: TokenRef,
) -> Result<&'static AccrualRules, SyncError> {
    let asset = scope
        .asset(&token.asset)
        .ok_or(LedgerInvariantViolation::UnknownAsset(token.asset))?;
    Ok(VersionResolver::resolve(
        token.token,
        token.role,
        asset.revision(token.kind()),
    )?)
}

fn require_discount_config(scope: &ChunkScope<'_>) -> Result<(), LedgerInvariantViolation> {
    let config = scope.gho_config();
    if config.discount_token.is_none() {
        return Err(LedgerInvariantViolation::MissingDiscountConfig("discount token"));
    }
    if config.discount_rate_strategy.is_none() {
        return Err(LedgerInvariantViolation::MissingDiscountConfig("discount rate strategy"));
    }
    Ok(())
}

/// One event's application context.
struct Step<'e, 'c> {
    event: &'e DecodedEvent,
    ctx: &'e ApplyContext<'c>,
    verbose: bool,
}

impl Step<'_, '_> {
    fn touch(&self) -> Touch {
        Touch {
            tx_hash: self.event.tx_hash,
            block_number: self.event.block_number,
        }
    }

    fn arithmetic(&self, source: MathError) -> SyncError {
        AccrualArithmeticError {
            event: self.event.event.name(),
            tx_hash: self.event.tx_hash,
            position: self.event.position(),
            source,
        }
        .into()
    }

    fn accrual_error(&self, key: PositionKey, err: AccrualError) -> SyncError {
        match err {
            AccrualError::Math(source) => self.arithmetic(source),
            AccrualError::IndexRegression { previous, index } => {
                LedgerInvariantViolation::PositionIndexRegression {
                    key,
                    current: previous,
                    attempted: index,
                }
                .into()
            }
        }
    }

    /// Seed `user`'s discount-token balance from the chunk's chain reads if the
    /// scope holds no snapshot for the current token.
    fn seed_discount_balance(&self, scope: &mut ChunkScope<'_>, user: Address) -> Result<(), SyncError> {
        if user == Address::ZERO || scope.is_discount_balance_seeded(&user) {
            return Ok(());
        }
        let Some(token) = scope.gho_config().discount_token else {
            return Ok(());
        };
        let read = DiscountBalanceRead::before(token, user, self.event);
        let balance = *self.ctx.discount_balances.get(&read).ok_or(
            LedgerInvariantViolation::UnseededDiscountBalance {
                user,
                token: Some(token),
            },
        )?;
        debug!(%user, %token, block = read.block, %balance, "discount-token balance seeded");
        scope.seed_discount_token_balance(user, token, balance);
        Ok(())
    }

    /// Run one accrual computation for `user` on `token` and store its result.
    fn apply_scaled<F>(
        &self,
        scope: &mut ChunkScope<'_>,
        token: TokenRef,
        user: Address,
        compute: F,
    ) -> Result<(), SyncError>
    where
        F: FnOnce(&AccrualRules, &PositionSnapshot, DiscountPercent) -> Result<AccrualOutcome, AccrualError>,
    {
        let rules = resolve_rules(scope, token)?;
        if token.role == TokenRole::GhoDebt {
            self.seed_discount_balance(scope, user)?;
        }
        let key = PositionKey {
            kind: token.kind(),
            user,
            asset: token.asset,
        };
        let snapshot = scope
            .position(&key)
            .map(PositionSnapshot::from)
            .unwrap_or_default();
        let discount = if rules.applies_discount() {
            require_discount_config(scope)?;
            scope.discount_percent(&user)
        } else {
            DiscountPercent::default()
        };

        let outcome = compute(rules, &snapshot, discount).map_err(|e| self.accrual_error(key, e))?;
        self.store_outcome(scope, token, key, rules, outcome)
    }

    /// Accrue and burn the discount of a GHO borrower whose discount-token
    /// balance just moved, then refresh the discount percent.
    fn rebalance_discount(&self, scope: &mut ChunkScope<'_>, user: Address) -> Result<(), SyncError> {
        let Some(asset) = scope.discount_asset() else {
            return Ok(());
        };
        let token = TokenRef {
            token: asset.debt_token,
            asset: asset.underlying,
            role: TokenRole::GhoDebt,
        };
        let borrow_index = asset.variable_borrow_index;
        let key = PositionKey::debt(user, token.asset);
        let snapshot = match scope.position(&key) {
            Some(position) if !position.scaled_balance.is_zero() => PositionSnapshot::from(position),
            _ => return Ok(()),
        };

        let rules = resolve_rules(scope, token)?;
        if !rules.applies_discount() {
            return Ok(());
        }
        require_discount_config(scope)?;

        // Last logged borrow index. On chain the snapshot moves to the normalized
        // index of the transfer block, which is higher whenever the reserve has
        // not been touched in that block.
        let index = borrow_index.max(snapshot.last_index);
        let outcome = accrual::process_discount_rebalance(rules, &snapshot, index, scope.discount_percent(&user))
            .map_err(|e| self.accrual_error(key, e))?;
        self.store_outcome(scope, token, key, rules, outcome)
    }

    fn store_outcome(
        &self,
        scope: &mut ChunkScope<'_>,
        token: TokenRef,
        key: PositionKey,
        rules: &AccrualRules,
        outcome: AccrualOutcome,
    ) -> Result<(), SyncError> {
        let interest = outcome.accrual.balance_increase;
        let scaled_balance = scope
            .apply_scaled_delta(
                key,
                PositionChange {
                    delta: outcome.delta,
                    index: outcome.index,
                    interest,
                },
            )?
            .scaled_balance;
        let touch = self.touch();
        scope.touch_position(key, touch);

        trace!(
            %key,
            operation = ?outcome.operation,
            delta = %outcome.delta,
            %scaled_balance,
            "position updated"
        );
        if self.verbose {
            info!(
                target: "verbose",
                tx = %self.event.tx_hash,
                %key,
                revision = rules.revision,
                operation = ?outcome.operation,
                delta = %outcome.delta,
                %scaled_balance,
                index = %outcome.index,
                %interest,
                discount = %outcome.accrual.discount,
                "position updated"
            );
        }

        if token.role != TokenRole::GhoDebt {
            return Ok(());
        }
        scope.credit_gho_interest(key.user, interest)?;
        if rules.applies_discount() {
            self.refresh_discount(scope, key.user, rules, scaled_balance, outcome.index)?;
            scope.touch_gho_user(key.user, touch);
        }
        Ok(())
    }

    fn refresh_discount(
        &self,
        scope: &mut ChunkScope<'_>,
        user: Address,
        rules: &AccrualRules,
        scaled_balance: U256,
        index: U256,
    ) -> Result<(), SyncError> {
        let debt_balance = (rules.balance_of)(scaled_balance, index).map_err(|e| self.arithmetic(e))?;
        let token_balance = scope.discount_token_balance(&user);
        let percent = self
            .ctx
            .strategy
            .calculate_discount_rate(debt_balance, token_balance)
            .map_err(|e| self.arithmetic(e))?;

        let previous = scope.discount_percent(&user);
        if scope.refresh_discount_percent(user, percent) && self.verbose {
            info!(
                target: "verbose",
                tx = %self.event.tx_hash,
                %user,
                %debt_balance,
                %token_balance,
                from = %previous,
                to = %percent,
                "discount percent refreshed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, B256, GhoConfig, Market, MarketId, ScaledDelta, User};
    use crate::engine::RAY;
    use crate::ledger::{LedgerSnapshot, LedgerStore};

    const POOL: u8 = 0x50;
    const WETH: u8 = 0xE0;
    const A_WETH: u8 = 0xE1;
    const V_WETH: u8 = 0xE2;
    const GHO: u8 = 0x60;
    const V_GHO: u8 = 0x62;
    const STK: u8 = 0x70;
    const ALICE: u8 = 0xA1;
    const BOB: u8 = 0xB0;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn u(v: u64) -> U256 {
        U256::from(v)
    }

    fn wad(v: u64) -> U256 {
        crate::engine::WAD * u(v)
    }

    fn store(gho_revision: u32) -> LedgerStore {
        LedgerStore::from_snapshot(LedgerSnapshot {
            market: Market {
                id: MarketId::new(1),
                chain_id: 1,
                pool: addr(POOL),
                active: true,
                start_block: 100,
                last_processed_block: Some(99),
                gho: GhoConfig {
                    discount_token: Some(addr(STK)),
                    discount_rate_strategy: Some(addr(0x71)),
                },
                paused_reason: None,
            },
            assets: vec![
                Asset::new(addr(WETH), addr(A_WETH), addr(V_WETH), 1, 1, false),
                Asset::new(addr(GHO), addr(0x61), addr(V_GHO), 1, gho_revision, true),
            ],
            users: Vec::new(),
            positions: Vec::new(),
            gho_users: Vec::new(),
            revisions: Vec::new(),
        })
    }

    fn decoded(emitter: u8, log_index: u64, event: DomainEvent) -> DecodedEvent {
        DecodedEvent {
            emitter: addr(emitter),
            block_number: 100,
            log_index,
            tx_hash: B256::repeat_byte(log_index as u8 + 1),
            event,
        }
    }

    fn mint(emitter: u8, log_index: u64, user: u8, value: U256, index: U256) -> DecodedEvent {
        decoded(
            emitter,
            log_index,
            DomainEvent::Mint {
                caller: addr(user),
                on_behalf_of: addr(user),
                value,
                balance_increase: U256::ZERO,
                index,
            },
        )
    }

    fn apply_with_balances(
        store: &LedgerStore,
        events: &[DecodedEvent],
        discount_balances: &DiscountBalances,
    ) -> Result<crate::ledger::MutationSet, SyncError> {
        let strategy = GhoDiscountRateStrategy::default();
        let verbose = VerboseFilter::default();
        let ctx = ApplyContext {
            strategy: &strategy,
            verbose: &verbose,
            discount_balances,
        };
        let mut scope = store.begin_chunk(100, 100);
        for event in events {
            apply_event(&mut scope, event, &ctx)?;
        }
        Ok(scope.into_mutations())
    }

    /// Apply with every needed discount balance read from `chain` as
    /// `(token, user, balance)`; unlisted holders read as zero.
    fn apply_with_chain(
        store: &LedgerStore,
        events: &[DecodedEvent],
        chain: &[(u8, u8, U256)],
    ) -> Result<crate::ledger::MutationSet, SyncError> {
        let balances: DiscountBalances = discount_balance_reads(store, events)
            .into_iter()
            .map(|read| {
                let balance = chain
                    .iter()
                    .find(|(token, user, _)| addr(*token) == read.token && addr(*user) == read.user)
                    .map(|(_, _, balance)| *balance)
                    .unwrap_or(U256::ZERO);
                (read, balance)
            })
            .collect();
        apply_with_balances(store, events, &balances)
    }

    fn apply_all(store: &LedgerStore, events: &[DecodedEvent]) -> Result<crate::ledger::MutationSet, SyncError> {
        apply_with_chain(store, events, &[])
    }

    fn discount_transfer(log_index: u64, from: Address, to: Address, amount: U256) -> DecodedEvent {
        decoded(
            STK,
            log_index,
            DomainEvent::BalanceTransfer {
                from,
                to,
                amount,
                index: None,
            },
        )
    }

    fn store_with_holder(balance: U256) -> LedgerStore {
        let mut snapshot = store(2).snapshot();
        snapshot.users.push(User {
            address: addr(ALICE),
            e_mode: 0,
            discount_token_balance: balance,
            discount_balance_token: Some(addr(STK)),
        });
        LedgerStore::from_snapshot(snapshot)
    }

    #[test]
    fn test_supply_creates_position_and_touch() {
        let store = store(1);
        let mutations = apply_all(&store, &[mint(A_WETH, 0, ALICE, u(1000), RAY)]).unwrap();

        assert_eq!(mutations.events_applied, 1);
        assert_eq!(mutations.positions.len(), 1);
        let position = &mutations.positions[0];
        assert_eq!(position.key, PositionKey::collateral(addr(ALICE), addr(WETH)));
        assert_eq!(position.scaled_balance, u(1000));
        assert_eq!(position.last_index, RAY);
        assert_eq!(mutations.touched_positions.len(), 1);
    }

    #[test]
    fn test_reserve_update_from_non_pool_is_rejected() {
        let store = store(1);
        let event = decoded(
            A_WETH,
            0,
            DomainEvent::ReserveDataUpdated {
                asset: addr(WETH),
                liquidity_rate: U256::ZERO,
                stable_borrow_rate: U256::ZERO,
                variable_borrow_rate: U256::ZERO,
                liquidity_index: RAY,
                variable_borrow_index: RAY,
            },
        );
        let err = apply_all(&store, &[event]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::UnknownContract { .. })
        ));
    }

    #[test]
    fn test_untracked_reserve_update_is_skipped() {
        let store = store(1);
        let event = decoded(
            POOL,
            0,
            DomainEvent::ReserveDataUpdated {
                asset: addr(0x99),
                liquidity_rate: U256::ZERO,
                stable_borrow_rate: U256::ZERO,
                variable_borrow_rate: U256::ZERO,
                liquidity_index: RAY,
                variable_borrow_index: RAY,
            },
        );
        let mutations = apply_all(&store, &[event]).unwrap();
        assert_eq!(mutations.events_applied, 0);
        assert!(mutations.assets.is_empty());
    }

    #[test]
    fn test_upgrade_to_unmapped_revision_fails() {
        let store = store(1);
        let event = decoded(
            V_WETH,
            0,
            DomainEvent::Upgraded {
                implementation: addr(0x33),
                new_revision: 42,
            },
        );
        let err = apply_all(&store, &[event]).unwrap_err();
        match err {
            SyncError::VersionResolution(e) => {
                assert_eq!(e.revision, 42);
                assert_eq!(e.role, TokenRole::Debt);
            }
            other => panic!("expected VersionResolution, got {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_records_revision_history() {
        let store = store(1);
        let event = decoded(
            A_WETH,
            0,
            DomainEvent::Upgraded {
                implementation: addr(0x33),
                new_revision: 4,
            },
        );
        let mutations = apply_all(&store, &[event]).unwrap();
        assert_eq!(mutations.revisions.len(), 1);
        assert_eq!(mutations.revisions[0].revision, 4);
        assert_eq!(mutations.assets[0].collateral_revision, 4);
    }

    #[test]
    fn test_collateral_transfer_moves_scaled_amount() {
        let store = store(1);
        let events = [
            mint(A_WETH, 0, ALICE, u(1000), RAY),
            decoded(
                A_WETH,
                1,
                DomainEvent::BalanceTransfer {
                    from: addr(ALICE),
                    to: addr(BOB),
                    amount: u(400),
                    index: Some(RAY),
                },
            ),
        ];
        let mutations = apply_all(&store, &events).unwrap();
        let balance = |user: u8| {
            mutations
                .positions
                .iter()
                .find(|p| p.key.user == addr(user))
                .map(|p| p.scaled_balance)
        };
        assert_eq!(balance(ALICE), Some(u(600)));
        assert_eq!(balance(BOB), Some(u(400)));
    }

    #[test]
    fn test_transfer_from_debt_token_is_unexpected() {
        let store = store(1);
        let event = decoded(
            V_WETH,
            0,
            DomainEvent::BalanceTransfer {
                from: addr(ALICE),
                to: addr(BOB),
                amount: u(1),
                index: Some(RAY),
            },
        );
        let err = apply_all(&store, &[event]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::UnexpectedEvent { .. })
        ));
    }

    #[test]
    fn test_burn_beyond_balance_fails_closed() {
        let store = store(1);
        let events = [
            mint(A_WETH, 0, ALICE, u(100), RAY),
            decoded(
                A_WETH,
                1,
                DomainEvent::Burn {
                    from: addr(ALICE),
                    target: addr(ALICE),
                    value: u(101),
                    balance_increase: U256::ZERO,
                    index: RAY,
                },
            ),
        ];
        let err = apply_all(&store, &events).unwrap_err();
        match err {
            SyncError::Invariant(LedgerInvariantViolation::NegativeBalance { delta, .. }) => {
                assert_eq!(delta, ScaledDelta::Decrease(u(101)));
            }
            other => panic!("expected NegativeBalance, got {other:?}"),
        }
    }

    #[test]
    fn test_gho_borrow_refreshes_discount_from_token_balance() {
        let store = store(2);
        let events = [
            // Alice holds 10 discount tokens: covers 1000 GHO at the max rate.
            decoded(
                STK,
                0,
                DomainEvent::BalanceTransfer {
                    from: Address::ZERO,
                    to: addr(ALICE),
                    amount: wad(10),
                    index: None,
                },
            ),
            mint(V_GHO, 1, ALICE, wad(1000), RAY),
        ];
        let mutations = apply_all(&store, &events).unwrap();
        let state = mutations
            .gho_users
            .iter()
            .find(|g| g.user == addr(ALICE))
            .unwrap();
        assert_eq!(state.discount_percent.bps(), 3000);
        assert_eq!(mutations.touched_gho_users.len(), 1);
    }

    #[test]
    fn test_discount_self_transfer_is_a_no_op() {
        let store = store(2);
        let event = decoded(
            STK,
            0,
            DomainEvent::BalanceTransfer {
                from: addr(ALICE),
                to: addr(ALICE),
                amount: wad(5),
                index: None,
            },
        );
        let mutations = apply_all(&store, &[event]).unwrap();
        assert!(mutations.users.is_empty());
        assert_eq!(mutations.events_applied, 1);
    }

    #[test]
    fn test_discount_transfer_underflow_is_rejected() {
        let store = store(2);
        let event = decoded(
            STK,
            0,
            DomainEvent::BalanceTransfer {
                from: addr(ALICE),
                to: addr(BOB),
                amount: wad(5),
                index: None,
            },
        );
        let err = apply_all(&store, &[event]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::DiscountTokenUnderflow { .. })
        ));
    }

    #[test]
    fn test_holder_from_before_the_chunk_is_read_from_chain() {
        let store = store(2);
        let events = [
            discount_transfer(0, addr(ALICE), addr(BOB), wad(4)),
            mint(V_GHO, 1, ALICE, wad(500), RAY),
        ];
        let reads = discount_balance_reads(&store, &events);
        assert_eq!(
            reads,
            vec![
                DiscountBalanceRead { token: addr(STK), user: addr(ALICE), block: 99 },
                DiscountBalanceRead { token: addr(STK), user: addr(BOB), block: 99 },
            ]
        );

        let mutations = apply_with_chain(&store, &events, &[(STK, ALICE, wad(10))]).unwrap();
        let user = |address: u8| mutations.users.iter().find(|u| u.address == addr(address)).unwrap();
        assert_eq!(user(ALICE).discount_token_balance, wad(6));
        assert_eq!(user(BOB).discount_token_balance, wad(4));
        assert_eq!(user(ALICE).discount_balance_token, Some(addr(STK)));

        // 6 tokens cover 600 GHO, more than the 500 borrowed.
        let state = mutations.gho_users.iter().find(|g| g.user == addr(ALICE)).unwrap();
        assert_eq!(state.discount_percent.bps(), 3000);
    }

    #[test]
    fn test_missing_chain_balance_fails_the_chunk() {
        let store = store(2);
        let events = [discount_transfer(0, addr(ALICE), addr(BOB), wad(1))];
        let err = apply_with_balances(&store, &events, &DiscountBalances::new()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::UnseededDiscountBalance { user, .. })
                if user == addr(ALICE)
        ));
    }

    #[test]
    fn test_seeded_holder_is_not_read_again() {
        let store = store_with_holder(wad(10));
        let events = [mint(V_GHO, 0, ALICE, wad(1000), RAY)];
        assert!(discount_balance_reads(&store, &events).is_empty());

        let mutations = apply_with_balances(&store, &events, &DiscountBalances::new()).unwrap();
        let state = mutations.gho_users.iter().find(|g| g.user == addr(ALICE)).unwrap();
        assert_eq!(state.discount_percent.bps(), 3000);
    }

    #[test]
    fn test_discount_token_switch_reseeds_from_new_token() {
        const NEW_STK: u8 = 0x72;
        let store = store_with_holder(wad(10));
        let events = [
            decoded(
                V_GHO,
                0,
                DomainEvent::DiscountTokenUpdated {
                    old_address: addr(STK),
                    new_address: addr(NEW_STK),
                },
            ),
            mint(V_GHO, 1, ALICE, wad(1000), RAY),
        ];
        assert_eq!(
            discount_balance_reads(&store, &events),
            vec![DiscountBalanceRead { token: addr(NEW_STK), user: addr(ALICE), block: 99 }]
        );

        let mutations = apply_with_chain(
            &store,
            &events,
            &[(STK, ALICE, wad(10)), (NEW_STK, ALICE, wad(5))],
        )
        .unwrap();
        let alice = mutations.users.iter().find(|u| u.address == addr(ALICE)).unwrap();
        assert_eq!(alice.discount_token_balance, wad(5));
        assert_eq!(alice.discount_balance_token, Some(addr(NEW_STK)));

        // 5 new tokens cover half of the 1000 borrowed.
        let state = mutations.gho_users.iter().find(|g| g.user == addr(ALICE)).unwrap();
        assert_eq!(state.discount_percent.bps(), 1500);
    }

    #[test]
    fn test_discount_rebalance_never_accrues_below_the_snapshot() {
        let store = store(2);
        let logged_index = RAY * u(102) / u(100);
        let events = [
            // No reserve update: the stored GHO borrow index is still RAY.
            mint(V_GHO, 0, ALICE, wad(1000), logged_index),
            discount_transfer(1, Address::ZERO, addr(ALICE), wad(20)),
        ];
        let mutations = apply_all(&store, &events).unwrap();
        let debt = mutations
            .positions
            .iter()
            .find(|p| p.key == PositionKey::debt(addr(ALICE), addr(GHO)))
            .unwrap();
        assert_eq!(debt.last_index, logged_index);
        assert_eq!(debt.accumulated_interest, U256::ZERO);

        let state = mutations.gho_users.iter().find(|g| g.user == addr(ALICE)).unwrap();
        assert_eq!(state.discount_percent.bps(), 3000);
    }

    #[test]
    fn test_gho_discount_needs_strategy() {
        let mut snapshot = store(2).snapshot();
        snapshot.market.gho.discount_rate_strategy = None;
        let store = LedgerStore::from_snapshot(snapshot);
        let err = apply_all(&store, &[mint(V_GHO, 0, ALICE, wad(1), RAY)]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::MissingDiscountConfig(_))
        ));
    }

    #[test]
    fn test_discount_config_only_from_gho_debt_token() {
        let store = store(2);
        let event = decoded(
            V_WETH,
            0,
            DomainEvent::DiscountTokenUpdated {
                old_address: addr(STK),
                new_address: addr(0x72),
            },
        );
        let err = apply_all(&store, &[event]).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Invariant(LedgerInvariantViolation::UnexpectedEvent { .. })
        ));

        let event = decoded(
            V_GHO,
            0,
            DomainEvent::DiscountTokenUpdated {
                old_address: addr(STK),
                new_address: addr(0x72),
            },
        );
        let mutations = apply_all(&store, &[event]).unwrap();
        assert_eq!(mutations.gho.and_then(|g| g.discount_token), Some(addr(0x72)));
    }
}
