//! Ledger-level properties of event application, independent of chain access.

use lending_ledger::{
    config::VerboseFilter,
    datasource::MockChainReader,
    domain::{Address, Asset, DecodedEvent, DomainEvent, GhoConfig, Market, MarketId, PositionKey, B256, U256},
    engine::{GhoDiscountRateStrategy, RAY, WAD},
    error::{LedgerInvariantViolation, VerifiedField},
    ledger::{LedgerSnapshot, LedgerStore, MutationSet},
    sync::{apply_event, discount_balance_reads, verify, ApplyContext, DiscountBalances, RetryPolicy, Verifier},
    SyncError,
};
use std::sync::Arc;

fn addr(b: u8) -> Address {
    Address::repeat_byte(b)
}

const POOL: u8 = 0x50;
const WETH: u8 = 0xE0;
const A_WETH: u8 = 0xE1;
const V_WETH: u8 = 0xE2;
const GHO: u8 = 0x60;
const V_GHO: u8 = 0x62;
const STK: u8 = 0x70;
const ALICE: u8 = 0xA1;
const BOB: u8 = 0xB0;

fn wad(v: u64) -> U256 {
    WAD * U256::from(v)
}

fn ray_fraction(numerator: u64, denominator: u64) -> U256 {
    RAY * U256::from(numerator) / U256::from(denominator)
}

fn market_store() -> LedgerStore {
    LedgerStore::from_snapshot(LedgerSnapshot {
        market: Market {
            id: MarketId::new(1),
            chain_id: 1,
            pool: addr(POOL),
            active: true,
            start_block: 100,
            last_processed_block: None,
            gho: GhoConfig {
                discount_token: Some(addr(STK)),
                discount_rate_strategy: Some(addr(0x71)),
            },
            paused_reason: None,
        },
        assets: vec![
            Asset::new(addr(WETH), addr(A_WETH), addr(V_WETH), 1, 1, false),
            Asset::new(addr(GHO), addr(0x61), addr(V_GHO), 1, 2, true),
        ],
        users: Vec::new(),
        positions: Vec::new(),
        gho_users: Vec::new(),
        revisions: Vec::new(),
    })
}

fn event(emitter: u8, block: u64, log_index: u64, event: DomainEvent) -> DecodedEvent {
    DecodedEvent {
        emitter: addr(emitter),
        block_number: block,
        log_index,
        tx_hash: B256::left_padding_from(&(block * 1000 + log_index).to_be_bytes()),
        event,
    }
}

fn mint(token: u8, block: u64, user: u8, value: U256, balance_increase: U256, index: U256) -> DecodedEvent {
    event(
        token,
        block,
        0,
        DomainEvent::Mint {
            caller: addr(user),
            on_behalf_of: addr(user),
            value,
            balance_increase,
            index,
        },
    )
}

fn burn(token: u8, block: u64, user: u8, value: U256, balance_increase: U256, index: U256) -> DecodedEvent {
    event(
        token,
        block,
        0,
        DomainEvent::Burn {
            from: addr(user),
            target: addr(user),
            value,
            balance_increase,
            index,
        },
    )
}

fn reserve_update(block: u64, asset: u8, liquidity_index: U256, variable_borrow_index: U256) -> DecodedEvent {
    event(
        POOL,
        block,
        1,
        DomainEvent::ReserveDataUpdated {
            asset: addr(asset),
            liquidity_rate: U256::ZERO,
            stable_borrow_rate: U256::ZERO,
            variable_borrow_rate: U256::ZERO,
            liquidity_index,
            variable_borrow_index,
        },
    )
}

fn discount_transfer(block: u64, log_index: u64, from: Address, to: Address, amount: U256) -> DecodedEvent {
    event(
        STK,
        block,
        log_index,
        DomainEvent::BalanceTransfer {
            from,
            to,
            amount,
            index: None,
        },
    )
}

/// Apply the events of `[start, end]` to a fresh scope over `ledger`.
///
/// Holders first seen in the chunk read a zero discount-token balance.
fn apply_chunk(ledger: &LedgerStore, events: &[DecodedEvent], start: u64, end: u64) -> Result<MutationSet, SyncError> {
    let chunk: Vec<DecodedEvent> = events
        .iter()
        .filter(|e| e.block_number >= start && e.block_number <= end)
        .cloned()
        .collect();
    let discount_balances: DiscountBalances = discount_balance_reads(ledger, &chunk)
        .into_iter()
        .map(|read| (read, U256::ZERO))
        .collect();
    let strategy = GhoDiscountRateStrategy::default();
    let verbose = VerboseFilter::default();
    let ctx = ApplyContext {
        strategy: &strategy,
        verbose: &verbose,
        discount_balances: &discount_balances,
    };

    let mut scope = ledger.begin_chunk(start, end);
    for e in &chunk {
        apply_event(&mut scope, e, &ctx)?;
    }
    Ok(scope.into_mutations())
}

/// Apply `events` in chunks of `chunk_size` blocks over `[from, to]`.
fn replay(events: &[DecodedEvent], from: u64, to: u64, chunk_size: u64) -> Result<LedgerStore, SyncError> {
    let mut ledger = market_store();
    let mut start = from;
    while start <= to {
        let end = to.min(start + chunk_size - 1);
        let mutations = apply_chunk(&ledger, events, start, end)?;
        ledger.apply_mutations(&mutations);
        ledger.advance_checkpoint(end);
        start = end + 1;
    }
    Ok(ledger)
}

fn mixed_history() -> Vec<DecodedEvent> {
    vec![
        discount_transfer(100, 0, Address::ZERO, addr(ALICE), wad(3)),
        mint(A_WETH, 101, ALICE, wad(1000), U256::ZERO, RAY),
        mint(V_WETH, 102, BOB, wad(400), U256::ZERO, RAY),
        mint(V_GHO, 103, ALICE, wad(500), U256::ZERO, RAY),
        reserve_update(104, WETH, ray_fraction(102, 100), ray_fraction(105, 100)),
        reserve_update(104, GHO, RAY, ray_fraction(103, 100)).with_log_index(2),
        event(
            A_WETH,
            105,
            0,
            DomainEvent::BalanceTransfer {
                from: addr(ALICE),
                to: addr(BOB),
                amount: wad(100),
                index: Some(ray_fraction(102, 100)),
            },
        ),
        discount_transfer(106, 0, addr(ALICE), addr(BOB), wad(1)),
        reserve_update(107, WETH, ray_fraction(104, 100), ray_fraction(110, 100)),
        burn(A_WETH, 108, ALICE, wad(200), wad(17), ray_fraction(104, 100)),
        mint(V_WETH, 109, BOB, wad(50), wad(40), ray_fraction(110, 100)),
        reserve_update(110, GHO, RAY, ray_fraction(106, 100)),
        burn(V_GHO, 111, ALICE, wad(100), wad(20), ray_fraction(106, 100)),
        discount_transfer(112, 0, addr(BOB), addr(ALICE), wad(1)),
    ]
}

trait WithLogIndex {
    fn with_log_index(self, log_index: u64) -> Self;
}

impl WithLogIndex for DecodedEvent {
    fn with_log_index(mut self, log_index: u64) -> Self {
        self.log_index = log_index;
        self
    }
}

#[test]
fn test_final_state_is_independent_of_chunk_boundaries() {
    let events = mixed_history();
    let single = replay(&events, 100, 112, 1000).unwrap().snapshot();

    for chunk_size in [1, 2, 3, 5] {
        let chunked = replay(&events, 100, 112, chunk_size).unwrap().snapshot();
        assert_eq!(chunked.assets, single.assets, "assets differ at chunk size {chunk_size}");
        assert_eq!(chunked.users, single.users, "users differ at chunk size {chunk_size}");
        assert_eq!(chunked.positions, single.positions, "positions differ at chunk size {chunk_size}");
        assert_eq!(chunked.gho_users, single.gho_users, "GHO state differs at chunk size {chunk_size}");
        assert_eq!(chunked.market.last_processed_block, Some(112));
    }
}

#[test]
fn test_discount_transfer_preserves_total_interest() {
    let events = vec![
        discount_transfer(100, 0, Address::ZERO, addr(ALICE), wad(10)),
        discount_transfer(100, 1, Address::ZERO, addr(BOB), wad(10)),
        mint(V_GHO, 101, ALICE, wad(1000), U256::ZERO, RAY),
        mint(V_GHO, 102, BOB, wad(1000), U256::ZERO, RAY),
        reserve_update(110, GHO, RAY, ray_fraction(110, 100)),
        discount_transfer(111, 0, addr(ALICE), addr(BOB), wad(5)),
    ];
    let ledger = replay(&events, 100, 111, 1000).unwrap();

    // 1000 * 0.1 accrued by each borrower, 30% of it discounted.
    let per_user = wad(70);
    let alice = ledger.gho_user(&addr(ALICE)).unwrap();
    let bob = ledger.gho_user(&addr(BOB)).unwrap();
    assert_eq!(alice.accumulated_debt_interest, per_user);
    assert_eq!(bob.accumulated_debt_interest, per_user);

    // Bob now covers his debt; Alice's 5 tokens cover under half of hers.
    assert_eq!(bob.discount_percent.bps(), 3000);
    assert!(alice.discount_percent.bps() > 0 && alice.discount_percent.bps() < 3000);

    let alice_debt = ledger
        .position(&PositionKey::debt(addr(ALICE), addr(GHO)))
        .unwrap();
    assert_eq!(alice_debt.last_index, ray_fraction(110, 100));
    assert!(alice_debt.scaled_balance < wad(1000));

    // A second transfer with no index movement accrues nothing.
    let mut events = events;
    events.push(discount_transfer(112, 0, addr(BOB), addr(ALICE), wad(1)));
    let ledger = replay(&events, 100, 112, 1000).unwrap();
    let total: U256 = ledger
        .snapshot()
        .gho_users
        .iter()
        .map(|g| g.accumulated_debt_interest)
        .fold(U256::ZERO, |acc, v| acc + v);
    assert_eq!(total, per_user * U256::from(2u64));
}

#[test]
fn test_discount_stays_within_strategy_bounds() {
    let mut events = vec![discount_transfer(100, 0, Address::ZERO, addr(ALICE), wad(1))];
    for (i, block) in (101..=110u64).enumerate() {
        events.push(mint(V_GHO, block, ALICE, wad(100 * (i as u64 + 1)), U256::ZERO, RAY));
    }
    let ledger = replay(&events, 100, 110, 3).unwrap();

    let state = ledger.gho_user(&addr(ALICE)).unwrap();
    let strategy = GhoDiscountRateStrategy::default();
    assert!(state.discount_percent.bps() <= strategy.discount_rate);
    // 1 token covers 100 of the 5500 borrowed
    assert_eq!(state.discount_percent.bps(), (100u64 * 3000 / 5500) as u16);
}

#[test]
fn test_withdraw_beyond_balance_aborts_the_chunk() {
    let events = vec![
        mint(A_WETH, 100, ALICE, wad(10), U256::ZERO, RAY),
        burn(A_WETH, 101, ALICE, wad(11), U256::ZERO, RAY),
    ];
    let err = replay(&events, 100, 101, 1000).unwrap_err();
    assert!(matches!(err, SyncError::Invariant(_)));

    // Split across chunks, the first chunk still lands and the second fails.
    let mut ledger = market_store();
    let mutations = apply_chunk(&ledger, &events, 100, 100).unwrap();
    ledger.apply_mutations(&mutations);

    assert!(apply_chunk(&ledger, &events, 101, 101).is_err());
    let position = ledger
        .position(&PositionKey::collateral(addr(ALICE), addr(WETH)))
        .unwrap();
    assert_eq!(position.scaled_balance, wad(10));
}

#[test]
fn test_reapplied_chunk_with_index_growth_is_rejected() {
    let events = vec![
        mint(A_WETH, 100, ALICE, wad(100), U256::ZERO, RAY),
        reserve_update(101, WETH, ray_fraction(101, 100), RAY),
        mint(A_WETH, 101, ALICE, wad(11), wad(1), ray_fraction(101, 100)),
    ];
    let mut ledger = market_store();
    let mutations = apply_chunk(&ledger, &events, 100, 101).unwrap();
    ledger.apply_mutations(&mutations);

    // Same chunk again with the checkpoint left behind: the first mint is
    // older than the snapshot it would land on.
    let err = apply_chunk(&ledger, &events, 100, 101).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Invariant(LedgerInvariantViolation::PositionIndexRegression { key, .. })
            if key == PositionKey::collateral(addr(ALICE), addr(WETH))
    ));
}

#[tokio::test]
async fn test_reapplied_chunk_at_flat_index_fails_verification() {
    let events = vec![mint(A_WETH, 100, ALICE, wad(100), U256::ZERO, RAY)];
    let chain = MockChainReader::new()
        .with_scaled_balance(addr(A_WETH), addr(ALICE), 100, wad(100))
        .with_previous_index(addr(A_WETH), addr(ALICE), 100, RAY);
    let verifier = Verifier::new(Arc::new(chain), RetryPolicy::default());

    let mut ledger = market_store();
    let mutations = apply_chunk(&ledger, &events, 100, 100).unwrap();
    let pending = verify::plan(&ledger, &mutations, 0);
    ledger.apply_mutations(&mutations);
    assert!(verifier.verify(&ledger, &pending).await.is_ok());

    // Nothing in the ledger rejects the repeat; the chain read does.
    let mutations = apply_chunk(&ledger, &events, 100, 100).unwrap();
    let pending = verify::plan(&ledger, &mutations, 0);
    ledger.apply_mutations(&mutations);
    let position = ledger
        .position(&PositionKey::collateral(addr(ALICE), addr(WETH)))
        .unwrap();
    assert_eq!(position.scaled_balance, wad(200));

    match verifier.verify(&ledger, &pending).await {
        Err(SyncError::Inconsistency(err)) => {
            assert_eq!(err.field, VerifiedField::ScaledBalance);
            assert_eq!(err.expected, wad(200));
            assert_eq!(err.on_chain, wad(100));
        }
        other => panic!("expected an inconsistency, got {other:?}"),
    }
}
