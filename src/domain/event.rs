//! Raw log records and the closed set of typed lending events.

use super::ordering::EventPosition;
use super::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// One log entry as supplied by a Log Source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

impl RawEventRecord {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }
}

/// Typed lending event.
///
/// `BalanceTransfer` with `index: None` is a discount-token transfer; the
/// scaled-token variant always carries the index it was emitted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    ReserveDataUpdated {
        asset: Address,
        liquidity_rate: U256,
        stable_borrow_rate: U256,
        variable_borrow_rate: U256,
        liquidity_index: U256,
        variable_borrow_index: U256,
    },
    Mint {
        caller: Address,
        on_behalf_of: Address,
        value: U256,
        balance_increase: U256,
        index: U256,
    },
    Burn {
        from: Address,
        target: Address,
        value: U256,
        balance_increase: U256,
        index: U256,
    },
    BalanceTransfer {
        from: Address,
        to: Address,
        amount: U256,
        index: Option<U256>,
    },
    UserEModeSet {
        user: Address,
        category_id: u8,
    },
    Upgraded {
        implementation: Address,
        new_revision: u32,
    },
    DiscountTokenUpdated {
        old_address: Address,
        new_address: Address,
    },
    DiscountRateStrategyUpdated {
        old_address: Address,
        new_address: Address,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ReserveDataUpdated { .. } => "ReserveDataUpdated",
            DomainEvent::Mint { .. } => "Mint",
            DomainEvent::Burn { .. } => "Burn",
            DomainEvent::BalanceTransfer { index: Some(_), .. } => "BalanceTransfer",
            DomainEvent::BalanceTransfer { index: None, .. } => "DiscountTokenTransfer",
            DomainEvent::UserEModeSet { .. } => "UserEModeSet",
            DomainEvent::Upgraded { .. } => "Upgraded",
            DomainEvent::DiscountTokenUpdated { .. } => "DiscountTokenUpdated",
            DomainEvent::DiscountRateStrategyUpdated { .. } => "DiscountRateStrategyUpdated",
        }
    }

    /// User addresses whose state the event can touch.
    pub fn users(&self) -> Vec<Address> {
        match self {
            DomainEvent::Mint { on_behalf_of, .. } => vec![*on_behalf_of],
            DomainEvent::Burn { from, .. } => vec![*from],
            DomainEvent::BalanceTransfer { from, to, .. } => vec![*from, *to],
            DomainEvent::UserEModeSet { user, .. } => vec![*user],
            _ => Vec::new(),
        }
    }
}

/// A typed event with the chain context of the record it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Contract that emitted the log.
    pub emitter: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
    pub event: DomainEvent,
}

impl DecodedEvent {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }
}
