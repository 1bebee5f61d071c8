//! Domain types and determinism layer for the lending ledger.
//!
//! This module provides:
//! - EVM word primitives (Address, B256, U256) and MarketId
//! - Raw log records and the closed set of typed lending events
//! - Ledger entities: markets, assets, users, positions, discount state
//! - Stable (block, log index) ordering for deterministic processing

pub mod event;
pub mod market;
pub mod ordering;
pub mod primitives;

pub use event::{DecodedEvent, DomainEvent, RawEventRecord};
pub use market::{
    Asset, ContractRevision, DiscountPercent, GhoConfig, GhoUserState, Market, Position,
    PositionKey, PositionKind, ScaledDelta, TokenRole, User,
};
pub use ordering::{find_duplicate_position, sort_events_deterministic, EventPosition};
pub use primitives::{Address, MarketId, B256, U256};
