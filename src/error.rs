//! Error taxonomy of the replication engine.
//!
//! Decode, version, arithmetic and invariant errors abort the chunk before
//! anything is written. Inconsistency errors are raised after a commit and
//! pause the market. Transient I/O errors are retried, then surfaced.

use crate::datasource::DataSourceError;
use crate::domain::{Address, EventPosition, MarketId, PositionKey, ScaledDelta, TokenRole, B256, U256};
use crate::engine::math::MathError;
use serde::Serialize;
use thiserror::Error;

/// A raw record that does not decode into a known event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode log {log_index} of tx {tx_hash} (block {block_number}): {reason}")]
pub struct DecodeError {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub reason: DecodeFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("log has no topics")]
    MissingTopics,
    #[error("unknown event signature {0}")]
    UnknownSignature(B256),
    #[error("{event}: expected {expected} topics, found {found}")]
    TopicCount {
        event: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{event}: expected {expected} data bytes, found {found}")]
    DataLength {
        event: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{event}: topic {topic} is not a left-padded address")]
    InvalidAddress { event: &'static str, topic: usize },
    #[error("{event}: field {field} is out of range")]
    FieldRange {
        event: &'static str,
        field: &'static str,
    },
}

/// A token revision with no registered math rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no accrual rules for {role} token {token} at revision {revision}")]
pub struct VersionResolutionError {
    pub token: Address,
    pub role: TokenRole,
    pub revision: u32,
}

/// Overflow, underflow or division by zero while applying an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("arithmetic failure applying {event} at {position} (tx {tx_hash}): {source}")]
pub struct AccrualArithmeticError {
    pub event: &'static str,
    pub tx_hash: B256,
    pub position: EventPosition,
    pub source: MathError,
}

/// A mutation that would leave the ledger in an illegal state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerInvariantViolation {
    #[error("scaled balance of {key} would go negative: balance {balance}, delta {delta}")]
    NegativeBalance {
        key: PositionKey,
        balance: U256,
        delta: ScaledDelta,
    },
    #[error("{index_name} of asset {asset} would regress from {current} to {attempted}")]
    IndexRegression {
        asset: Address,
        index_name: &'static str,
        current: U256,
        attempted: U256,
    },
    #[error("index snapshot of {key} would regress from {current} to {attempted}")]
    PositionIndexRegression {
        key: PositionKey,
        current: U256,
        attempted: U256,
    },
    #[error("event at {position} is at or below checkpoint {checkpoint}")]
    StaleEvent {
        position: EventPosition,
        checkpoint: u64,
    },
    #[error("event at {position} is outside the fetched range {from}..={to}")]
    OutOfRange {
        position: EventPosition,
        from: u64,
        to: u64,
    },
    #[error("duplicate event position {0}")]
    DuplicateEvent(EventPosition),
    #[error("revision of {token} would move backwards from {current} to {attempted}")]
    RevisionRegression {
        token: Address,
        current: u32,
        attempted: u32,
    },
    #[error("{event} emitted by unknown contract {address}")]
    UnknownContract {
        event: &'static str,
        address: Address,
    },
    #[error("unknown asset {0}")]
    UnknownAsset(Address),
    #[error("{role} token {token} cannot emit {event}")]
    UnexpectedEvent {
        event: &'static str,
        token: Address,
        role: TokenRole,
    },
    #[error("discount configuration missing: {0}")]
    MissingDiscountConfig(&'static str),
    #[error("discount-token balance of {user} would go negative: balance {balance}, transfer {amount}")]
    DiscountTokenUnderflow {
        user: Address,
        balance: U256,
        amount: U256,
    },
    #[error("discount-token balance of {user} was never read for token {token:?}")]
    UnseededDiscountBalance {
        user: Address,
        token: Option<Address>,
    },
    #[error("discount percent {0} exceeds 10000 bps")]
    DiscountOutOfRange(U256),
    #[error("counter overflow on {0}")]
    CounterOverflow(String),
}

/// Ledger field compared against a live contract read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifiedField {
    ScaledBalance,
    PreviousIndex,
    DiscountPercent,
}

impl std::fmt::Display for VerifiedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifiedField::ScaledBalance => f.write_str("scaled balance"),
            VerifiedField::PreviousIndex => f.write_str("previous index"),
            VerifiedField::DiscountPercent => f.write_str("discount percent"),
        }
    }
}

/// Committed ledger state disagrees with on-chain state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error(
    "{market}: {field} mismatch for user {user} on token {token} (asset {asset}): \
     ledger {expected}, on-chain {on_chain} at block {verified_block} \
     (last touched by tx {tx_hash} in block {block})"
)]
pub struct LedgerInconsistencyError {
    pub market: MarketId,
    pub tx_hash: B256,
    pub block: u64,
    pub verified_block: u64,
    pub user: Address,
    pub asset: Address,
    pub token: Address,
    pub field: VerifiedField,
    pub expected: U256,
    pub on_chain: U256,
}

/// Umbrella error returned by sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    VersionResolution(#[from] VersionResolutionError),
    #[error(transparent)]
    AccrualArithmetic(#[from] AccrualArithmeticError),
    #[error(transparent)]
    Invariant(#[from] LedgerInvariantViolation),
    #[error(transparent)]
    Inconsistency(Box<LedgerInconsistencyError>),
    #[error("transient I/O failure in {operation} after {attempts} attempt(s): {source}")]
    TransientIo {
        operation: &'static str,
        attempts: u32,
        source: DataSourceError,
    },
    #[error("data source failure in {operation}: {source}")]
    DataSource {
        operation: &'static str,
        source: DataSourceError,
    },
    #[error("{market} is paused pending investigation: {reason}")]
    MarketPaused { market: MarketId, reason: String },
    #[error("{0} not found")]
    MarketNotFound(MarketId),
    #[error("stored value is corrupt: {0}")]
    CorruptStore(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl SyncError {
    /// True for failures that leave the checkpoint untouched and can be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo { .. })
    }
}

impl From<LedgerInconsistencyError> for SyncError {
    fn from(err: LedgerInconsistencyError) -> Self {
        SyncError::Inconsistency(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display_carries_location() {
        let err = DecodeError {
            tx_hash: B256::repeat_byte(0x11),
            log_index: 4,
            block_number: 99,
            reason: DecodeFailure::MissingTopics,
        };
        let text = err.to_string();
        assert!(text.contains("log 4"));
        assert!(text.contains("block 99"));
        assert!(text.contains("no topics"));
    }

    #[test]
    fn test_retryable_classification() {
        let transient = SyncError::TransientIo {
            operation: "fetch_logs",
            attempts: 3,
            source: DataSourceError::RateLimited,
        };
        assert!(transient.is_retryable());

        let invariant: SyncError = LedgerInvariantViolation::UnknownAsset(Address::ZERO).into();
        assert!(!invariant.is_retryable());
    }

    #[test]
    fn test_inconsistency_converts_boxed() {
        let err = LedgerInconsistencyError {
            market: MarketId::new(1),
            tx_hash: B256::ZERO,
            block: 10,
            verified_block: 12,
            user: Address::ZERO,
            asset: Address::ZERO,
            token: Address::ZERO,
            field: VerifiedField::ScaledBalance,
            expected: U256::from(5u64),
            on_chain: U256::from(6u64),
        };
        let sync: SyncError = err.into();
        assert!(matches!(sync, SyncError::Inconsistency(_)));
        assert!(sync.to_string().contains("scaled balance mismatch"));
    }
}
