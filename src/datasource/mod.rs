//! Chain access: the Log Source that feeds sync and the contract reads used
//! by reconciliation.

use crate::domain::{Address, RawEventRecord, B256, U256};
use async_trait::async_trait;
use std::fmt;

pub mod mock;
pub mod rpc;

pub use mock::{MockChainReader, MockLogSource};
pub use rpc::JsonRpcClient;

/// Contracts and topics a market needs logs for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Emitting contracts; empty means any.
    pub addresses: Vec<Address>,
    /// Accepted topic-0 values; empty means any.
    pub topics: Vec<B256>,
}

impl LogFilter {
    pub fn matches(&self, record: &RawEventRecord) -> bool {
        let address_ok = self.addresses.is_empty() || self.addresses.contains(&record.address);
        let topic_ok = self.topics.is_empty()
            || record
                .topics
                .first()
                .map(|t| self.topics.contains(t))
                .unwrap_or(false);
        address_ok && topic_ok
    }
}

/// Source of raw log records.
///
/// Implementations return every matching record in `[from_block, to_block]`;
/// ordering is not required, the controller sorts by (block, log index).
#[async_trait]
pub trait LogSource: Send + Sync + fmt::Debug {
    async fn fetch(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEventRecord>, DataSourceError>;

    /// Latest block the source can serve.
    async fn head_block(&self) -> Result<u64, DataSourceError>;
}

/// Historical contract reads at a specific block.
#[async_trait]
pub trait ChainReader: Send + Sync + fmt::Debug {
    /// `scaledBalanceOf(user)` on a collateral or debt token.
    async fn scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError>;

    /// `getPreviousIndex(user)`: the index stored at the user's last balance change.
    async fn previous_index(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError>;

    /// `getDiscountPercent(user)` on the discount-eligible debt token.
    async fn discount_percent(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError>;

    /// ERC-20 `balanceOf(user)` on the discount token.
    async fn discount_token_balance(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError>;
}

/// Error type for data source operations.
#[derive(Debug, Clone)]
pub enum DataSourceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 5xx server error)
    HttpError { status: u16, message: String },
    /// JSON-RPC error object returned by the node
    Rpc { code: i64, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Rate limit exceeded (caller should implement backoff)
    RateLimited,
    /// Other error
    Other(String),
}

impl DataSourceError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DataSourceError::NetworkError(_) | DataSourceError::RateLimited => true,
            DataSourceError::HttpError { status, .. } => *status == 429 || *status >= 500,
            // -32000 covers "header not found" on lagging nodes, -32005 is
            // the common "limit exceeded" code.
            DataSourceError::Rpc { code, .. } => matches!(code, -32000 | -32005 | -32603),
            DataSourceError::ParseError(_) | DataSourceError::Other(_) => false,
        }
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DataSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            DataSourceError::Rpc { code, message } => write!(f, "RPC error {}: {}", code, message),
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited => write!(f, "Rate limited"),
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datasource_error_display() {
        let err = DataSourceError::NetworkError("connection timeout".to_string());
        assert_eq!(err.to_string(), "Network error: connection timeout");

        let err = DataSourceError::HttpError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 503: Service unavailable");

        let err = DataSourceError::Rpc {
            code: -32005,
            message: "query returned more than 10000 results".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "RPC error -32005: query returned more than 10000 results"
        );

        let err = DataSourceError::RateLimited;
        assert_eq!(err.to_string(), "Rate limited");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DataSourceError::RateLimited.is_transient());
        assert!(DataSourceError::NetworkError("reset".to_string()).is_transient());
        assert!(DataSourceError::HttpError {
            status: 502,
            message: String::new()
        }
        .is_transient());
        assert!(!DataSourceError::HttpError {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!DataSourceError::Rpc {
            code: 3,
            message: "execution reverted".to_string()
        }
        .is_transient());
        assert!(!DataSourceError::ParseError("bad hex".to_string()).is_transient());
    }

    #[test]
    fn test_log_filter_matches() {
        let record = RawEventRecord {
            address: Address::repeat_byte(1),
            topics: vec![B256::repeat_byte(9)],
            data: vec![],
            block_number: 1,
            log_index: 0,
            tx_hash: B256::ZERO,
        };
        assert!(LogFilter::default().matches(&record));
        let filter = LogFilter {
            addresses: vec![Address::repeat_byte(1)],
            topics: vec![B256::repeat_byte(9)],
        };
        assert!(filter.matches(&record));
        let filter = LogFilter {
            addresses: vec![Address::repeat_byte(2)],
            topics: vec![],
        };
        assert!(!filter.matches(&record));
    }
}
