//! Domain primitives: MarketId, Address/B256/U256 re-exports, word helpers.

pub use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Durable identifier of a lending market deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub i64);

impl MarketId {
    /// Create a MarketId from its row id.
    pub fn new(id: i64) -> Self {
        MarketId(id)
    }

    /// Get the underlying row id.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "market#{}", self.0)
    }
}

/// Read a 32-byte word as an address, requiring the upper 12 bytes to be zero.
pub fn word_to_address(word: &B256) -> Option<Address> {
    let bytes = word.as_slice();
    if bytes[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&bytes[12..]))
}

/// Left-pad an address into a 32-byte word.
pub fn address_to_word(address: &Address) -> B256 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    B256::from(word)
}

/// Narrow a word to u64, `None` if it does not fit.
pub fn u256_to_u64(value: U256) -> Option<u64> {
    u64::try_from(value).ok()
}
