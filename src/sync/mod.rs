//! Chunked synchronization of one market: event application, the chunk
//! controller, reconciliation against live contract reads, and retries.

pub mod apply;
pub mod controller;
pub mod retry;
pub mod store;
pub mod verify;

pub use apply::{apply_event, discount_balance_reads, ApplyContext, DiscountBalanceRead, DiscountBalances};
pub use controller::{SyncConfig, SyncController, SyncMode, SyncReport};
pub use retry::RetryPolicy;
pub use store::{DurableStore, StoredMarket};
pub use verify::{PendingChunk, VerificationStatus, Verifier};
