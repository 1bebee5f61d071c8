//! Pure computation engine(s) for deterministic ledger logic.
//!
//! Nothing here performs I/O or owns ledger state.

pub mod accrual;
pub mod decoder;
pub mod discount;
pub mod math;
pub mod revision;

pub use accrual::{
    AccrualError, AccrualOutcome, Operation, PositionSnapshot, TransferSide,
};
pub use decoder::{DecodeContext, EventDecoder};
pub use discount::GhoDiscountRateStrategy;
pub use math::{MathError, RAY, WAD};
pub use revision::{AccrualRules, DiscountRules, VersionResolver};
