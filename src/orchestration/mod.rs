//! Multi-market driver.

pub mod orchestrator;

pub use orchestrator::{MarketOutcome, Orchestrator};
