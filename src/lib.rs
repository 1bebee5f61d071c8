pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod orchestration;
pub mod sync;

pub use config::{Config, VerboseFilter};
pub use datasource::{ChainReader, DataSourceError, JsonRpcClient, LogSource};
pub use db::{init_db, Repository};
pub use domain::{Address, DecodedEvent, DomainEvent, MarketId, RawEventRecord, B256, U256};
pub use error::SyncError;
pub use ledger::LedgerStore;
pub use orchestration::Orchestrator;
pub use sync::{SyncController, SyncMode, SyncReport};
