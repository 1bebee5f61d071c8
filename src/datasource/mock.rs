//! Mock chain access for testing without network calls.

use super::{ChainReader, DataSourceError, LogFilter, LogSource};
use crate::domain::{Address, RawEventRecord, U256};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Mock log source that serves predefined records.
#[derive(Debug, Clone)]
pub struct MockLogSource {
    records: Arc<Mutex<Vec<RawEventRecord>>>,
    head: u64,
    /// Number of upcoming `fetch` calls that fail transiently.
    failures: Arc<AtomicU32>,
    fetch_calls: Arc<AtomicU32>,
}

impl MockLogSource {
    /// Create a new mock log source with no records.
    pub fn new(head: u64) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            head,
            failures: Arc::new(AtomicU32::new(0)),
            fetch_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Add a record to the mock log source.
    pub fn with_record(self, record: RawEventRecord) -> Self {
        self.push(record);
        self
    }

    /// Add multiple records to the mock log source.
    pub fn with_records(self, records: Vec<RawEventRecord>) -> Self {
        for record in records {
            self.push(record);
        }
        self
    }

    /// Fail the next `count` fetches with a rate-limit error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    /// Append a record after construction; clones share the record list.
    pub fn push(&self, record: RawEventRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSource for MockLogSource {
    async fn fetch(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEventRecord>, DataSourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(DataSourceError::RateLimited);
        }

        let records = self
            .records
            .lock()
            .map_err(|_| DataSourceError::Other("mock record list poisoned".to_string()))?;
        Ok(records
            .iter()
            .filter(|r| r.block_number >= from_block && r.block_number <= to_block)
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn head_block(&self) -> Result<u64, DataSourceError> {
        Ok(self.head)
    }
}

type ValueHistory = HashMap<(Address, Address), BTreeMap<u64, U256>>;

/// Mock contract reader with block-indexed values.
///
/// A read at block `b` returns the latest value set at or before `b`, or zero.
#[derive(Debug, Clone, Default)]
pub struct MockChainReader {
    scaled_balances: ValueHistory,
    previous_indices: ValueHistory,
    discount_percents: ValueHistory,
    discount_token_balances: ValueHistory,
    failures: Arc<AtomicU32>,
}

impl MockChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scaled_balance(mut self, token: Address, user: Address, block: u64, value: U256) -> Self {
        self.scaled_balances
            .entry((token, user))
            .or_default()
            .insert(block, value);
        self
    }

    pub fn with_previous_index(mut self, token: Address, user: Address, block: u64, value: U256) -> Self {
        self.previous_indices
            .entry((token, user))
            .or_default()
            .insert(block, value);
        self
    }

    pub fn with_discount_percent(mut self, token: Address, user: Address, block: u64, value: U256) -> Self {
        self.discount_percents
            .entry((token, user))
            .or_default()
            .insert(block, value);
        self
    }

    pub fn with_discount_token_balance(mut self, token: Address, user: Address, block: u64, value: U256) -> Self {
        self.discount_token_balances
            .entry((token, user))
            .or_default()
            .insert(block, value);
        self
    }

    /// Fail the next `count` reads with a network error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    fn read(
        &self,
        history: &ValueHistory,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        if take_failure(&self.failures) {
            return Err(DataSourceError::NetworkError("connection reset".to_string()));
        }
        Ok(history
            .get(&(token, user))
            .and_then(|values| values.range(..=block).next_back())
            .map(|(_, value)| *value)
            .unwrap_or(U256::ZERO))
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.read(&self.scaled_balances, token, user, block)
    }

    async fn previous_index(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.read(&self.previous_indices, token, user, block)
    }

    async fn discount_percent(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.read(&self.discount_percents, token, user, block)
    }

    async fn discount_token_balance(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, DataSourceError> {
        self.read(&self.discount_token_balances, token, user, block)
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
