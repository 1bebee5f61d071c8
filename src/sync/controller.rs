//! Chunked Sync Controller.
//!
//! One controller per market. A sync run loads the committed state, finishes
//! any chunk left pending by an earlier run, then walks
//! `[checkpoint + 1, target]` in chunks. Each chunk is fetched, decoded and
//! applied inside a [`ChunkScope`](crate::ledger::ChunkScope), committed with
//! its verification plan, verified, and only then checkpointed.

use super::apply::{apply_event, discount_balance_reads, ApplyContext, DiscountBalances};
use super::retry::RetryPolicy;
use super::store::DurableStore;
use super::verify::{self, PendingChunk, VerificationStatus, Verifier};
use crate::config::VerboseFilter;
use crate::datasource::{ChainReader, LogFilter, LogSource};
use crate::domain::{find_duplicate_position, sort_events_deterministic, Address, DecodedEvent, MarketId};
use crate::engine::decoder::topics;
use crate::engine::{DecodeContext, EventDecoder, GhoDiscountRateStrategy};
use crate::error::{LedgerInvariantViolation, SyncError};
use crate::ledger::{LedgerStore, MutationSet};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Run chunks until the target block.
    Continuous,
    /// Process exactly one chunk and stop.
    OneChunk,
}

/// Per-market controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub chunk_size: u64,
    /// Last block to sync; the chain head when unset.
    pub target_block: Option<u64>,
    /// Verification targets per chunk, zero for all.
    pub verify_sample_size: usize,
    pub retry: RetryPolicy,
    pub verbose: VerboseFilter,
    pub strategy: GhoDiscountRateStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            chunk_size: 5000,
            target_block: None,
            verify_sample_size: 16,
            retry: RetryPolicy::default(),
            verbose: VerboseFilter::default(),
            strategy: GhoDiscountRateStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub market: MarketId,
    /// Checkpoint when the run ended.
    pub checkpoint: Option<u64>,
    pub blocks_processed: u64,
    pub events_applied: usize,
    pub chunks: usize,
    /// Outcome of the last verification in this run.
    pub verification_status: VerificationStatus,
}

impl SyncReport {
    fn new(market: MarketId, checkpoint: Option<u64>) -> Self {
        SyncReport {
            market,
            checkpoint,
            blocks_processed: 0,
            events_applied: 0,
            chunks: 0,
            verification_status: VerificationStatus::NothingToVerify,
        }
    }
}

pub struct SyncController {
    market: MarketId,
    source: Arc<dyn LogSource>,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn DurableStore>,
    verifier: Verifier,
    config: SyncConfig,
}

impl SyncController {
    pub fn new(
        market: MarketId,
        source: Arc<dyn LogSource>,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn DurableStore>,
        config: SyncConfig,
    ) -> Self {
        let verifier = Verifier::new(Arc::clone(&reader), config.retry.clone());
        SyncController {
            market,
            source,
            reader,
            store,
            verifier,
            config,
        }
    }

    pub fn market(&self) -> MarketId {
        self.market
    }

    /// Sync the market in `mode`.
    ///
    /// Continuous and single-chunk runs share this path and differ only in
    /// when they stop. A pending chunk from an earlier run counts as the one
    /// chunk of a single-chunk run.
    pub async fn sync(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let stored = self.store.load_market_state(self.market).await?;
        let mut ledger = LedgerStore::from_snapshot(stored.snapshot);
        if let Some(reason) = &ledger.market().paused_reason {
            return Err(SyncError::MarketPaused {
                market: self.market,
                reason: reason.clone(),
            });
        }

        let mut report = SyncReport::new(self.market, ledger.checkpoint());
        if let Some(pending) = stored.pending {
            info!(
                market = %self.market,
                from_block = pending.from_block,
                to_block = pending.to_block,
                "re-verifying pending chunk"
            );
            report.verification_status = self.verify_and_advance(&mut ledger, &pending).await?;
            report.checkpoint = ledger.checkpoint();
            if mode == SyncMode::OneChunk {
                return Ok(report);
            }
        }

        let target = match self.config.target_block {
            Some(block) => block,
            None => {
                self.config
                    .retry
                    .run("eth_blockNumber", || self.source.head_block())
                    .await?
            }
        };
        let chunk_size = self.config.chunk_size.max(1);

        loop {
            let from_block = ledger.market().next_block();
            if from_block > target {
                debug!(market = %self.market, target, "target reached");
                break;
            }
            let to_block = target.min(from_block.saturating_add(chunk_size - 1));

            let (mutations, status) = self.run_chunk(&mut ledger, from_block, to_block).await?;
            report.blocks_processed += mutations.block_count();
            report.events_applied += mutations.events_applied;
            report.chunks += 1;
            report.verification_status = status;
            report.checkpoint = ledger.checkpoint();

            if mode == SyncMode::OneChunk {
                break;
            }
        }

        info!(
            market = %self.market,
            checkpoint = ?report.checkpoint,
            chunks = report.chunks,
            blocks = report.blocks_processed,
            events = report.events_applied,
            "sync finished"
        );
        Ok(report)
    }

    async fn run_chunk(
        &self,
        ledger: &mut LedgerStore,
        from_block: u64,
        to_block: u64,
    ) -> Result<(MutationSet, VerificationStatus), SyncError> {
        info!(market = %self.market, from_block, to_block, "chunk started");

        let mut discount_tokens: Vec<Address> = ledger.market().gho.discount_token.into_iter().collect();
        let mut discount_balances = DiscountBalances::new();
        let mut rerun = false;
        let mutations = loop {
            let events = self
                .fetch_events(ledger, from_block, to_block, &discount_tokens)
                .await?;
            self.read_discount_balances(ledger, &events, &mut discount_balances)
                .await?;

            let ctx = ApplyContext {
                strategy: &self.config.strategy,
                verbose: &self.config.verbose,
                discount_balances: &discount_balances,
            };
            let mut scope = ledger.begin_chunk(from_block, to_block);
            for event in &events {
                apply_event(&mut scope, event, &ctx)?;
            }

            if !rerun && scope.discount_token_changed() {
                if let Some(token) = scope.gho_config().discount_token {
                    if !discount_tokens.contains(&token) {
                        info!(
                            market = %self.market,
                            %token,
                            "discount token replaced within chunk, re-running with the new token"
                        );
                        discount_tokens.push(token);
                        rerun = true;
                        continue;
                    }
                }
            }
            break scope.into_mutations();
        };

        let pending = verify::plan(ledger, &mutations, self.config.verify_sample_size);
        self.store.commit_chunk(self.market, &mutations, &pending).await?;
        ledger.apply_mutations(&mutations);
        info!(
            market = %self.market,
            from_block,
            to_block,
            events = mutations.events_applied,
            targets = pending.targets.len(),
            "chunk committed"
        );

        let status = self.verify_and_advance(ledger, &pending).await?;
        Ok((mutations, status))
    }

    /// Fetch, decode and order the events of `[from_block, to_block]`.
    async fn fetch_events(
        &self,
        ledger: &LedgerStore,
        from_block: u64,
        to_block: u64,
        discount_tokens: &[Address],
    ) -> Result<Vec<DecodedEvent>, SyncError> {
        let mut addresses = ledger.watched_addresses();
        addresses.extend_from_slice(discount_tokens);
        addresses.sort();
        addresses.dedup();
        let filter = LogFilter {
            addresses,
            topics: topics::ALL.to_vec(),
        };

        let records = self
            .config
            .retry
            .run("eth_getLogs", || self.source.fetch(&filter, from_block, to_block))
            .await?;

        let context = DecodeContext {
            discount_tokens: discount_tokens.to_vec(),
        };
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(event) = EventDecoder::decode(record, &context)? {
                events.push(event);
            }
        }
        sort_events_deterministic(&mut events);

        if let Some(position) = find_duplicate_position(&events) {
            return Err(LedgerInvariantViolation::DuplicateEvent(position).into());
        }
        let checkpoint = ledger.checkpoint();
        for event in &events {
            if let Some(checkpoint) = checkpoint.filter(|c| event.block_number <= *c) {
                return Err(LedgerInvariantViolation::StaleEvent {
                    position: event.position(),
                    checkpoint,
                }
                .into());
            }
            if event.block_number < from_block || event.block_number > to_block {
                return Err(LedgerInvariantViolation::OutOfRange {
                    position: event.position(),
                    from: from_block,
                    to: to_block,
                }
                .into());
            }
        }

        debug!(
            market = %self.market,
            from_block,
            to_block,
            records = records.len(),
            events = events.len(),
            "chunk fetched"
        );
        Ok(events)
    }

    /// Read the discount-token balances of holders the ledger has not seen yet.
    async fn read_discount_balances(
        &self,
        ledger: &LedgerStore,
        events: &[DecodedEvent],
        balances: &mut DiscountBalances,
    ) -> Result<(), SyncError> {
        for read in discount_balance_reads(ledger, events) {
            if balances.contains_key(&read) {
                continue;
            }
            let balance = self
                .config
                .retry
                .run("balanceOf", || {
                    self.reader
                        .discount_token_balance(read.token, read.user, read.block)
                })
                .await?;
            debug!(
                market = %self.market,
                token = %read.token,
                user = %read.user,
                block = read.block,
                %balance,
                "discount-token balance read"
            );
            balances.insert(read, balance);
        }
        Ok(())
    }

    /// Verify a committed chunk and move the checkpoint past it.
    ///
    /// A mismatch pauses the market and leaves the checkpoint where it was.
    /// Any other failure leaves the chunk pending for the next run.
    async fn verify_and_advance(
        &self,
        ledger: &mut LedgerStore,
        pending: &PendingChunk,
    ) -> Result<VerificationStatus, SyncError> {
        match self.verifier.verify(ledger, pending).await {
            Ok(status) => {
                self.store
                    .advance_checkpoint(self.market, pending.to_block)
                    .await?;
                ledger.advance_checkpoint(pending.to_block);
                info!(
                    market = %self.market,
                    checkpoint = pending.to_block,
                    status = ?status,
                    "checkpoint advanced"
                );
                Ok(status)
            }
            Err(SyncError::Inconsistency(mismatch)) => {
                let reason = mismatch.to_string();
                error!(market = %self.market, %reason, "verification failed, pausing market");
                self.store.pause_market(self.market, &reason).await?;
                ledger.pause(reason);
                Err(SyncError::Inconsistency(mismatch))
            }
            Err(e) => Err(e),
        }
    }
}
