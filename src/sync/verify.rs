//! Reconciliation Verifier: compares committed ledger values with live
//! contract reads at the chunk's end block.

use super::retry::RetryPolicy;
use crate::datasource::ChainReader;
use crate::domain::{Address, MarketId, PositionKey, PositionKind, U256};
use crate::error::{LedgerInconsistencyError, SyncError, VerifiedField};
use crate::ledger::{LedgerStore, MutationSet, Touch};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKind {
    Collateral,
    Debt,
    /// Discount percent on the discount-eligible debt token.
    Discount,
}

/// One (user, token) pair to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTarget {
    pub kind: TargetKind,
    pub user: Address,
    pub asset: Address,
    pub token: Address,
    /// Last event in the chunk that touched this entity.
    pub touch: Touch,
}

/// Verification plan of a committed chunk, persisted until it passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChunk {
    pub from_block: u64,
    pub to_block: u64,
    pub events_applied: usize,
    pub targets: Vec<VerificationTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every sampled value matched.
    Verified { checked: usize },
    /// No chunk ran, or the chunk touched nothing.
    NothingToVerify,
}

/// Everything the chunk touched, resolved against the post-commit ledger.
pub fn candidates(ledger: &LedgerStore, mutations: &MutationSet) -> Vec<VerificationTarget> {
    let mut targets = Vec::new();
    for (key, touch) in &mutations.touched_positions {
        let Some(asset) = ledger.asset(&key.asset) else {
            continue;
        };
        targets.push(VerificationTarget {
            kind: match key.kind {
                PositionKind::Collateral => TargetKind::Collateral,
                PositionKind::Debt => TargetKind::Debt,
            },
            user: key.user,
            asset: key.asset,
            token: asset.token(key.kind),
            touch: *touch,
        });
    }
    if let Some(asset) = ledger.discount_asset() {
        for (user, touch) in &mutations.touched_gho_users {
            targets.push(VerificationTarget {
                kind: TargetKind::Discount,
                user: *user,
                asset: asset.underlying,
                token: asset.debt_token,
                touch: *touch,
            });
        }
    }
    targets
}

fn rank(market: MarketId, end_block: u64, target: &VerificationTarget) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(market.as_i64().to_be_bytes());
    hasher.update(end_block.to_be_bytes());
    hasher.update(target.token.as_slice());
    hasher.update(target.user.as_slice());
    hasher.update([target.kind as u8]);
    hasher.finalize().into()
}

/// Deterministic sample of `sample_size` targets; zero keeps all of them.
///
/// The same chunk always yields the same sample, independent of the order
/// in which targets were collected.
pub fn select_sample(
    market: MarketId,
    end_block: u64,
    mut targets: Vec<VerificationTarget>,
    sample_size: usize,
) -> Vec<VerificationTarget> {
    targets.sort_by_cached_key(|t| rank(market, end_block, t));
    if sample_size > 0 {
        targets.truncate(sample_size);
    }
    targets
}

/// Build the verification plan for a chunk that is about to commit.
pub fn plan(
    ledger: &LedgerStore,
    mutations: &MutationSet,
    sample_size: usize,
) -> PendingChunk {
    PendingChunk {
        from_block: mutations.from_block,
        to_block: mutations.to_block,
        events_applied: mutations.events_applied,
        targets: select_sample(
            ledger.market_id(),
            mutations.to_block,
            candidates(ledger, mutations),
            sample_size,
        ),
    }
}

pub struct Verifier {
    reader: Arc<dyn ChainReader>,
    retry: RetryPolicy,
}

impl Verifier {
    pub fn new(reader: Arc<dyn ChainReader>, retry: RetryPolicy) -> Self {
        Verifier { reader, retry }
    }

    /// Check every target of `pending` against the chain at its end block.
    ///
    /// Returns the first mismatch as a [`LedgerInconsistencyError`].
    pub async fn verify(
        &self,
        ledger: &LedgerStore,
        pending: &PendingChunk,
    ) -> Result<VerificationStatus, SyncError> {
        if pending.targets.is_empty() {
            return Ok(VerificationStatus::NothingToVerify);
        }

        let block = pending.to_block;
        let mut checked = 0usize;
        for target in &pending.targets {
            let (user, token) = (target.user, target.token);
            match target.kind {
                TargetKind::Collateral | TargetKind::Debt => {
                    let key = match target.kind {
                        TargetKind::Collateral => PositionKey::collateral(user, target.asset),
                        _ => PositionKey::debt(user, target.asset),
                    };
                    let (scaled_balance, last_index) = ledger
                        .position(&key)
                        .map(|p| (p.scaled_balance, p.last_index))
                        .unwrap_or((U256::ZERO, U256::ZERO));

                    let on_chain = self
                        .retry
                        .run("scaledBalanceOf", || {
                            self.reader.scaled_balance_of(token, user, block)
                        })
                        .await?;
                    self.compare(ledger, pending, target, VerifiedField::ScaledBalance, scaled_balance, on_chain)?;

                    let on_chain = self
                        .retry
                        .run("getPreviousIndex", || self.reader.previous_index(token, user, block))
                        .await?;
                    self.compare(ledger, pending, target, VerifiedField::PreviousIndex, last_index, on_chain)?;
                    checked += 2;
                }
                TargetKind::Discount => {
                    let expected = ledger
                        .gho_user(&user)
                        .map(|g| g.discount_percent.as_u256())
                        .unwrap_or(U256::ZERO);
                    let on_chain = self
                        .retry
                        .run("getDiscountPercent", || {
                            self.reader.discount_percent(token, user, block)
                        })
                        .await?;
                    self.compare(ledger, pending, target, VerifiedField::DiscountPercent, expected, on_chain)?;
                    checked += 1;
                }
            }
        }

        debug!(
            market = %ledger.market_id(),
            block,
            targets = pending.targets.len(),
            checked,
            "chunk verified"
        );
        Ok(VerificationStatus::Verified { checked })
    }

    fn compare(
        &self,
        ledger: &LedgerStore,
        pending: &PendingChunk,
        target: &VerificationTarget,
        field: VerifiedField,
        expected: U256,
        on_chain: U256,
    ) -> Result<(), LedgerInconsistencyError> {
        if expected == on_chain {
            return Ok(());
        }
        Err(LedgerInconsistencyError {
            market: ledger.market_id(),
            tx_hash: target.touch.tx_hash,
            block: target.touch.block_number,
            verified_block: pending.to_block,
            user: target.user,
            asset: target.asset,
            token: target.token,
            field,
            expected,
            on_chain,
        })
    }
}
