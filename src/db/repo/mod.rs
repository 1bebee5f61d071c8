//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `ledger.rs` - Ledger snapshot loading and chunk mutation writes

mod ledger;

use crate::domain::{Address, Asset, GhoConfig, MarketId, TokenRole, U256};
use crate::error::SyncError;
use crate::ledger::MutationSet;
use crate::sync::store::{DurableStore, StoredMarket};
use crate::sync::verify::PendingChunk;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};

/// Lifecycle of one committed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Written, verification outstanding.
    Committed,
    Verified,
    /// Verification failed; the market is paused.
    Mismatch,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Committed => "committed",
            ChunkStatus::Verified => "verified",
            ChunkStatus::Mismatch => "mismatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(ChunkStatus::Committed),
            "verified" => Some(ChunkStatus::Verified),
            "mismatch" => Some(ChunkStatus::Mismatch),
            _ => None,
        }
    }
}

/// Row of the `chunk_commits` journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCommitRow {
    pub from_block: u64,
    pub to_block: u64,
    pub events_applied: u64,
    pub status: ChunkStatus,
    pub committed_at: i64,
    pub verified_at: Option<i64>,
}

/// Repository for database operations.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    // =========================================================================
    // Market configuration
    // =========================================================================

    /// Create a market. Sync starts at `start_block` until a checkpoint exists.
    ///
    /// # Errors
    /// Returns an error if the insert fails, including a duplicate (chain, pool).
    pub async fn create_market(
        &self,
        chain_id: u64,
        pool_address: Address,
        start_block: u64,
        gho: &GhoConfig,
    ) -> Result<MarketId, SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO markets (
                chain_id, pool, active, start_block, last_processed_block,
                discount_token, discount_rate_strategy, created_at, updated_at
            ) VALUES (?, ?, 1, ?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(to_sql_int("chain_id", chain_id)?)
        .bind(pool_address.to_string())
        .bind(to_sql_int("start_block", start_block)?)
        .bind(gho.discount_token.map(|a| a.to_string()))
        .bind(gho.discount_rate_strategy.map(|a| a.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = MarketId::new(result.last_insert_rowid());
        info!(market = %id, chain_id, pool = %pool_address, start_block, "market created");
        Ok(id)
    }

    /// Register a reserve with its initial token revisions.
    ///
    /// # Errors
    /// Returns an error if the market does not exist or the insert fails.
    pub async fn register_asset(&self, market: MarketId, asset: &Asset) -> Result<(), SyncError> {
        let start_block: Option<i64> =
            sqlx::query_scalar("SELECT start_block FROM markets WHERE id = ?")
                .bind(market.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        let start_block = start_block.ok_or(SyncError::MarketNotFound(market))?;

        let mut tx = self.pool.begin().await?;
        ledger::upsert_asset(&mut *tx, market, asset).await?;
        for (token, role, revision) in [
            (asset.collateral_token, TokenRole::Collateral, asset.collateral_revision),
            (asset.debt_token, asset.debt_role(), asset.debt_revision),
        ] {
            sqlx::query(
                r#"
                INSERT INTO contract_revisions (market_id, token, role, revision, since_block)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(market_id, token, revision) DO NOTHING
                "#,
            )
            .bind(market.as_i64())
            .bind(token.to_string())
            .bind(role.as_str())
            .bind(i64::from(revision))
            .bind(start_block)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clear a verification pause. The unverified chunk is checked again on
    /// the next sync.
    pub async fn resume_market(&self, market: MarketId) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE markets SET paused_reason = NULL, updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(market.as_i64())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::MarketNotFound(market));
        }
        sqlx::query("UPDATE chunk_commits SET status = ? WHERE market_id = ? AND status = ?")
            .bind(ChunkStatus::Committed.as_str())
            .bind(market.as_i64())
            .bind(ChunkStatus::Mismatch.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        warn!(market = %market, "market resumed by operator");
        Ok(())
    }

    pub async fn set_market_active(&self, market: MarketId, active: bool) -> Result<(), SyncError> {
        let result = sqlx::query("UPDATE markets SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(market.as_i64())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::MarketNotFound(market));
        }
        Ok(())
    }

    /// Active, unpaused markets in id order.
    pub async fn list_active_markets(&self) -> Result<Vec<MarketId>, SyncError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM markets WHERE active = 1 AND paused_reason IS NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(MarketId::new).collect())
    }

    // =========================================================================
    // Chunk journal
    // =========================================================================

    pub async fn chunk_commits(&self, market: MarketId) -> Result<Vec<ChunkCommitRow>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT from_block, to_block, events_applied, status, committed_at, verified_at
            FROM chunk_commits
            WHERE market_id = ?
            ORDER BY from_block ASC
            "#,
        )
        .bind(market.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(ChunkCommitRow {
                    from_block: from_sql_int("from_block", row.get("from_block"))?,
                    to_block: from_sql_int("to_block", row.get("to_block"))?,
                    events_applied: from_sql_int("events_applied", row.get("events_applied"))?,
                    status: ChunkStatus::parse(&status)
                        .ok_or_else(|| corrupt("chunk_commits.status", &status))?,
                    committed_at: row.get("committed_at"),
                    verified_at: row.get("verified_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DurableStore for Repository {
    async fn load_market_state(&self, market: MarketId) -> Result<StoredMarket, SyncError> {
        self.load_snapshot(market).await
    }

    async fn commit_chunk(
        &self,
        market: MarketId,
        mutations: &MutationSet,
        pending: &PendingChunk,
    ) -> Result<(), SyncError> {
        let pending_json = serde_json::to_string(pending)
            .map_err(|e| SyncError::CorruptStore(format!("pending chunk: {}", e)))?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT start_block, last_processed_block, paused_reason, pending_chunk FROM markets WHERE id = ?",
        )
        .bind(market.as_i64())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(SyncError::MarketNotFound(market))?;

        if let Some(reason) = row.get::<Option<String>, _>("paused_reason") {
            return Err(SyncError::MarketPaused { market, reason });
        }
        if row.get::<Option<String>, _>("pending_chunk").is_some() {
            return Err(SyncError::CorruptStore(format!(
                "{} already has an unverified chunk",
                market
            )));
        }
        let expected_from = match row.get::<Option<i64>, _>("last_processed_block") {
            Some(block) => from_sql_int("last_processed_block", block)? + 1,
            None => from_sql_int("start_block", row.get("start_block"))?,
        };
        if mutations.from_block != expected_from {
            return Err(SyncError::CorruptStore(format!(
                "chunk starting at {} does not follow the checkpoint of {} (expected {})",
                mutations.from_block, market, expected_from
            )));
        }

        ledger::write_mutations(&mut *tx, market, mutations).await?;

        sqlx::query("UPDATE markets SET pending_chunk = ?, updated_at = ? WHERE id = ?")
            .bind(pending_json)
            .bind(now)
            .bind(market.as_i64())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_commits (market_id, from_block, to_block, events_applied, status, committed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(market.as_i64())
        .bind(to_sql_int("from_block", mutations.from_block)?)
        .bind(to_sql_int("to_block", mutations.to_block)?)
        .bind(to_sql_int("events_applied", mutations.events_applied as u64)?)
        .bind(ChunkStatus::Committed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_checkpoint(&self, market: MarketId) -> Result<Option<u64>, SyncError> {
        let row = sqlx::query("SELECT last_processed_block FROM markets WHERE id = ?")
            .bind(market.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SyncError::MarketNotFound(market))?;
        row.get::<Option<i64>, _>("last_processed_block")
            .map(|block| from_sql_int("last_processed_block", block))
            .transpose()
    }

    async fn advance_checkpoint(&self, market: MarketId, to_block: u64) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let to_block = to_sql_int("to_block", to_block)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE markets
            SET last_processed_block = ?, pending_chunk = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_block)
        .bind(now)
        .bind(market.as_i64())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::MarketNotFound(market));
        }

        sqlx::query(
            r#"
            UPDATE chunk_commits SET status = ?, verified_at = ?
            WHERE market_id = ? AND to_block = ? AND status = ?
            "#,
        )
        .bind(ChunkStatus::Verified.as_str())
        .bind(now)
        .bind(market.as_i64())
        .bind(to_block)
        .bind(ChunkStatus::Committed.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pause_market(&self, market: MarketId, reason: &str) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE markets SET paused_reason = ?, updated_at = ? WHERE id = ?")
            .bind(reason)
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(market.as_i64())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::MarketNotFound(market));
        }
        sqlx::query("UPDATE chunk_commits SET status = ? WHERE market_id = ? AND status = ?")
            .bind(ChunkStatus::Mismatch.as_str())
            .bind(market.as_i64())
            .bind(ChunkStatus::Committed.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Column codecs
// =============================================================================

fn corrupt(column: &str, value: &str) -> SyncError {
    SyncError::CorruptStore(format!("{} = {:?}", column, value))
}

pub(crate) fn to_sql_int(column: &str, value: u64) -> Result<i64, SyncError> {
    i64::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

pub(crate) fn from_sql_int(column: &str, value: i64) -> Result<u64, SyncError> {
    u64::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

fn parse_u256(column: &str, value: &str) -> Result<U256, SyncError> {
    U256::from_str_radix(value, 10).map_err(|_| corrupt(column, value))
}

fn parse_address(column: &str, value: &str) -> Result<Address, SyncError> {
    Address::from_str(value).map_err(|_| corrupt(column, value))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{PositionKey, Position, User};
    use crate::engine::RAY;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    async fn market_with_asset(repo: &Repository) -> MarketId {
        let market = repo
            .create_market(1, addr(0xAA), 100, &GhoConfig::default())
            .await
            .unwrap();
        repo.register_asset(market, &Asset::new(addr(1), addr(2), addr(3), 1, 2, false))
            .await
            .unwrap();
        market
    }

    fn pending(from: u64, to: u64) -> PendingChunk {
        PendingChunk {
            from_block: from,
            to_block: to,
            events_applied: 0,
            targets: vec![],
        }
    }

    #[tokio::test]
    async fn test_create_market_and_load() {
        let (repo, _temp_dir) = setup_test_db().await;
        let market = market_with_asset(&repo).await;

        let stored = repo.load_market_state(market).await.unwrap();
        assert_eq!(stored.snapshot.market.start_block, 100);
        assert_eq!(stored.snapshot.market.last_processed_block, None);
        assert_eq!(stored.snapshot.assets.len(), 1);
        assert_eq!(stored.snapshot.assets[0].debt_revision, 2);
        assert_eq!(stored.snapshot.revisions.len(), 2);
        assert!(stored.pending.is_none());
        assert_eq!(repo.read_checkpoint(market).await.unwrap(), None);
        assert_eq!(repo.list_active_markets().await.unwrap(), vec![market]);
    }

    #[tokio::test]
    async fn test_commit_chunk_then_advance() {
        let (repo, _temp_dir) = setup_test_db().await;
        let market = market_with_asset(&repo).await;

        let key = PositionKey::collateral(addr(7), addr(1));
        let mut position = Position::new(key);
        position.scaled_balance = U256::from(10).pow(U256::from(30));
        position.last_index = RAY;
        let mut user = User::new(addr(7));
        user.e_mode = 2;

        let mutations = MutationSet {
            from_block: 100,
            to_block: 199,
            users: vec![user.clone()],
            positions: vec![position.clone()],
            events_applied: 4,
            ..Default::default()
        };
        repo.commit_chunk(market, &mutations, &pending(100, 199))
            .await
            .unwrap();

        let stored = repo.load_market_state(market).await.unwrap();
        assert_eq!(stored.snapshot.positions, vec![position]);
        assert_eq!(stored.snapshot.users, vec![user]);
        assert_eq!(stored.pending, Some(pending(100, 199)));
        assert_eq!(repo.read_checkpoint(market).await.unwrap(), None);

        // A second commit before verification is refused.
        let err = repo
            .commit_chunk(market, &mutations, &pending(100, 199))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CorruptStore(_)));

        repo.advance_checkpoint(market, 199).await.unwrap();
        assert_eq!(repo.read_checkpoint(market).await.unwrap(), Some(199));
        let stored = repo.load_market_state(market).await.unwrap();
        assert!(stored.pending.is_none());

        let journal = repo.chunk_commits(market).await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].status, ChunkStatus::Verified);
        assert_eq!(journal[0].events_applied, 4);
    }

    #[tokio::test]
    async fn test_commit_must_follow_checkpoint() {
        let (repo, _temp_dir) = setup_test_db().await;
        let market = market_with_asset(&repo).await;
        let mutations = MutationSet {
            from_block: 150,
            to_block: 199,
            ..Default::default()
        };
        let err = repo
            .commit_chunk(market, &mutations, &pending(150, 199))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CorruptStore(_)));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (repo, _temp_dir) = setup_test_db().await;
        let market = market_with_asset(&repo).await;
        let mutations = MutationSet {
            from_block: 100,
            to_block: 120,
            ..Default::default()
        };
        repo.commit_chunk(market, &mutations, &pending(100, 120))
            .await
            .unwrap();
        repo.pause_market(market, "scaled balance mismatch").await.unwrap();

        let stored = repo.load_market_state(market).await.unwrap();
        assert_eq!(
            stored.snapshot.market.paused_reason.as_deref(),
            Some("scaled balance mismatch")
        );
        assert!(repo.list_active_markets().await.unwrap().is_empty());
        assert_eq!(
            repo.chunk_commits(market).await.unwrap()[0].status,
            ChunkStatus::Mismatch
        );

        repo.resume_market(market).await.unwrap();
        let stored = repo.load_market_state(market).await.unwrap();
        assert!(stored.snapshot.market.paused_reason.is_none());
        assert!(stored.pending.is_some());
        assert_eq!(
            repo.chunk_commits(market).await.unwrap()[0].status,
            ChunkStatus::Committed
        );
    }

    #[tokio::test]
    async fn test_unknown_market() {
        let (repo, _temp_dir) = setup_test_db().await;
        let err = repo.load_market_state(MarketId::new(42)).await.unwrap_err();
        assert!(matches!(err, SyncError::MarketNotFound(_)));
    }
}
