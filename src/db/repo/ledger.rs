//! Ledger snapshot loading and chunk mutation writes for the repository.

use super::{corrupt, from_sql_int, parse_address, parse_u256, to_sql_int, Repository};
use crate::domain::{
    Address, Asset, ContractRevision, DiscountPercent, GhoConfig, GhoUserState, Market, MarketId, Position,
    PositionKey, PositionKind, TokenRole, User,
};
use crate::error::SyncError;
use crate::ledger::{LedgerSnapshot, MutationSet, Touch};
use crate::sync::store::StoredMarket;
use crate::sync::verify::PendingChunk;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;

impl Repository {
    /// Load a market and all of its ledger rows.
    ///
    /// # Errors
    /// Returns `MarketNotFound` for an unknown id and `CorruptStore` for rows
    /// that do not parse back into ledger values.
    pub(super) async fn load_snapshot(&self, market: MarketId) -> Result<StoredMarket, SyncError> {
        let row = sqlx::query(
            r#"
            SELECT id, chain_id, pool, active, start_block, last_processed_block,
                   discount_token, discount_rate_strategy, paused_reason, pending_chunk
            FROM markets
            WHERE id = ?
            "#,
        )
        .bind(market.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SyncError::MarketNotFound(market))?;
        let (market_row, pending) = market_from_row(&row)?;

        let assets = sqlx::query(
            r#"
            SELECT underlying, collateral_token, debt_token, collateral_revision, debt_revision,
                   discount_eligible, liquidity_index, variable_borrow_index, liquidity_rate,
                   variable_borrow_rate, last_update_block
            FROM assets
            WHERE market_id = ?
            ORDER BY underlying ASC
            "#,
        )
        .bind(market.as_i64())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(asset_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let users = sqlx::query(
            "SELECT address, e_mode, discount_token_balance, discount_balance_token FROM users WHERE market_id = ? ORDER BY address ASC",
        )
        .bind(market.as_i64())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(user_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let mut positions = Vec::new();
        for kind in [PositionKind::Collateral, PositionKind::Debt] {
            let sql = format!(
                r#"
                SELECT user, asset, scaled_balance, last_index, accumulated_interest
                FROM {}
                WHERE market_id = ?
                ORDER BY user ASC, asset ASC
                "#,
                position_table(kind)
            );
            let rows = sqlx::query(&sql)
                .bind(market.as_i64())
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                positions.push(position_from_row(kind, row)?);
            }
        }

        let gho_users = sqlx::query(
            r#"
            SELECT user, accumulated_debt_interest, discount_percent
            FROM gho_user_states
            WHERE market_id = ?
            ORDER BY user ASC
            "#,
        )
        .bind(market.as_i64())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(gho_user_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let revisions = sqlx::query(
            r#"
            SELECT token, role, revision, since_block
            FROM contract_revisions
            WHERE market_id = ?
            ORDER BY since_block ASC, id ASC
            "#,
        )
        .bind(market.as_i64())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(revision_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(StoredMarket {
            snapshot: LedgerSnapshot {
                market: market_row,
                assets,
                users,
                positions,
                gho_users,
                revisions,
            },
            pending,
        })
    }
}

/// Write every entity of `mutations` inside the caller's transaction.
pub(super) async fn write_mutations(
    conn: &mut SqliteConnection,
    market: MarketId,
    mutations: &MutationSet,
) -> Result<(), SyncError> {
    if let Some(gho) = &mutations.gho {
        sqlx::query("UPDATE markets SET discount_token = ?, discount_rate_strategy = ? WHERE id = ?")
            .bind(gho.discount_token.map(|a| a.to_string()))
            .bind(gho.discount_rate_strategy.map(|a| a.to_string()))
            .bind(market.as_i64())
            .execute(&mut *conn)
            .await?;
    }

    for asset in &mutations.assets {
        upsert_asset(&mut *conn, market, asset).await?;
    }

    for user in &mutations.users {
        sqlx::query(
            r#"
            INSERT INTO users (market_id, address, e_mode, discount_token_balance, discount_balance_token)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(market_id, address) DO UPDATE SET
                e_mode = excluded.e_mode,
                discount_token_balance = excluded.discount_token_balance,
                discount_balance_token = excluded.discount_balance_token
            "#,
        )
        .bind(market.as_i64())
        .bind(user.address.to_string())
        .bind(i64::from(user.e_mode))
        .bind(user.discount_token_balance.to_string())
        .bind(user.discount_balance_token.map(|t| t.to_string()))
        .execute(&mut *conn)
        .await?;
    }

    let position_touches: HashMap<PositionKey, Touch> =
        mutations.touched_positions.iter().copied().collect();
    for position in &mutations.positions {
        let touch = position_touches.get(&position.key);
        let sql = format!(
            r#"
            INSERT INTO {} (
                market_id, user, asset, scaled_balance, last_index, accumulated_interest,
                last_tx_hash, last_block
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_id, user, asset) DO UPDATE SET
                scaled_balance = excluded.scaled_balance,
                last_index = excluded.last_index,
                accumulated_interest = excluded.accumulated_interest,
                last_tx_hash = COALESCE(excluded.last_tx_hash, last_tx_hash),
                last_block = COALESCE(excluded.last_block, last_block)
            "#,
            position_table(position.key.kind)
        );
        sqlx::query(&sql)
            .bind(market.as_i64())
            .bind(position.key.user.to_string())
            .bind(position.key.asset.to_string())
            .bind(position.scaled_balance.to_string())
            .bind(position.last_index.to_string())
            .bind(position.accumulated_interest.to_string())
            .bind(touch.map(|t| t.tx_hash.to_string()))
            .bind(touch.map(|t| to_sql_int("last_block", t.block_number)).transpose()?)
            .execute(&mut *conn)
            .await?;
    }

    let gho_touches: HashMap<_, Touch> = mutations.touched_gho_users.iter().copied().collect();
    for state in &mutations.gho_users {
        let touch = gho_touches.get(&state.user);
        sqlx::query(
            r#"
            INSERT INTO gho_user_states (
                market_id, user, accumulated_debt_interest, discount_percent, last_tx_hash, last_block
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_id, user) DO UPDATE SET
                accumulated_debt_interest = excluded.accumulated_debt_interest,
                discount_percent = excluded.discount_percent,
                last_tx_hash = COALESCE(excluded.last_tx_hash, last_tx_hash),
                last_block = COALESCE(excluded.last_block, last_block)
            "#,
        )
        .bind(market.as_i64())
        .bind(state.user.to_string())
        .bind(state.accumulated_debt_interest.to_string())
        .bind(i64::from(state.discount_percent.bps()))
        .bind(touch.map(|t| t.tx_hash.to_string()))
        .bind(touch.map(|t| to_sql_int("last_block", t.block_number)).transpose()?)
        .execute(&mut *conn)
        .await?;
    }

    for revision in &mutations.revisions {
        sqlx::query(
            r#"
            INSERT INTO contract_revisions (market_id, token, role, revision, since_block)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(market.as_i64())
        .bind(revision.token.to_string())
        .bind(revision.role.as_str())
        .bind(i64::from(revision.revision))
        .bind(to_sql_int("since_block", revision.since_block)?)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub(super) async fn upsert_asset(
    conn: &mut SqliteConnection,
    market: MarketId,
    asset: &Asset,
) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        INSERT INTO assets (
            market_id, underlying, collateral_token, debt_token, collateral_revision,
            debt_revision, discount_eligible, liquidity_index, variable_borrow_index,
            liquidity_rate, variable_borrow_rate, last_update_block
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(market_id, underlying) DO UPDATE SET
            collateral_revision = excluded.collateral_revision,
            debt_revision = excluded.debt_revision,
            liquidity_index = excluded.liquidity_index,
            variable_borrow_index = excluded.variable_borrow_index,
            liquidity_rate = excluded.liquidity_rate,
            variable_borrow_rate = excluded.variable_borrow_rate,
            last_update_block = excluded.last_update_block
        "#,
    )
    .bind(market.as_i64())
    .bind(asset.underlying.to_string())
    .bind(asset.collateral_token.to_string())
    .bind(asset.debt_token.to_string())
    .bind(i64::from(asset.collateral_revision))
    .bind(i64::from(asset.debt_revision))
    .bind(asset.discount_eligible)
    .bind(asset.liquidity_index.to_string())
    .bind(asset.variable_borrow_index.to_string())
    .bind(asset.liquidity_rate.to_string())
    .bind(asset.variable_borrow_rate.to_string())
    .bind(
        asset
            .last_update_block
            .map(|b| to_sql_int("last_update_block", b))
            .transpose()?,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn position_table(kind: PositionKind) -> &'static str {
    match kind {
        PositionKind::Collateral => "collateral_positions",
        PositionKind::Debt => "debt_positions",
    }
}

fn revision_number(column: &str, value: i64) -> Result<u32, SyncError> {
    u32::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

fn optional_address(column: &str, value: Option<String>) -> Result<Option<Address>, SyncError> {
    value.map(|v| parse_address(column, &v)).transpose()
}

fn market_from_row(row: &SqliteRow) -> Result<(Market, Option<PendingChunk>), SyncError> {
    let pool: String = row.get("pool");
    let pending = row
        .get::<Option<String>, _>("pending_chunk")
        .map(|json| {
            serde_json::from_str::<PendingChunk>(&json)
                .map_err(|e| SyncError::CorruptStore(format!("markets.pending_chunk: {}", e)))
        })
        .transpose()?;

    let market = Market {
        id: MarketId::new(row.get("id")),
        chain_id: from_sql_int("markets.chain_id", row.get("chain_id"))?,
        pool: parse_address("markets.pool", &pool)?,
        active: row.get("active"),
        start_block: from_sql_int("markets.start_block", row.get("start_block"))?,
        last_processed_block: row
            .get::<Option<i64>, _>("last_processed_block")
            .map(|b| from_sql_int("markets.last_processed_block", b))
            .transpose()?,
        gho: GhoConfig {
            discount_token: optional_address("markets.discount_token", row.get("discount_token"))?,
            discount_rate_strategy: optional_address(
                "markets.discount_rate_strategy",
                row.get("discount_rate_strategy"),
            )?,
        },
        paused_reason: row.get("paused_reason"),
    };
    Ok((market, pending))
}

fn asset_from_row(row: &SqliteRow) -> Result<Asset, SyncError> {
    let text = |column: &str| -> String { row.get(column) };
    Ok(Asset {
        underlying: parse_address("assets.underlying", &text("underlying"))?,
        collateral_token: parse_address("assets.collateral_token", &text("collateral_token"))?,
        debt_token: parse_address("assets.debt_token", &text("debt_token"))?,
        collateral_revision: revision_number("assets.collateral_revision", row.get("collateral_revision"))?,
        debt_revision: revision_number("assets.debt_revision", row.get("debt_revision"))?,
        discount_eligible: row.get("discount_eligible"),
        liquidity_index: parse_u256("assets.liquidity_index", &text("liquidity_index"))?,
        variable_borrow_index: parse_u256(
            "assets.variable_borrow_index",
            &text("variable_borrow_index"),
        )?,
        liquidity_rate: parse_u256("assets.liquidity_rate", &text("liquidity_rate"))?,
        variable_borrow_rate: parse_u256("assets.variable_borrow_rate", &text("variable_borrow_rate"))?,
        last_update_block: row
            .get::<Option<i64>, _>("last_update_block")
            .map(|b| from_sql_int("assets.last_update_block", b))
            .transpose()?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<User, SyncError> {
    let address: String = row.get("address");
    let e_mode: i64 = row.get("e_mode");
    let balance: String = row.get("discount_token_balance");
    Ok(User {
        address: parse_address("users.address", &address)?,
        e_mode: u8::try_from(e_mode).map_err(|_| corrupt("users.e_mode", &e_mode.to_string()))?,
        discount_token_balance: parse_u256("users.discount_token_balance", &balance)?,
        discount_balance_token: optional_address(
            "users.discount_balance_token",
            row.get("discount_balance_token"),
        )?,
    })
}

fn position_from_row(kind: PositionKind, row: &SqliteRow) -> Result<Position, SyncError> {
    let text = |column: &str| -> String { row.get(column) };
    let user = parse_address("positions.user", &text("user"))?;
    let asset = parse_address("positions.asset", &text("asset"))?;
    Ok(Position {
        key: PositionKey { kind, user, asset },
        scaled_balance: parse_u256("positions.scaled_balance", &text("scaled_balance"))?,
        last_index: parse_u256("positions.last_index", &text("last_index"))?,
        accumulated_interest: parse_u256(
            "positions.accumulated_interest",
            &text("accumulated_interest"),
        )?,
    })
}

fn gho_user_from_row(row: &SqliteRow) -> Result<GhoUserState, SyncError> {
    let user: String = row.get("user");
    let interest: String = row.get("accumulated_debt_interest");
    let bps: i64 = row.get("discount_percent");
    let discount_percent = u16::try_from(bps)
        .ok()
        .and_then(DiscountPercent::from_bps)
        .ok_or_else(|| corrupt("gho_user_states.discount_percent", &bps.to_string()))?;
    Ok(GhoUserState {
        user: parse_address("gho_user_states.user", &user)?,
        accumulated_debt_interest: parse_u256("gho_user_states.accumulated_debt_interest", &interest)?,
        discount_percent,
    })
}

fn revision_from_row(row: &SqliteRow) -> Result<ContractRevision, SyncError> {
    let token: String = row.get("token");
    let role: String = row.get("role");
    Ok(ContractRevision {
        token: parse_address("contract_revisions.token", &token)?,
        role: TokenRole::parse(&role).ok_or_else(|| corrupt("contract_revisions.role", &role))?,
        revision: revision_number("contract_revisions.revision", row.get("revision"))?,
        since_block: from_sql_int("contract_revisions.since_block", row.get("since_block"))?,
    })
}
