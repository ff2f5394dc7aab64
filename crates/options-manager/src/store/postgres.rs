//! PostgreSQL position store.

use algo_trade_core::{
    InstrumentKey, NewPosition, OptionRight, PnlSnapshot, PnlSource, Position, PositionStatus,
    PositionStore,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};

const COLUMNS: &str = r"
    id, segment, security_id, underlying_segment, underlying_security_id,
    option_right, side, entry_price, quantity, status, created_at, entered_at,
    exited_at, exit_price, exit_reason, peak_pnl_pct, peak_pnl_rupees,
    pnl_rupees, pnl_pct, pnl_ltp, pnl_updated_at, metadata, paper
";

#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    id: i64,
    segment: String,
    security_id: String,
    underlying_segment: Option<String>,
    underlying_security_id: Option<String>,
    option_right: Option<String>,
    side: String,
    entry_price: Decimal,
    quantity: i64,
    status: String,
    created_at: DateTime<Utc>,
    entered_at: Option<DateTime<Utc>>,
    exited_at: Option<DateTime<Utc>>,
    exit_price: Option<Decimal>,
    exit_reason: Option<String>,
    peak_pnl_pct: Decimal,
    peak_pnl_rupees: Decimal,
    pnl_rupees: Option<Decimal>,
    pnl_pct: Option<Decimal>,
    pnl_ltp: Option<Decimal>,
    pnl_updated_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    paper: bool,
}

impl TryFrom<PositionRow> for Position {
    type Error = anyhow::Error;

    fn try_from(row: PositionRow) -> Result<Self> {
        let underlying = match (row.underlying_segment, row.underlying_security_id) {
            (Some(segment), Some(security_id)) => Some(InstrumentKey::new(segment, security_id)),
            _ => None,
        };
        let last_pnl = match (row.pnl_rupees, row.pnl_pct, row.pnl_ltp, row.pnl_updated_at) {
            (Some(pnl_rupees), Some(pnl_pct), Some(ltp), Some(computed_at)) => Some(PnlSnapshot {
                position_id: row.id,
                pnl_rupees,
                pnl_pct,
                ltp,
                computed_at,
                source: PnlSource::Store,
            }),
            _ => None,
        };

        Ok(Position {
            id: row.id,
            instrument: InstrumentKey::new(row.segment, row.security_id),
            underlying,
            right: row
                .option_right
                .as_deref()
                .map(str::parse::<OptionRight>)
                .transpose()?,
            side: row.side.parse()?,
            entry_price: row.entry_price,
            quantity: row.quantity,
            status: row.status.parse()?,
            created_at: row.created_at,
            entered_at: row.entered_at,
            exited_at: row.exited_at,
            exit_price: row.exit_price,
            exit_reason: row.exit_reason,
            peak_pnl_pct: row.peak_pnl_pct,
            peak_pnl_rupees: row.peak_pnl_rupees,
            last_pnl,
            metadata: row.metadata,
            paper: row.paper,
        })
    }
}

/// Positions table access. Tier-2 pnl lives in the `pnl_*` columns.
#[derive(Debug, Clone)]
pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    ///
    /// # Errors
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn insert(&self, new: NewPosition, now: DateTime<Utc>) -> Result<Position> {
        new.validate()?;
        let (underlying_segment, underlying_security_id) = match &new.underlying {
            Some(key) => (Some(key.segment.as_str()), Some(key.security_id.as_str())),
            None => (None, None),
        };

        let row = sqlx::query_as::<_, PositionRow>(&format!(
            r"
            INSERT INTO positions
                (segment, security_id, underlying_segment, underlying_security_id,
                 option_right, side, entry_price, quantity, status, created_at,
                 metadata, paper)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, $11)
            RETURNING {COLUMNS}
            "
        ))
        .bind(&new.instrument.segment)
        .bind(&new.instrument.security_id)
        .bind(underlying_segment)
        .bind(underlying_security_id)
        .bind(new.right.map(|r| r.as_str()))
        .bind(new.side.as_str())
        .bind(new.entry_price)
        .bind(new.quantity)
        .bind(now)
        .bind(&new.metadata)
        .bind(new.paper)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: i64) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {COLUMNS} FROM positions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Position::try_from).transpose()
    }

    async fn update(&self, position: &Position) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE positions SET
                status = $2, entry_price = $3, entered_at = $4,
                peak_pnl_pct = $5, peak_pnl_rupees = $6, metadata = $7
            WHERE id = $1
            ",
        )
        .bind(position.id)
        .bind(position.status.as_str())
        .bind(position.entry_price)
        .bind(position.entered_at)
        .bind(position.peak_pnl_pct)
        .bind(position.peak_pnl_rupees)
        .bind(&position.metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("position {} does not exist", position.id);
        }
        Ok(())
    }

    async fn finalize_exit(
        &self,
        position: &Position,
        final_pnl: Option<&PnlSnapshot>,
    ) -> Result<()> {
        if position.status != PositionStatus::Exited {
            bail!("position {} is {}, not exited", position.id, position.status);
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            UPDATE positions SET
                status = 'exited', exit_price = $2, exit_reason = $3, exited_at = $4,
                peak_pnl_pct = $5, peak_pnl_rupees = $6, metadata = $7
            WHERE id = $1 AND status = 'active'
            ",
        )
        .bind(position.id)
        .bind(position.exit_price)
        .bind(&position.exit_reason)
        .bind(position.exited_at)
        .bind(position.peak_pnl_pct)
        .bind(position.peak_pnl_rupees)
        .bind(&position.metadata)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            bail!("position {} was not active in store", position.id);
        }

        if let Some(pnl) = final_pnl {
            sqlx::query(
                r"
                UPDATE positions SET
                    pnl_rupees = $2, pnl_pct = $3, pnl_ltp = $4, pnl_updated_at = $5
                WHERE id = $1
                ",
            )
            .bind(position.id)
            .bind(pnl.pnl_rupees)
            .bind(pnl.pnl_pct)
            .bind(pnl.ltp)
            .bind(pnl.computed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_pnl(&self, snapshot: &PnlSnapshot) -> Result<()> {
        sqlx::query(
            r"
            UPDATE positions SET
                pnl_rupees = $2, pnl_pct = $3, pnl_ltp = $4, pnl_updated_at = $5
            WHERE id = $1 AND status = 'active'
            ",
        )
        .bind(snapshot.position_id)
        .bind(snapshot.pnl_rupees)
        .bind(snapshot.pnl_pct)
        .bind(snapshot.ltp)
        .bind(snapshot.computed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(&format!(
            "SELECT {COLUMNS} FROM positions WHERE status = 'active' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }
}
