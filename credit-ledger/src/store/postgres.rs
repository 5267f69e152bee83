//! Postgres ledger store
//!
//! Same-user mutations serialize on the user row (`SELECT ... FOR UPDATE`)
//! and on the user's grant rows. Every transaction sets `lock_timeout` so a
//! stuck lock surfaces as a storage error instead of hanging the worker.

use super::{GrantScan, LedgerStore, LedgerTx};
use crate::config::DatabaseConfig;
use crate::error::{LedgerError, Result};
use crate::types::{
    ActivityQuery, ActivityRecord, CreditGrant, DepositRequest, GrantId, NewActivity,
    TransactionId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::info;

/// Schema, applied statement by statement. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_grants (
        id BIGSERIAL PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        deposited NUMERIC(18, 2) NOT NULL CHECK (deposited > 0),
        remaining NUMERIC(18, 2) NOT NULL CHECK (remaining >= 0),
        transaction_type VARCHAR(32) NOT NULL,
        priority INTEGER NOT NULL,
        expiry TIMESTAMPTZ NOT NULL,
        expired BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CHECK (remaining <= deposited)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_log (
        id BIGSERIAL PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        grant_id BIGINT NOT NULL REFERENCES credit_grants(id),
        is_credit BOOLEAN NOT NULL,
        amount NUMERIC(18, 2) NOT NULL CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_credit_grants_spendable
        ON credit_grants (user_id, priority DESC, id ASC)
        WHERE remaining > 0
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_credit_grants_due
        ON credit_grants (expiry)
        WHERE expired = FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_activity_log_user
        ON activity_log (user_id, id)
    "#,
];

const GRANT_COLUMNS: &str = r#"
    user_id, id AS grant_id, deposited, remaining, transaction_type,
    priority, expiry, expired, created_at, updated_at
"#;

/// Ledger store backed by a Postgres pool
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgLedgerStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self::from_pool(pool, config.lock_timeout_ms))
    }

    pub fn from_pool(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they are missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Ledger schema ready");
        Ok(())
    }

    /// Insert a user row if it does not exist yet
    pub async fn register_user(&self, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn list_activity(
        &self,
        user_id: UserId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityRecord>> {
        let records = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT id AS transaction_id, user_id, grant_id, is_credit, amount, created_at
            FROM activity_log
            WHERE user_id = $1 AND ($2::BIGINT IS NULL OR id > $2)
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(query.after_id)
        .bind(query.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_grants(&self, user_id: UserId) -> Result<Vec<CreditGrant>> {
        let grants = sqlx::query_as::<_, CreditGrant>(&format!(
            "SELECT {} FROM credit_grants WHERE user_id = $1 ORDER BY id ASC",
            GRANT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(grants)
    }
}

/// Transaction over [`PgLedgerStore`]. Rolls back on drop.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_user(&mut self, user_id: UserId) -> Result<bool> {
        let row: Option<(UserId,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(row.is_some())
    }

    async fn insert_grant(
        &mut self,
        request: &DepositRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantId> {
        let grant_id: GrantId = sqlx::query_scalar(
            r#"
            INSERT INTO credit_grants
                (user_id, deposited, remaining, transaction_type, priority, expiry, expired, created_at, updated_at)
            VALUES ($1, $2, $2, $3, $4, $5, FALSE, $6, $6)
            RETURNING id
            "#,
        )
        .bind(request.user_id)
        .bind(request.amount)
        .bind(&request.transaction_type)
        .bind(request.priority)
        .bind(request.expiry)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(grant_id)
    }

    async fn insert_activity(
        &mut self,
        activity: &NewActivity,
        now: DateTime<Utc>,
    ) -> Result<TransactionId> {
        let transaction_id: TransactionId = sqlx::query_scalar(
            r#"
            INSERT INTO activity_log (user_id, grant_id, is_credit, amount, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(activity.user_id)
        .bind(activity.grant_id)
        .bind(activity.is_credit)
        .bind(activity.amount)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(transaction_id)
    }

    async fn fetch_spendable_grants(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<GrantScan> {
        let candidates = sqlx::query_as::<_, CreditGrant>(&format!(
            r#"
            SELECT {}
            FROM credit_grants
            WHERE user_id = $1 AND remaining > 0
            ORDER BY priority DESC, id ASC
            FOR UPDATE
            "#,
            GRANT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(GrantScan::classify(candidates, now))
    }

    async fn update_grant_remaining(
        &mut self,
        grant_id: GrantId,
        remaining: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE credit_grants
            SET remaining = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(grant_id)
        .bind(remaining)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::Storage(format!("grant {} not found", grant_id)));
        }

        Ok(())
    }

    async fn expire_due_grants(&mut self, now: DateTime<Utc>) -> Result<Vec<GrantId>> {
        let expired: Vec<GrantId> = sqlx::query_scalar(
            r#"
            UPDATE credit_grants
            SET expired = TRUE, updated_at = $1
            WHERE expired = FALSE AND expiry <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(expired)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
