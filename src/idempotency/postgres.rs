use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;

use crate::error::{AppError, Result};
use crate::idempotency::record::{
    HeaderEntries, IdempotencyRecord, RecordStatus, Reservation, ReservationState, StoredResponse,
};
use crate::idempotency::store::IdempotencyStore;

const RECORD_COLUMNS: &str = "key, fingerprint, status, response_status, response_headers, \
     response_body, created_at, updated_at, expires_at";

/// Retry policy for transactions that lose a serialization race.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        std::time::Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    key: String,
    fingerprint: String,
    status: String,
    response_status: Option<i32>,
    response_headers: Json<HeaderEntries>,
    response_body: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for IdempotencyRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status = RecordStatus::parse(&row.status).ok_or_else(|| {
            AppError::Decode(format!("unknown status {:?} for {}", row.status, row.key))
        })?;
        let response_status = row
            .response_status
            .map(u16::try_from)
            .transpose()
            .map_err(|_| {
                AppError::Decode(format!("response status out of range for {}", row.key))
            })?;

        Ok(IdempotencyRecord {
            key: row.key,
            fingerprint: row.fingerprint,
            status,
            response_status,
            response_headers: row.response_headers.0,
            response_body: row.response_body,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        })
    }
}

/// PostgreSQL-backed store shared by every server process.
///
/// Each operation is one SERIALIZABLE transaction (read, decide, write) so two
/// processes racing on the same key resolve to exactly one winner. Transactions
/// that lose the race are replayed up to [`RetryConfig::max_attempts`] times.
/// Dropping an operation future before commit rolls its transaction back.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry(pool, RetryConfig::default())
    }

    pub fn with_retry(pool: PgPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Loads a record regardless of expiry.
    pub async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1",
            RECORD_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IdempotencyRecord::try_from).transpose()
    }

    /// Writes a record as-is, replacing any existing one for the same key.
    pub async fn insert_record(&self, record: &IdempotencyRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert(&mut *conn, record).await
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Runs `attempt` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent.
    async fn retry_transaction<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);

        for n in 1..=max_attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_write_conflict() => {
                    tracing::debug!(
                        operation,
                        attempt = n,
                        error = %e,
                        "Transaction conflict, retrying"
                    );
                    if n < max_attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(n)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(operation, attempts = max_attempts, "Transaction retry budget exhausted");
        Err(AppError::RetriesExhausted {
            operation,
            attempts: max_attempts,
        })
    }

    async fn try_reserve(
        &self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Reservation> {
        let mut tx = self.begin().await?;

        if let Some(existing) = select_for_update(&mut tx, key).await? {
            if !existing.is_expired_at(now) {
                if existing.fingerprint != fingerprint {
                    return Err(AppError::fingerprint_mismatch(key));
                }
                tx.commit().await?;
                return Ok(Reservation::existing(existing));
            }
        }

        let record = IdempotencyRecord::pending(key, fingerprint, now, ttl);
        upsert(&mut *tx, &record).await?;
        tx.commit().await?;

        Ok(Reservation::new(ReservationState::New, record))
    }

    async fn try_save_response(
        &self,
        key: &str,
        fingerprint: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let mut record = select_for_update(&mut tx, key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("idempotency record {}", key)))?;
        if record.fingerprint != fingerprint {
            return Err(AppError::fingerprint_mismatch(key));
        }

        record.complete(response, now, ttl);
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = $2, response_status = $3, response_headers = $4, response_body = $5,
                updated_at = $6, expires_at = $7
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(record.status.as_str())
        .bind(record.response_status.map(i32::from))
        .bind(Json(&record.response_headers))
        .bind(&record.response_body)
        .bind(record.updated_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn try_release(&self, key: &str, fingerprint: &str) -> Result<()> {
        let mut tx = self.begin().await?;

        // Zero rows affected means the record is already gone, or was replaced
        // by another request after expiry.
        sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND fingerprint = $2")
            .bind(key)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn select_for_update(
    tx: &mut Transaction<'static, Postgres>,
    key: &str,
) -> Result<Option<IdempotencyRecord>> {
    let row = sqlx::query_as::<_, RecordRow>(&format!(
        "SELECT {} FROM idempotency_records WHERE key = $1 FOR UPDATE",
        RECORD_COLUMNS
    ))
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(IdempotencyRecord::try_from).transpose()
}

async fn upsert(conn: &mut sqlx::PgConnection, record: &IdempotencyRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO idempotency_records (
            key, fingerprint, status, response_status, response_headers,
            response_body, created_at, updated_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (key) DO UPDATE SET
            fingerprint = EXCLUDED.fingerprint,
            status = EXCLUDED.status,
            response_status = EXCLUDED.response_status,
            response_headers = EXCLUDED.response_headers,
            response_body = EXCLUDED.response_body,
            created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at,
            expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(&record.key)
    .bind(&record.fingerprint)
    .bind(record.status.as_str())
    .bind(record.response_status.map(i32::from))
    .bind(Json(&record.response_headers))
    .bind(&record.response_body)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.expires_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Reservation> {
        self.retry_transaction("reserve", || self.try_reserve(key, fingerprint, now, ttl))
            .await
    }

    async fn save_response(
        &self,
        key: &str,
        fingerprint: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        self.retry_transaction("save_response", || {
            self.try_save_response(key, fingerprint, response, now, ttl)
        })
        .await
    }

    async fn release(&self, key: &str, fingerprint: &str) -> Result<()> {
        self.retry_transaction("release", || self.try_release(key, fingerprint))
            .await
    }

    /// Query-then-delete. The batch is not atomic as a whole; the delete
    /// re-checks expiry per row so a record revived in between survives.
    async fn cleanup_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        if limit == 0 {
            return Ok(0);
        }

        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT key FROM idempotency_records
            WHERE expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        if keys.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM idempotency_records WHERE key = ANY($1) AND expires_at <= $2",
        )
        .bind(&keys)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
