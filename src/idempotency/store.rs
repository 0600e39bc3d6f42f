use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::idempotency::record::{Reservation, StoredResponse};

/// Backing store for idempotency records.
///
/// Every method is atomic with respect to a single scoped key. Uniqueness is
/// the scoped key alone, so a second request reusing a key with a different
/// fingerprint collides with the first record instead of living beside it.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `key` for a request with `fingerprint`.
    ///
    /// Absent or expired records are (re)created as pending with `ttl` from
    /// `now` and yield `New`. A live record with another fingerprint fails
    /// with `AppError::FingerprintMismatch`. Otherwise the live record is
    /// returned as `Pending` or `Completed`.
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Reservation>;

    /// Writes the response snapshot, marks the record completed and refreshes its expiry.
    async fn save_response(
        &self,
        key: &str,
        fingerprint: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()>;

    /// Deletes the record. Absence is success.
    async fn release(&self, key: &str, fingerprint: &str) -> Result<()>;

    /// Deletes at most `limit` records whose expiry is at or before `now`.
    async fn cleanup_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64>;

    /// Cheap connectivity probe used by readiness checks.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Short name used in logs and health output.
    fn name(&self) -> &'static str;
}
