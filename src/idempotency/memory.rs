use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::idempotency::record::{IdempotencyRecord, Reservation, ReservationState, StoredResponse};
use crate::idempotency::store::IdempotencyStore;

/// Process-local store guarded by a single mutex.
///
/// Linearizable within one process only. Use it for tests and single-instance
/// deployments; horizontally scaled fleets need [`super::PostgresStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record as-is, replacing any existing one for the same key.
    pub fn insert_record(&self, record: IdempotencyRecord) {
        self.records.lock().insert(record.key.clone(), record);
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Reservation> {
        let mut records = self.records.lock();

        if let Some(existing) = records.get(key) {
            if !existing.is_expired_at(now) {
                if existing.fingerprint != fingerprint {
                    return Err(AppError::fingerprint_mismatch(key));
                }
                return Ok(Reservation::existing(existing.clone()));
            }
        }

        let record = IdempotencyRecord::pending(key, fingerprint, now, ttl);
        records.insert(key.to_string(), record.clone());
        Ok(Reservation::new(ReservationState::New, record))
    }

    async fn save_response(
        &self,
        key: &str,
        fingerprint: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let mut records = self.records.lock();

        let record = records
            .get_mut(key)
            .ok_or_else(|| AppError::NotFound(format!("idempotency record {}", key)))?;
        if record.fingerprint != fingerprint {
            return Err(AppError::fingerprint_mismatch(key));
        }

        record.complete(response, now, ttl);
        Ok(())
    }

    async fn release(&self, key: &str, fingerprint: &str) -> Result<()> {
        let mut records = self.records.lock();

        // A different fingerprint means the key was re-reserved after expiry by
        // another request; that record is not ours to drop.
        if records
            .get(key)
            .is_some_and(|record| record.fingerprint == fingerprint)
        {
            records.remove(key);
        }
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64> {
        let mut records = self.records.lock();

        let expired: Vec<String> = records
            .values()
            .filter(|record| record.is_expired_at(now))
            .take(limit)
            .map(|record| record.key.clone())
            .collect();

        for key in &expired {
            records.remove(key);
        }
        Ok(expired.len() as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
