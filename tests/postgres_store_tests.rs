//! Runs against a live Postgres when `DATABASE_URL` is set; otherwise each test returns early.

mod common;

use chrono::{Duration, Utc};
use common::setup_test_db;
use idempotency_engine::error::AppError;
use idempotency_engine::idempotency::{
    IdempotencyRecord, IdempotencyStore, PostgresStore, RecordStatus, ReservationState, RetryConfig,
    StoredResponse,
};
use std::sync::Arc;
use uuid::Uuid;

macro_rules! store_or_skip {
    () => {
        match setup_test_db().await {
            Some(pool) => {
                PostgresStore::with_retry(pool, RetryConfig::default().with_max_attempts(10))
            }
            None => {
                eprintln!("DATABASE_URL not set, skipping");
                return;
            }
        }
    };
}

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn created() -> StoredResponse {
    StoredResponse::new(
        201,
        vec![
            ("content-type".to_string(), vec!["application/json".to_string()]),
            ("set-cookie".to_string(), vec!["a=1".to_string(), "b=2".to_string()]),
        ],
        b"{\"ok\":true}".to_vec(),
    )
}

#[tokio::test]
async fn test_reserve_save_replay() {
    let store = store_or_skip!();
    let key = unique_key("lifecycle");
    let now = Utc::now();
    let ttl = Duration::hours(1);

    let first = store.reserve(&key, "fp", now, ttl).await.unwrap();
    assert_eq!(first.state, ReservationState::New);

    let second = store.reserve(&key, "fp", now, ttl).await.unwrap();
    assert_eq!(second.state, ReservationState::Pending);

    store
        .save_response(&key, "fp", &created(), now, ttl)
        .await
        .unwrap();

    let replay = store.reserve(&key, "fp", now, ttl).await.unwrap();
    assert_eq!(replay.state, ReservationState::Completed);
    assert_eq!(replay.record.response(), Some(created()));
}

#[tokio::test]
async fn test_fingerprint_mismatch() {
    let store = store_or_skip!();
    let key = unique_key("mismatch");
    let now = Utc::now();

    store.reserve(&key, "fp-a", now, Duration::hours(1)).await.unwrap();

    let err = store
        .reserve(&key, "fp-b", now, Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.is_fingerprint_mismatch());

    let stored = store.find(&key).await.unwrap().unwrap();
    assert_eq!(stored.fingerprint, "fp-a");
    assert_eq!(stored.status, RecordStatus::Pending);
}

#[tokio::test]
async fn test_expired_record_is_reclaimed() {
    let store = store_or_skip!();
    let key = unique_key("expired");
    let now = Utc::now();

    store
        .insert_record(&IdempotencyRecord::pending(
            key.clone(),
            "fp-a",
            now - Duration::hours(2),
            Duration::hours(1),
        ))
        .await
        .unwrap();

    let reclaimed = store.reserve(&key, "fp-b", now, Duration::hours(1)).await.unwrap();
    assert_eq!(reclaimed.state, ReservationState::New);
    assert_eq!(store.find(&key).await.unwrap().unwrap().fingerprint, "fp-b");
}

#[tokio::test]
async fn test_release() {
    let store = store_or_skip!();
    let key = unique_key("release");
    let now = Utc::now();

    store.reserve(&key, "fp", now, Duration::hours(1)).await.unwrap();

    store.release(&key, "fp-other").await.unwrap();
    assert!(store.find(&key).await.unwrap().is_some());

    store.release(&key, "fp").await.unwrap();
    assert!(store.find(&key).await.unwrap().is_none());

    store.release(&key, "fp").await.unwrap();

    let again = store.reserve(&key, "fp", now, Duration::hours(1)).await.unwrap();
    assert_eq!(again.state, ReservationState::New);
}

#[tokio::test]
async fn test_cleanup_expired() {
    let store = store_or_skip!();
    let now = Utc::now();
    let old = unique_key("old");
    let live = unique_key("live");

    store
        .insert_record(&IdempotencyRecord::pending(
            old.clone(),
            "fp",
            now - Duration::hours(3),
            Duration::hours(1),
        ))
        .await
        .unwrap();
    store
        .insert_record(&IdempotencyRecord::pending(live.clone(), "fp", now, Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(store.cleanup_expired(now, 0).await.unwrap(), 0);

    let removed = store.cleanup_expired(now, 10_000).await.unwrap();
    assert!(removed >= 1);
    assert!(store.find(&old).await.unwrap().is_none());
    assert!(store.find(&live).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_reserve_single_winner() {
    let store = Arc::new(store_or_skip!());
    let key = unique_key("race");
    let now = Utc::now();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.reserve(&key, "fp", now, Duration::hours(1)).await })
        })
        .collect();

    let mut new = 0;
    for task in tasks {
        let reservation = task.await.unwrap().unwrap();
        if reservation.state == ReservationState::New {
            new += 1;
        } else {
            assert_eq!(reservation.state, ReservationState::Pending);
        }
    }
    assert_eq!(new, 1);
}

#[tokio::test]
async fn test_health_check() {
    let store = store_or_skip!();
    store.health_check().await.unwrap();
    assert_eq!(store.name(), "postgres");
}

/// Holds an uncommitted update on `key` while `store` reserves it, then commits,
/// so the reserving SERIALIZABLE transaction fails with a serialization error.
async fn reserve_against_concurrent_update(
    pool: &sqlx::PgPool,
    store: Arc<PostgresStore>,
    key: &str,
) -> idempotency_engine::error::Result<idempotency_engine::idempotency::Reservation> {
    let now = Utc::now();
    store
        .insert_record(&IdempotencyRecord::pending(key, "fp", now, Duration::hours(1)))
        .await
        .unwrap();

    let mut blocker = pool.begin().await.unwrap();
    sqlx::query("UPDATE idempotency_records SET updated_at = $2 WHERE key = $1")
        .bind(key)
        .bind(now)
        .execute(&mut *blocker)
        .await
        .unwrap();

    let contender = {
        let key = key.to_string();
        tokio::spawn(async move { store.reserve(&key, "fp", now, Duration::hours(1)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    blocker.commit().await.unwrap();

    contender.await.unwrap()
}

#[tokio::test]
async fn test_serialization_failure_is_retried() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let store = Arc::new(PostgresStore::with_retry(
        pool.clone(),
        RetryConfig::default().with_max_attempts(3),
    ));

    let reservation = reserve_against_concurrent_update(&pool, store, &unique_key("retried"))
        .await
        .unwrap();
    assert_eq!(reservation.state, ReservationState::Pending);
}

#[tokio::test]
async fn test_serialization_failure_exhausts_budget() {
    let Some(pool) = setup_test_db().await else {
        return;
    };
    let store = Arc::new(PostgresStore::with_retry(
        pool.clone(),
        RetryConfig::default().with_max_attempts(1),
    ));

    let err = reserve_against_concurrent_update(&pool, store, &unique_key("exhausted"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::RetriesExhausted {
            operation: "reserve",
            attempts: 1
        }
    ));
}
