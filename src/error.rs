use thiserror::Error;

/// SQLSTATE codes that signal a lost race against a concurrent transaction.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

/// Errors raised by the idempotency engine and its stores.
#[derive(Debug, Error)]
pub enum AppError {
    /// A live record exists for the key but was created by a different request.
    #[error("idempotency key {key} was reused with a different request fingerprint")]
    FingerprintMismatch { key: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{operation} gave up after {attempts} conflicting transaction attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("failed to decode stored record: {0}")]
    Decode(String),

    #[error("store call timed out during {0}")]
    Timeout(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn fingerprint_mismatch(key: impl Into<String>) -> Self {
        AppError::FingerprintMismatch { key: key.into() }
    }

    pub fn is_fingerprint_mismatch(&self) -> bool {
        matches!(self, AppError::FingerprintMismatch { .. })
    }

    /// Returns true when the failure came from transaction contention and the
    /// whole transaction may be replayed.
    pub fn is_write_conflict(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(UNIQUE_VIOLATION)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
