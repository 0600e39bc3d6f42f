use axum::http::{HeaderName, Method};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::idempotency::{Clock, IdempotencyConfig};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Backing store selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    pub store: StoreKind,
    pub header_name: String,
    pub ttl_seconds: i64,
    pub guarded_methods: Vec<String>,
    pub cleanup_interval_seconds: u64,
    pub cleanup_batch_size: usize,
    pub max_body_bytes: usize,
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,
    pub max_transaction_attempts: u32,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

fn invalid(message: String) -> AppError {
    AppError::Config(config::ConfigError::Message(message))
}

impl IdempotencySettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }

    /// Builds the middleware options. Fails on an unparsable header name or method.
    pub fn to_config(&self, clock: Arc<dyn Clock>) -> Result<IdempotencyConfig> {
        if self.ttl_seconds <= 0 {
            return Err(invalid(format!(
                "idempotency.ttl_seconds must be positive, got {}",
                self.ttl_seconds
            )));
        }

        let header_name = HeaderName::from_str(&self.header_name)
            .map_err(|e| invalid(format!("invalid idempotency.header_name: {}", e)))?;

        let methods = self
            .guarded_methods
            .iter()
            .map(|m| {
                Method::from_str(&m.to_ascii_uppercase())
                    .map_err(|e| invalid(format!("invalid guarded method {:?}: {}", m, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut config = IdempotencyConfig::default()
            .with_header_name(header_name)
            .with_ttl(chrono::Duration::seconds(self.ttl_seconds))
            .with_guarded_methods(methods)
            .with_max_body_bytes(self.max_body_bytes)
            .with_clock(clock);
        if let Some(ms) = self.store_timeout_ms {
            config = config.with_store_timeout(Duration::from_millis(ms));
        }

        Ok(config)
    }
}
