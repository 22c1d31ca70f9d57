//! Balance store bindings.
//!
//! - [`InMemoryBalanceStore`]: process-local, for tests/dev
//! - [`PostgresBalanceStore`]: users and transactions tables
//! - `RedisBalanceStore`: hashes and lists (feature `redis`)
//!
//! [`connect`] picks one from a [`LedgerConfig`].

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use bidcat_ledger::BalanceStore;

use crate::config::{ConfigError, LedgerConfig, StoreBackend};

pub use in_memory::InMemoryBalanceStore;
pub use postgres::PostgresBalanceStore;
#[cfg(feature = "redis")]
pub use redis::RedisBalanceStore;

/// Build the balance store selected by `config`.
pub async fn connect(config: &LedgerConfig) -> Result<Arc<dyn BalanceStore>, ConfigError> {
    config.schema.validate()?;

    match &config.backend {
        StoreBackend::Memory => {
            tracing::info!(store = "memory", "using in-memory balance store");
            Ok(Arc::new(InMemoryBalanceStore::new()))
        }
        StoreBackend::Postgres {
            database_url,
            max_connections,
            acquire_timeout_secs,
        } => {
            let store = PostgresBalanceStore::connect(
                database_url,
                *max_connections,
                Duration::from_secs(*acquire_timeout_secs),
                &config.schema,
            )
            .await?;
            tracing::info!(store = "postgres", max_connections, "connected balance store");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis { redis_url } => {
            let store = RedisBalanceStore::connect(redis_url, &config.schema).await?;
            tracing::info!(store = "redis", "connected balance store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis { .. } => {
            tracing::warn!(
                "redis store requested but bidcat-infra was built without the `redis` feature; \
                 falling back to in-memory store"
            );
            Ok(Arc::new(InMemoryBalanceStore::new()))
        }
    }
}
