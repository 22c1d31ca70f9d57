//! Infrastructure layer: configuration and balance store bindings.

pub mod config;
pub mod store;


pub use config::{ConfigError, LedgerConfig, LedgerSchema, StoreBackend};
pub use store::{InMemoryBalanceStore, PostgresBalanceStore, connect};
#[cfg(feature = "redis")]
pub use store::RedisBalanceStore;
