//! Configuration loading and representation.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `BIDCAT_STORE` | `memory`, `postgres` or `redis` | `memory` |
//! | `DATABASE_URL` | Postgres connection string | required for `postgres` |
//! | `BIDCAT_PG_MAX_CONNECTIONS` | pool size | `5` |
//! | `BIDCAT_PG_ACQUIRE_TIMEOUT_SECS` | pool acquire timeout | `5` |
//! | `REDIS_URL` | Redis connection string | `redis://localhost:6379` |
//!
//! Table and field names are not read from the environment; they default to
//! the names the user and transaction documents have always used and can be
//! overridden through [`LedgerSchema`] (e.g. when deserializing a config file).

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PG_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_PG_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Longest identifier Postgres keeps without truncating.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("invalid identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]* of at most 63 characters")]
    InvalidIdentifier(String),

    #[error("duplicate field name '{0}' in transaction schema")]
    DuplicateField(String),

    #[error("failed to connect to store: {0}")]
    Connect(String),
}

/// Names of the tables/collections and fields the ledger reads and writes.
///
/// Each name is addressable on its own so a binding can map the ledger onto an
/// existing schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSchema {
    pub users_table: String,
    pub user_id_field: String,
    pub money_field: String,

    pub transactions_table: String,
    pub transaction_id_field: String,
    pub transaction_user_field: String,
    pub change_field: String,
    pub timestamp_field: String,
    pub old_balance_field: String,
    pub new_balance_field: String,
}

impl Default for LedgerSchema {
    fn default() -> Self {
        Self {
            users_table: "users".to_string(),
            user_id_field: "id".to_string(),
            money_field: "money".to_string(),
            transactions_table: "transactions".to_string(),
            transaction_id_field: "id".to_string(),
            transaction_user_field: "user".to_string(),
            change_field: "change".to_string(),
            timestamp_field: "timestamp".to_string(),
            old_balance_field: "old_balance".to_string(),
            new_balance_field: "new_balance".to_string(),
        }
    }
}

impl LedgerSchema {
    /// Check that every name is a plain identifier and that the transaction
    /// columns are distinct.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in [
            &self.users_table,
            &self.user_id_field,
            &self.money_field,
            &self.transactions_table,
        ] {
            validate_identifier(name)?;
        }

        let record_fields = self.record_fields();
        for (idx, name) in record_fields.iter().enumerate() {
            validate_identifier(name)?;
            if record_fields[..idx].contains(name) {
                return Err(ConfigError::DuplicateField(name.to_string()));
            }
        }

        if self.user_id_field == self.money_field {
            return Err(ConfigError::DuplicateField(self.money_field.clone()));
        }

        Ok(())
    }

    /// Transaction record columns in persisted order:
    /// id, user, change, timestamp, old balance, new balance.
    pub fn record_fields(&self) -> [&str; 6] {
        [
            self.transaction_id_field.as_str(),
            self.transaction_user_field.as_str(),
            self.change_field.as_str(),
            self.timestamp_field.as_str(),
            self.old_balance_field.as_str(),
            self.new_balance_field.as_str(),
        ]
    }
}

fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

/// Which backend stores balances and transaction records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store for tests/dev. Nothing survives a restart.
    Memory,
    Postgres {
        database_url: String,
        #[serde(default = "default_pg_max_connections")]
        max_connections: u32,
        #[serde(default = "default_pg_acquire_timeout_secs")]
        acquire_timeout_secs: u64,
    },
    Redis {
        #[serde(default = "default_redis_url")]
        redis_url: String,
    },
}

fn default_pg_max_connections() -> u32 {
    DEFAULT_PG_MAX_CONNECTIONS
}

fn default_pg_acquire_timeout_secs() -> u64 {
    DEFAULT_PG_ACQUIRE_TIMEOUT_SECS
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

/// Ledger infrastructure configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub schema: LedgerSchema,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            schema: LedgerSchema::default(),
        }
    }
}

impl LedgerConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup` (variable name → value).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let kind = lookup("BIDCAT_STORE").unwrap_or_else(|| "memory".to_string());

        let backend = match kind.trim().to_ascii_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres {
                database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: parse_or(
                    &lookup,
                    "BIDCAT_PG_MAX_CONNECTIONS",
                    DEFAULT_PG_MAX_CONNECTIONS,
                )?,
                acquire_timeout_secs: parse_or(
                    &lookup,
                    "BIDCAT_PG_ACQUIRE_TIMEOUT_SECS",
                    DEFAULT_PG_ACQUIRE_TIMEOUT_SECS,
                )?,
            },
            "redis" => StoreBackend::Redis {
                redis_url: lookup("REDIS_URL").unwrap_or_else(default_redis_url),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "BIDCAT_STORE",
                    reason: format!("unknown store '{other}' (expected memory, postgres or redis)"),
                });
            }
        };

        let config = Self {
            backend,
            schema: LedgerSchema::default(),
        };
        config.schema.validate()?;
        Ok(config)
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_to_memory_store() {
        let config = LedgerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LedgerConfig::default());
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = LedgerConfig::from_lookup(lookup(&[("BIDCAT_STORE", "postgres")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn postgres_reads_pool_settings() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("BIDCAT_STORE", "Postgres"),
            ("DATABASE_URL", "postgres://bank@localhost/bidcat"),
            ("BIDCAT_PG_MAX_CONNECTIONS", "12"),
        ]))
        .unwrap();

        assert_eq!(
            config.backend,
            StoreBackend::Postgres {
                database_url: "postgres://bank@localhost/bidcat".to_string(),
                max_connections: 12,
                acquire_timeout_secs: DEFAULT_PG_ACQUIRE_TIMEOUT_SECS,
            }
        );
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = LedgerConfig::from_lookup(lookup(&[
            ("BIDCAT_STORE", "postgres"),
            ("DATABASE_URL", "postgres://localhost/bidcat"),
            ("BIDCAT_PG_ACQUIRE_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid { var: "BIDCAT_PG_ACQUIRE_TIMEOUT_SECS", .. }
        ));
    }

    #[test]
    fn redis_url_has_a_default() {
        let config = LedgerConfig::from_lookup(lookup(&[("BIDCAT_STORE", "redis")])).unwrap();
        assert_eq!(
            config.backend,
            StoreBackend::Redis {
                redis_url: DEFAULT_REDIS_URL.to_string()
            }
        );
    }

    #[test]
    fn unknown_store_is_rejected() {
        let err = LedgerConfig::from_lookup(lookup(&[("BIDCAT_STORE", "mongo")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BIDCAT_STORE", .. }));
    }

    #[test]
    fn default_schema_uses_document_field_names() {
        let schema = LedgerSchema::default();
        schema.validate().unwrap();
        assert_eq!(schema.money_field, "money");
        assert_eq!(
            schema.record_fields(),
            ["id", "user", "change", "timestamp", "old_balance", "new_balance"]
        );
    }

    #[test]
    fn schema_rejects_unsafe_identifiers() {
        let schema = LedgerSchema {
            users_table: "users; DROP TABLE users".to_string(),
            ..LedgerSchema::default()
        };
        assert!(matches!(schema.validate(), Err(ConfigError::InvalidIdentifier(_))));

        let schema = LedgerSchema {
            money_field: "1money".to_string(),
            ..LedgerSchema::default()
        };
        assert!(matches!(schema.validate(), Err(ConfigError::InvalidIdentifier(_))));
    }

    #[test]
    fn schema_rejects_duplicate_record_fields() {
        let schema = LedgerSchema {
            new_balance_field: "change".to_string(),
            ..LedgerSchema::default()
        };
        assert_eq!(
            schema.validate(),
            Err(ConfigError::DuplicateField("change".to_string()))
        );
    }

    #[test]
    fn config_deserializes_with_partial_schema() {
        let config: LedgerConfig = serde_json::from_value(serde_json::json!({
            "backend": { "kind": "postgres", "database_url": "postgres://localhost/bidcat" },
            "schema": { "money_field": "balance" }
        }))
        .unwrap();

        assert_eq!(config.schema.money_field, "balance");
        assert_eq!(config.schema.users_table, "users");
        assert!(matches!(
            config.backend,
            StoreBackend::Postgres { max_connections: DEFAULT_PG_MAX_CONNECTIONS, .. }
        ));
    }
}
