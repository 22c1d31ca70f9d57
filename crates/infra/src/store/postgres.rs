//! Postgres-backed balance store.
//!
//! Balances live in the users table and are adjusted with a single
//! `UPDATE ... SET money = money + $1 ... RETURNING money`, which Postgres
//! executes under a row lock: concurrent adjustments of one user serialize and
//! none is lost. Transaction records are appended to their own table.
//!
//! The two writes of a ledger transaction are separate statements (no shared
//! SQL transaction); see `bidcat_ledger::ledger` for how a failed record
//! insert is reported.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (numeric value out of range) | `22003` | `Overflow` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use bidcat_core::{Money, TransactionId, TransactionRecord, UserId};
use bidcat_ledger::{BalanceStore, StoreError};

use crate::config::{ConfigError, LedgerSchema};

/// SQL text rendered once from a [`LedgerSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct Statements {
    find_balance: String,
    increment: String,
    insert_transaction: String,
    load_transactions: String,
    create_users: String,
    create_transactions: String,
    create_transactions_index: String,
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

impl Statements {
    /// Render statements; `schema` must already be validated.
    fn render(schema: &LedgerSchema) -> Self {
        let users = quote(&schema.users_table);
        let id = quote(&schema.user_id_field);
        let money = quote(&schema.money_field);

        let transactions = quote(&schema.transactions_table);
        let [tx_id, tx_user, change, timestamp, old_balance, new_balance] =
            schema.record_fields().map(quote);

        Self {
            find_balance: format!("SELECT {money} FROM {users} WHERE {id} = $1"),
            increment: format!(
                "UPDATE {users} SET {money} = {money} + $1 WHERE {id} = $2 RETURNING {money}"
            ),
            insert_transaction: format!(
                "INSERT INTO {transactions} ({tx_id}, {tx_user}, {change}, {timestamp}, {old_balance}, {new_balance}) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ),
            load_transactions: format!(
                "SELECT {tx_id}, {tx_user}, {change}, {timestamp}, {old_balance}, {new_balance} \
                 FROM {transactions} WHERE {tx_user} = $1 ORDER BY {timestamp} ASC, {tx_id} ASC"
            ),
            create_users: format!(
                "CREATE TABLE IF NOT EXISTS {users} ({id} TEXT PRIMARY KEY, {money} BIGINT NOT NULL DEFAULT 0)"
            ),
            create_transactions: format!(
                "CREATE TABLE IF NOT EXISTS {transactions} (\
                 {tx_id} UUID PRIMARY KEY, \
                 {tx_user} TEXT NOT NULL, \
                 {change} BIGINT NOT NULL, \
                 {timestamp} TIMESTAMPTZ NOT NULL, \
                 {old_balance} BIGINT NOT NULL, \
                 {new_balance} BIGINT NOT NULL, \
                 CHECK ({new_balance} = {old_balance} + {change}))"
            ),
            create_transactions_index: format!(
                "CREATE INDEX IF NOT EXISTS {} ON {transactions} ({tx_user}, {timestamp})",
                quote(&format!(
                    "{}_{}_idx",
                    schema.transactions_table, schema.transaction_user_field
                ))
            ),
        }
    }
}

/// Postgres-backed [`BalanceStore`].
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool (Arc + Send + Sync); clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresBalanceStore {
    pool: Arc<PgPool>,
    statements: Arc<Statements>,
}

impl PostgresBalanceStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool, schema: &LedgerSchema) -> Result<Self, ConfigError> {
        schema.validate()?;
        Ok(Self {
            pool: Arc::new(pool),
            statements: Arc::new(Statements::render(schema)),
        })
    }

    /// Open a pool to `database_url` and create a store over it.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        schema: &LedgerSchema,
    ) -> Result<Self, ConfigError> {
        schema.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| ConfigError::Connect(e.to_string()))?;

        Self::new(pool, schema)
    }

    /// Create the users and transactions tables if they do not exist.
    ///
    /// Intended for dev/test databases; production schemas are managed by the
    /// identity store's migrations.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for (operation, statement) in [
            ("create_users", &self.statements.create_users),
            ("create_transactions", &self.statements.create_transactions),
            ("create_transactions_index", &self.statements.create_transactions_index),
        ] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BalanceStore for PostgresBalanceStore {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError> {
        let row = sqlx::query(&self.statements.find_balance)
            .bind(user_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_balance", e))?;

        row.map(|row| row.try_get::<i64, _>(0))
            .transpose()
            .map_err(|e| map_sqlx_error("find_balance", e))
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_and_increment(
        &self,
        user_id: &UserId,
        delta: Money,
    ) -> Result<Option<Money>, StoreError> {
        let row = sqlx::query(&self.statements.increment)
            .bind(delta)
            .bind(user_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_and_increment", e))?;

        row.map(|row| row.try_get::<i64, _>(0))
            .transpose()
            .map_err(|e| map_sqlx_error("find_and_increment", e))
    }

    #[instrument(
        skip(self, record),
        fields(user_id = %record.user_id(), transaction_id = %record.id()),
        err
    )]
    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        sqlx::query(&self.statements.insert_transaction)
            .bind(*record.id().as_uuid())
            .bind(record.user_id().as_str())
            .bind(record.change())
            .bind(record.timestamp())
            .bind(record.old_balance())
            .bind(record.new_balance())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn load_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(&self.statements.load_transactions)
            .bind(user_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_transactions", e))?;

        rows.iter().map(record_from_row).collect()
    }
}

/// Columns are read by position: the load statement selects them in
/// `LedgerSchema::record_fields` order.
fn record_from_row(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_transaction", e);

    let id: uuid::Uuid = row.try_get(0).map_err(decode)?;
    let user: String = row.try_get(1).map_err(decode)?;
    let change: i64 = row.try_get(2).map_err(decode)?;
    let timestamp: DateTime<Utc> = row.try_get(3).map_err(decode)?;
    let old_balance: i64 = row.try_get(4).map_err(decode)?;
    let new_balance: i64 = row.try_get(5).map_err(decode)?;

    let user_id = UserId::new(user).map_err(|e| StoreError::Serialization(e.to_string()))?;
    TransactionRecord::restore(
        TransactionId::from_uuid(id),
        user_id,
        change,
        timestamp,
        old_balance,
        new_balance,
    )
    .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // numeric_value_out_of_range
                Some("22003") => StoreError::Overflow,
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("timed out acquiring connection in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
