//! Redis-backed balance store (optional, feature `redis`).
//!
//! Layout:
//! - user balance: hash `<users_table>:<user id>`, field `<money_field>`
//! - transaction log: list `<transactions_table>:<user id>`, one JSON object per
//!   record, appended with `RPUSH`; object keys are the schema's record field
//!   names
//!
//! The increment runs as a Lua script so the existence check and `HINCRBY`
//! execute as one atomic step on the server.

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::{Map, Value};
use tracing::instrument;

use bidcat_core::{Money, TransactionId, TransactionRecord, UserId};
use bidcat_ledger::{BalanceStore, StoreError};

use crate::config::{ConfigError, LedgerSchema};

/// Increment `ARGV[1]` of hash `KEYS[1]` by `ARGV[2]`, only if the hash exists.
/// Returns nil for a missing user.
const INCREMENT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
return redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
"#;

/// Redis-backed [`BalanceStore`].
#[derive(Clone)]
pub struct RedisBalanceStore {
    conn: MultiplexedConnection,
    increment: Script,
    schema: LedgerSchema,
}

impl RedisBalanceStore {
    pub async fn connect(redis_url: &str, schema: &LedgerSchema) -> Result<Self, ConfigError> {
        schema.validate()?;

        let client =
            redis::Client::open(redis_url).map_err(|e| ConfigError::Connect(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConfigError::Connect(e.to_string()))?;

        Ok(Self {
            conn,
            increment: Script::new(INCREMENT_IF_EXISTS),
            schema: schema.clone(),
        })
    }

    fn user_key(&self, user_id: &UserId) -> String {
        format!("{}:{}", self.schema.users_table, user_id)
    }

    fn transactions_key(&self, user_id: &UserId) -> String {
        format!("{}:{}", self.schema.transactions_table, user_id)
    }
}

impl core::fmt::Debug for RedisBalanceStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBalanceStore")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        return StoreError::Unavailable(format!("redis unavailable in {operation}: {err}"));
    }
    // HINCRBY refuses with "increment or decrement would overflow".
    if err.to_string().contains("overflow") {
        return StoreError::Overflow;
    }
    StoreError::Backend(format!("redis error in {operation}: {err}"))
}

/// Encode a record as a JSON object keyed by the schema's record field names.
fn encode_record(schema: &LedgerSchema, record: &TransactionRecord) -> Result<String, StoreError> {
    let [id, user, change, timestamp, old_balance, new_balance] = schema.record_fields();

    let mut object = Map::new();
    object.insert(id.to_string(), Value::String(record.id().to_string()));
    object.insert(user.to_string(), Value::String(record.user_id().to_string()));
    object.insert(change.to_string(), Value::from(record.change()));
    object.insert(timestamp.to_string(), Value::String(record.timestamp().to_rfc3339()));
    object.insert(old_balance.to_string(), Value::from(record.old_balance()));
    object.insert(new_balance.to_string(), Value::from(record.new_balance()));

    serde_json::to_string(&Value::Object(object))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_record(schema: &LedgerSchema, payload: &str) -> Result<TransactionRecord, StoreError> {
    let [id, user, change, timestamp, old_balance, new_balance] = schema.record_fields();

    let mut object: Map<String, Value> =
        serde_json::from_str(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut field = |name: &str| {
        object
            .remove(name)
            .ok_or_else(|| StoreError::Serialization(format!("record field '{name}' missing")))
    };

    let id: TransactionId = from_field(id, field(id)?)?;
    let user: UserId = from_field(user, field(user)?)?;
    let change: Money = from_field(change, field(change)?)?;
    let timestamp = from_field(timestamp, field(timestamp)?)?;
    let old_balance: Money = from_field(old_balance, field(old_balance)?)?;
    let new_balance: Money = from_field(new_balance, field(new_balance)?)?;

    TransactionRecord::restore(id, user, change, timestamp, old_balance, new_balance)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_field<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("record field '{name}': {e}")))
}

#[async_trait::async_trait]
impl BalanceStore for RedisBalanceStore {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(self.user_key(user_id), &self.schema.money_field)
            .await
            .map_err(|e| map_redis_error("find_balance", e))
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_and_increment(
        &self,
        user_id: &UserId,
        delta: Money,
    ) -> Result<Option<Money>, StoreError> {
        let mut conn = self.conn.clone();
        self.increment
            .key(self.user_key(user_id))
            .arg(&self.schema.money_field)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("find_and_increment", e))
    }

    #[instrument(
        skip(self, record),
        fields(user_id = %record.user_id(), transaction_id = %record.id()),
        err
    )]
    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let payload = encode_record(&self.schema, record)?;

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .rpush(self.transactions_key(record.user_id()), payload)
            .await
            .map_err(|e| map_redis_error("insert_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn load_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn
            .lrange(self.transactions_key(user_id), 0, -1)
            .await
            .map_err(|e| map_redis_error("load_transactions", e))?;

        payloads
            .iter()
            .map(|p| decode_record(&self.schema, p))
            .collect()
    }
}
