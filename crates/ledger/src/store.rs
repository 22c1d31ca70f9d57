//! Storage boundary of the ledger.
//!
//! The ledger needs three primitives from its backend: read a balance,
//! atomically increment it, and append a transaction record. Any store that
//! provides them (document store, relational, key-value) can back a
//! [`Ledger`](crate::Ledger) without changing its behavior.

use std::sync::Arc;

use thiserror::Error;

use bidcat_core::{Money, TransactionRecord, UserId};

/// Storage operation error.
///
/// These are **infrastructure errors**; the ledger decides what they mean for
/// a transaction (clean failure vs. partially committed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend could not be reached (closed pool, timeout, refused connection).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The increment would push a balance outside the representable range.
    #[error("balance overflow")]
    Overflow,

    /// A stored document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence for user balances and the transaction log.
///
/// ## Implementation Requirements
///
/// - `find_and_increment` must be a single atomic read-modify-write,
///   linearizable per user id: two concurrent increments for the same user both
///   apply, one after the other, and neither is lost.
/// - `insert_transaction` appends; records are never updated or deleted.
/// - Retries, if any, belong to the implementation. The ledger never retries.
#[async_trait::async_trait]
pub trait BalanceStore: Send + Sync {
    /// Current stored balance, or `None` if the user does not exist.
    async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError>;

    /// Atomically add `delta` to the user's balance and return the new balance.
    ///
    /// Returns `Ok(None)` if the user does not exist; nothing is created.
    async fn find_and_increment(
        &self,
        user_id: &UserId,
        delta: Money,
    ) -> Result<Option<Money>, StoreError>;

    /// Append a transaction record to the audit log.
    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    /// Every record stored for the user, oldest first.
    async fn load_transactions(&self, user_id: &UserId)
        -> Result<Vec<TransactionRecord>, StoreError>;
}

#[async_trait::async_trait]
impl<S> BalanceStore for Arc<S>
where
    S: BalanceStore + ?Sized,
{
    async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError> {
        (**self).find_balance(user_id).await
    }

    async fn find_and_increment(
        &self,
        user_id: &UserId,
        delta: Money,
    ) -> Result<Option<Money>, StoreError> {
        (**self).find_and_increment(user_id, delta).await
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        (**self).insert_transaction(record).await
    }

    async fn load_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        (**self).load_transactions(user_id).await
    }
}
