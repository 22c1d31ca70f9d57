use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use bidcat_core::{Money, TransactionRecord, UserId};
use bidcat_ledger::{BalanceStore, StoreError};

/// In-memory balance store.
///
/// Intended for tests/dev. The whole read-modify-write of an increment runs
/// under one write lock, which makes it atomic per user (and across users).
/// Every write is a single map operation, so a poisoned lock still guards
/// consistent data and is recovered rather than reported.
#[derive(Debug, Default)]
pub struct InMemoryBalanceStore {
    balances: RwLock<HashMap<UserId, Money>>,
    transactions: RwLock<HashMap<UserId, Vec<TransactionRecord>>>,
    reject_inserts: AtomicBool,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding for tests.
    pub fn with_user(self, user_id: UserId, balance: Money) -> Self {
        self.insert_user(user_id, balance);
        self
    }

    /// Create or overwrite a user's stored balance.
    ///
    /// Stands in for the identity store creating the user; no transaction is
    /// recorded.
    pub fn insert_user(&self, user_id: UserId, balance: Money) {
        self.balances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, balance);
    }

    /// Make `insert_transaction` fail until switched back, simulating an
    /// outage of the transaction log alone.
    pub fn fail_inserts(&self, fail: bool) {
        self.reject_inserts.store(fail, Ordering::SeqCst);
    }

    /// Number of records stored across all users.
    pub fn transaction_count(&self) -> usize {
        self.transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait::async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError> {
        let balances = self.balances.read().unwrap_or_else(PoisonError::into_inner);
        Ok(balances.get(user_id).copied())
    }

    async fn find_and_increment(
        &self,
        user_id: &UserId,
        delta: Money,
    ) -> Result<Option<Money>, StoreError> {
        let mut balances = self.balances.write().unwrap_or_else(PoisonError::into_inner);

        let Some(balance) = balances.get_mut(user_id) else {
            return Ok(None);
        };
        *balance = balance.checked_add(delta).ok_or(StoreError::Overflow)?;
        Ok(Some(*balance))
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "transaction log rejected the insert".to_string(),
            ));
        }

        let mut transactions = self.transactions.write().unwrap_or_else(PoisonError::into_inner);
        transactions
            .entry(record.user_id().clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let transactions = self.transactions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(transactions.get(user_id).cloned().unwrap_or_default())
    }
}
