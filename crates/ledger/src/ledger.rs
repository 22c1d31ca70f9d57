//! Balance ledger: stored, reserved and available money, and the transaction
//! protocol that changes stored balances.
//!
//! ## Transaction Flow
//!
//! ```text
//! make_transaction(user, change)
//!   ↓
//! 1. Read stored balance        (missing user → TransactionFailed)
//!   ↓
//! 2. Atomic find-and-increment  (user vanished / store error → TransactionFailed)
//!   ↓
//! 3. Build TransactionRecord    (old balance derived from the increment result;
//!                                unrepresentable → UnrecordableAdjustment)
//!   ↓
//! 4. Insert record              (failure → AuditPersistFailure, balance NOT rolled back)
//!   ↓
//! 5. Return record
//! ```
//!
//! The ledger holds no lock of its own. Per-user ordering comes entirely from
//! the store's atomic increment, so concurrent transactions never lose an
//! update. Steps 2 and 4 are separate writes; a backend outage between them
//! leaves a balance change without its record, which is reported as
//! [`LedgerError::AuditPersistFailure`] instead of being hidden.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use bidcat_core::{Money, TransactionRecord, UserId};

use crate::error::LedgerError;
use crate::reservation::{ReservationError, ReservationRegistry};
use crate::store::BalanceStore;

/// User balance ledger over an injected [`BalanceStore`].
#[derive(Debug)]
pub struct Ledger<S> {
    store: S,
    reservations: Arc<ReservationRegistry>,
}

impl<S> Ledger<S>
where
    S: BalanceStore,
{
    /// Ledger with its own, initially empty, reservation registry.
    pub fn new(store: S) -> Self {
        Self::with_registry(store, Arc::new(ReservationRegistry::new()))
    }

    /// Ledger sharing an existing reservation registry.
    pub fn with_registry(store: S, reservations: Arc<ReservationRegistry>) -> Self {
        Self {
            store,
            reservations,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registry subsystems use to report money they hold reserved.
    pub fn reservations(&self) -> &Arc<ReservationRegistry> {
        &self.reservations
    }

    /// The user's stored balance.
    pub async fn total_money(&self, user_id: &UserId) -> Result<Money, LedgerError> {
        self.store
            .find_balance(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.clone()))
    }

    /// Money currently reserved for the user by registered checkers.
    pub async fn reserved_money(&self, user_id: &UserId) -> Result<Money, LedgerError> {
        Ok(self.reservations.total_reserved(user_id)?)
    }

    /// Stored balance minus reserved money.
    ///
    /// Not clamped: a negative result means reservations exceed the stored
    /// balance, which is an upstream inconsistency the caller should see.
    pub async fn available_money(&self, user_id: &UserId) -> Result<Money, LedgerError> {
        let total = self.total_money(user_id).await?;
        let reserved = self.reserved_money(user_id).await?;
        total
            .checked_sub(reserved)
            .ok_or_else(|| ReservationError::Overflow(user_id.clone()).into())
    }

    /// Adjust the user's stored balance by `change` and record it.
    ///
    /// `change` is signed; withdrawals are negative. Balances are not checked
    /// against reservations here; callers check `available_money` first.
    pub async fn make_transaction(
        &self,
        user_id: &UserId,
        change: Money,
    ) -> Result<TransactionRecord, LedgerError> {
        info!(user_id = %user_id, change, "attempting transaction");

        match self.store.find_balance(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(self.failed(user_id, change, "user not found")),
            Err(e) => {
                return Err(self.failed(user_id, change, format!("reading balance failed: {e}")));
            }
        }

        let new_balance = match self.store.find_and_increment(user_id, change).await {
            Ok(Some(balance)) => balance,
            Ok(None) => {
                return Err(self.failed(user_id, change, "user not found when adjusting balance"));
            }
            Err(e) => {
                return Err(self.failed(user_id, change, format!("adjusting balance failed: {e}")));
            }
        };

        let record = TransactionRecord::from_adjustment(user_id.clone(), change, Utc::now(), new_balance)
            .map_err(|e| {
                error!(
                    user_id = %user_id,
                    change,
                    new_balance,
                    error = %e,
                    "balance adjusted but store reported a balance no record can describe"
                );
                LedgerError::UnrecordableAdjustment {
                    user_id: user_id.clone(),
                    change,
                    new_balance,
                    reason: e.to_string(),
                }
            })?;

        debug!(record = %record, "constructed transaction record");

        if let Err(source) = self.store.insert_transaction(&record).await {
            error!(
                user_id = %user_id,
                transaction_id = %record.id(),
                old_balance = record.old_balance(),
                new_balance = record.new_balance(),
                error = %source,
                "balance adjusted but transaction record was not persisted"
            );
            return Err(LedgerError::AuditPersistFailure { record, source });
        }

        Ok(record)
    }

    /// The user's transaction log, oldest first.
    pub async fn transactions(&self, user_id: &UserId) -> Result<Vec<TransactionRecord>, LedgerError> {
        Ok(self.store.load_transactions(user_id).await?)
    }

    fn failed(&self, user_id: &UserId, change: Money, reason: impl Into<String>) -> LedgerError {
        let reason = reason.into();
        error!(user_id = %user_id, change, reason = %reason, "transaction failed");
        LedgerError::transaction_failed(user_id, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing::Level;

    use crate::reservation::ReservedMoneyChecker;
    use crate::store::StoreError;
    use crate::test_support::LevelCounter;

    /// Minimal store for exercising the protocol; the real bindings live in
    /// `bidcat-infra`.
    #[derive(Default)]
    struct FakeStore {
        balances: Mutex<HashMap<UserId, Money>>,
        records: Mutex<Vec<TransactionRecord>>,
        reject_inserts: AtomicBool,
        /// Remove the user between the balance read and the increment.
        vanish_on_increment: AtomicBool,
        /// Report this balance from the increment instead of the real one.
        misreport_increment: Mutex<Option<Money>>,
    }

    impl FakeStore {
        fn with_user(id: &str, balance: Money) -> Self {
            let store = Self::default();
            store.balances.lock().unwrap().insert(user(id), balance);
            store
        }
    }

    #[async_trait::async_trait]
    impl BalanceStore for FakeStore {
        async fn find_balance(&self, user_id: &UserId) -> Result<Option<Money>, StoreError> {
            Ok(self.balances.lock().unwrap().get(user_id).copied())
        }

        async fn find_and_increment(
            &self,
            user_id: &UserId,
            delta: Money,
        ) -> Result<Option<Money>, StoreError> {
            let mut balances = self.balances.lock().unwrap();
            if self.vanish_on_increment.load(Ordering::SeqCst) {
                balances.remove(user_id);
            }
            match balances.get_mut(user_id) {
                Some(balance) => {
                    *balance = balance.checked_add(delta).ok_or(StoreError::Overflow)?;
                    Ok(Some(self.misreport_increment.lock().unwrap().unwrap_or(*balance)))
                }
                None => Ok(None),
            }
        }

        async fn insert_transaction(&self, record: &TransactionRecord) -> Result<(), StoreError> {
            if self.reject_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("transactions collection offline".to_string()));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load_transactions(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<TransactionRecord>, StoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.user_id() == user_id)
                .cloned()
                .collect())
        }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[tokio::test]
    async fn withdrawal_records_before_and_after() {
        let ledger = Ledger::new(FakeStore::with_user("alice", 100));
        let alice = user("alice");

        let record = ledger.make_transaction(&alice, -30).await.unwrap();

        assert_eq!(record.old_balance(), 100);
        assert_eq!(record.new_balance(), 70);
        assert_eq!(record.change(), -30);
        assert_eq!(ledger.total_money(&alice).await.unwrap(), 70);
        assert_eq!(ledger.available_money(&alice).await.unwrap(), 70);
        assert_eq!(ledger.transactions(&alice).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn available_money_subtracts_reservations() {
        let ledger = Ledger::new(FakeStore::with_user("bob", 50));
        let bob = user("bob");
        ledger
            .reservations()
            .register(Arc::new(|u: &UserId| if u.as_str() == "bob" { 20 } else { 0 }));

        assert_eq!(ledger.total_money(&bob).await.unwrap(), 50);
        assert_eq!(ledger.reserved_money(&bob).await.unwrap(), 20);
        assert_eq!(ledger.available_money(&bob).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn available_money_can_go_negative() {
        let ledger = Ledger::new(FakeStore::with_user("bob", 10));
        let bob = user("bob");
        ledger.reservations().register(Arc::new(|_: &UserId| 25));

        assert_eq!(ledger.available_money(&bob).await.unwrap(), -15);
    }

    #[tokio::test]
    async fn total_money_of_unknown_user_is_not_found() {
        let ledger = Ledger::new(FakeStore::default());
        let err = ledger.total_money(&user("nobody")).await.unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(u) if u.as_str() == "nobody"));
    }

    #[tokio::test]
    async fn transaction_for_unknown_user_fails_without_side_effects() {
        let ledger = Ledger::new(FakeStore::default());
        let ghost = user("ghost");

        let err = ledger.make_transaction(&ghost, 10).await.unwrap_err();

        assert!(matches!(err, LedgerError::TransactionFailed { .. }));
        assert!(!err.is_partially_committed());
        assert!(ledger.store().balances.lock().unwrap().is_empty());
        assert!(ledger.transactions(&ghost).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_vanishing_before_increment_fails_cleanly() {
        let store = FakeStore::with_user("carol", 40);
        store.vanish_on_increment.store(true, Ordering::SeqCst);
        let ledger = Ledger::new(store);
        let carol = user("carol");

        let err = ledger.make_transaction(&carol, 5).await.unwrap_err();

        assert!(matches!(err, LedgerError::TransactionFailed { ref user_id, .. } if user_id == &carol));
        assert!(ledger.transactions(&carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflowing_adjustment_fails_cleanly() {
        let ledger = Ledger::new(FakeStore::with_user("dave", Money::MAX));
        let dave = user("dave");

        let err = ledger.make_transaction(&dave, 1).await.unwrap_err();

        assert!(matches!(err, LedgerError::TransactionFailed { .. }));
        assert_eq!(ledger.total_money(&dave).await.unwrap(), Money::MAX);
    }

    #[tokio::test]
    async fn failed_audit_write_keeps_the_balance_change() {
        let store = FakeStore::with_user("erin", 100);
        store.reject_inserts.store(true, Ordering::SeqCst);
        let ledger = Ledger::new(store);
        let erin = user("erin");

        let err = ledger.make_transaction(&erin, -40).await.unwrap_err();

        assert!(err.is_partially_committed());
        let record = err.unpersisted_record().unwrap();
        assert_eq!(record.old_balance(), 100);
        assert_eq!(record.new_balance(), 60);
        assert!(matches!(
            err,
            LedgerError::AuditPersistFailure { source: StoreError::Unavailable(_), .. }
        ));
        assert_eq!(ledger.total_money(&erin).await.unwrap(), 60);
        assert!(ledger.transactions(&erin).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_increment_result_is_partially_committed() {
        let store = FakeStore::with_user("ivan", 10);
        *store.misreport_increment.lock().unwrap() = Some(Money::MIN);
        let ledger = Ledger::new(store);
        let ivan = user("ivan");

        let err = ledger.make_transaction(&ivan, 1).await.unwrap_err();

        assert!(err.is_partially_committed());
        assert!(err.unpersisted_record().is_none());
        assert!(matches!(
            err,
            LedgerError::UnrecordableAdjustment { change: 1, new_balance, .. } if new_balance == Money::MIN
        ));
        assert_eq!(ledger.total_money(&ivan).await.unwrap(), 11);
        assert!(ledger.transactions(&ivan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_transaction_logs_attempt_and_record() {
        let ledger = Ledger::new(FakeStore::with_user("judy", 5));
        let logs = LevelCounter::default();
        let _guard = logs.install();

        ledger.make_transaction(&user("judy"), 5).await.unwrap();

        assert_eq!(logs.count(Level::INFO), 1);
        assert_eq!(logs.count(Level::DEBUG), 1);
        assert_eq!(logs.count(Level::ERROR), 0);
    }

    #[tokio::test]
    async fn failed_transaction_logs_one_error() {
        let ledger = Ledger::new(FakeStore::default());
        let logs = LevelCounter::default();
        let _guard = logs.install();

        let err = ledger.make_transaction(&user("ghost"), 5).await.unwrap_err();

        assert!(matches!(err, LedgerError::TransactionFailed { .. }));
        assert_eq!(logs.count(Level::INFO), 1);
        assert_eq!(logs.count(Level::DEBUG), 0);
        assert_eq!(logs.count(Level::ERROR), 1);
    }

    #[tokio::test]
    async fn failed_audit_write_logs_one_error() {
        let store = FakeStore::with_user("kim", 20);
        store.reject_inserts.store(true, Ordering::SeqCst);
        let ledger = Ledger::new(store);
        let logs = LevelCounter::default();
        let _guard = logs.install();

        let err = ledger.make_transaction(&user("kim"), -5).await.unwrap_err();

        assert!(err.is_partially_committed());
        assert_eq!(logs.count(Level::INFO), 1);
        assert_eq!(logs.count(Level::DEBUG), 1);
        assert_eq!(logs.count(Level::ERROR), 1);
    }

    #[tokio::test]
    async fn reservation_errors_surface_from_available_money() {
        struct Broken;
        impl ReservedMoneyChecker for Broken {
            fn reserved_money(&self, _: &UserId) -> Result<Money, ReservationError> {
                Err(ReservationError::checker("auction state unavailable"))
            }
        }

        let ledger = Ledger::new(FakeStore::with_user("frank", 10));
        ledger.reservations().register(Arc::new(Broken));

        let err = ledger.available_money(&user("frank")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Reservation(ReservationError::Checker(_))));
    }

    #[tokio::test]
    async fn ledgers_can_share_a_registry() {
        let registry = Arc::new(ReservationRegistry::new());
        let a = Ledger::with_registry(FakeStore::with_user("gina", 30), registry.clone());
        let b = Ledger::with_registry(FakeStore::with_user("gina", 80), registry.clone());
        registry.register(Arc::new(|_: &UserId| 10));

        let gina = user("gina");
        assert_eq!(a.available_money(&gina).await.unwrap(), 20);
        assert_eq!(b.available_money(&gina).await.unwrap(), 70);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transactions_do_not_lose_updates() {
        let ledger = Arc::new(Ledger::new(FakeStore::with_user("hank", 1_000)));
        let hank = user("hank");

        let tasks: Vec<_> = (1..=50)
            .map(|i| {
                let ledger = ledger.clone();
                let hank = hank.clone();
                let change = if i % 2 == 0 { i } else { -i };
                tokio::spawn(async move { ledger.make_transaction(&hank, change).await })
            })
            .collect();

        let mut expected = 1_000;
        for task in tasks {
            let record = task.await.unwrap().unwrap();
            assert_eq!(record.new_balance(), record.old_balance() + record.change());
            expected += record.change();
        }

        assert_eq!(ledger.total_money(&hank).await.unwrap(), expected);
        assert_eq!(ledger.transactions(&hank).await.unwrap().len(), 50);
    }
}
