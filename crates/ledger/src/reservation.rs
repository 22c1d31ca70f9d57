//! Reserved money: money other subsystems hold "in memory" before committing it.
//!
//! A subsystem that earmarks money (an open bid, a pending wager) registers a
//! checker reporting how much it currently holds for a given user. The
//! registry sums every checker to produce the user's reserved total.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::warn;

use bidcat_core::{Money, UserId};

/// Source of reserved money for users.
///
/// Implementations must be side-effect free and independent of each other:
/// the registry invokes them in no particular order.
///
/// Plain closures `Fn(&UserId) -> Money` implement this trait; implement it on
/// a type directly when the lookup itself can fail.
pub trait ReservedMoneyChecker: Send + Sync {
    fn reserved_money(&self, user_id: &UserId) -> Result<Money, ReservationError>;
}

impl<F> ReservedMoneyChecker for F
where
    F: Fn(&UserId) -> Money + Send + Sync,
{
    fn reserved_money(&self, user_id: &UserId) -> Result<Money, ReservationError> {
        Ok(self(user_id))
    }
}

/// Reserved money lookup error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// A checker could not compute its reserved amount.
    #[error("reserved money checker failed: {0}")]
    Checker(String),

    /// The reserved amounts for a user do not fit in `Money`.
    #[error("reserved money overflow for user {0}")]
    Overflow(UserId),
}

impl ReservationError {
    pub fn checker(msg: impl Into<String>) -> Self {
        Self::Checker(msg.into())
    }
}

/// Token identifying one registration; used to unregister.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationHandle(u64);

impl core::fmt::Display for ReservationHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "reservation#{}", self.0)
    }
}

#[derive(Default)]
struct Checkers {
    next_handle: u64,
    entries: BTreeMap<ReservationHandle, Arc<dyn ReservedMoneyChecker>>,
}

impl Checkers {
    fn find(&self, checker: &Arc<dyn ReservedMoneyChecker>) -> Option<ReservationHandle> {
        self.entries
            .iter()
            .find(|(_, existing)| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(checker)))
            .map(|(handle, _)| *handle)
    }
}

/// Set of registered reserved money checkers.
///
/// Safe to share across threads; registration, removal and totals may run
/// concurrently. A total never observes a checker half-removed: it works on a
/// snapshot taken under the read lock.
#[derive(Default)]
pub struct ReservationRegistry {
    checkers: RwLock<Checkers>,
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a checker and return the handle to remove it with.
    ///
    /// Registering the same checker instance (same `Arc` allocation) twice is
    /// a no-op: a warning is logged and the existing handle is returned, so the
    /// checker is still counted once.
    pub fn register(&self, checker: Arc<dyn ReservedMoneyChecker>) -> ReservationHandle {
        let mut checkers = self.checkers.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = checkers.find(&checker) {
            warn!(handle = %existing, "attempted to add duplicate reserved money checker");
            return existing;
        }

        checkers.next_handle += 1;
        let handle = ReservationHandle(checkers.next_handle);
        checkers.entries.insert(handle, checker);
        handle
    }

    /// Remove the checker registered under `handle`.
    ///
    /// Returns `false` (and logs a warning) when nothing is registered under it.
    pub fn unregister(&self, handle: ReservationHandle) -> bool {
        let mut checkers = self.checkers.write().unwrap_or_else(PoisonError::into_inner);

        if checkers.entries.remove(&handle).is_none() {
            warn!(%handle, "attempted to remove a reserved money checker, but it wasn't present");
            return false;
        }
        true
    }

    /// Sum of every registered checker's reserved money for `user_id`.
    ///
    /// Zero when nothing is registered. Checker errors are returned as-is.
    pub fn total_reserved(&self, user_id: &UserId) -> Result<Money, ReservationError> {
        let snapshot: Vec<Arc<dyn ReservedMoneyChecker>> = {
            let checkers = self.checkers.read().unwrap_or_else(PoisonError::into_inner);
            checkers.entries.values().cloned().collect()
        };

        snapshot.iter().try_fold(0 as Money, |total, checker| {
            let reserved = checker.reserved_money(user_id)?;
            total
                .checked_add(reserved)
                .ok_or_else(|| ReservationError::Overflow(user_id.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for ReservationRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReservationRegistry")
            .field("checkers", &self.len())
            .finish()
    }
}
