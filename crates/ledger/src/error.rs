//! Ledger error model.

use thiserror::Error;

use bidcat_core::{Money, TransactionRecord, UserId};

use crate::reservation::ReservationError;
use crate::store::StoreError;

/// Ledger operation error.
///
/// A transaction ends in one of three ways, and the error keeps them apart:
///
/// - success: the record is returned;
/// - [`LedgerError::TransactionFailed`]: nothing changed;
/// - [`LedgerError::AuditPersistFailure`]: the balance changed but its record
///   was not stored. Operators reconcile these from the carried record.
/// - [`LedgerError::UnrecordableAdjustment`]: the balance changed but the
///   store reported a result no valid record can describe. Operators reconcile
///   these from the carried user, change and reported balance.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No stored balance exists for the user.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// The balance was not adjusted.
    #[error("transaction failed for user {user_id}: {reason}")]
    TransactionFailed { user_id: UserId, reason: String },

    /// The balance was adjusted, but the audit record could not be persisted.
    #[error("balance adjusted but transaction record not persisted ({record}): {source}")]
    AuditPersistFailure {
        record: TransactionRecord,
        #[source]
        source: StoreError,
    },

    /// The balance was adjusted, but the reported new balance minus the change
    /// does not fit in `Money`, so no record could be built.
    #[error(
        "balance adjusted for user {user_id} by {change} but no record could be built \
         (store reported {new_balance}): {reason}"
    )]
    UnrecordableAdjustment {
        user_id: UserId,
        change: Money,
        new_balance: Money,
        reason: String,
    },

    /// Reserved money could not be computed.
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    /// Storage failed on a read path.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub(crate) fn transaction_failed(user_id: &UserId, reason: impl Into<String>) -> Self {
        Self::TransactionFailed {
            user_id: user_id.clone(),
            reason: reason.into(),
        }
    }

    /// True when money moved but its audit record is missing.
    pub fn is_partially_committed(&self) -> bool {
        matches!(
            self,
            Self::AuditPersistFailure { .. } | Self::UnrecordableAdjustment { .. }
        )
    }

    /// The record whose persistence failed, for reconciliation.
    pub fn unpersisted_record(&self) -> Option<&TransactionRecord> {
        match self {
            Self::AuditPersistFailure { record, .. } => Some(record),
            _ => None,
        }
    }
}
