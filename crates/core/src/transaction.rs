use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{TransactionId, UserId};

/// Amount of money, in the smallest unit the bank deals in.
///
/// Signed: withdrawals are negative changes.
pub type Money = i64;

/// Immutable audit entry for one balance change.
///
/// Invariant: `new_balance == old_balance + change`. Every constructor checks
/// it (including deserialization), so a record that exists is consistent.
///
/// Serialized field names match the persisted `transactions` documents:
/// `user`, `change`, `timestamp`, `old_balance`, `new_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecordFields")]
pub struct TransactionRecord {
    id: TransactionId,
    #[serde(rename = "user")]
    user_id: UserId,
    change: Money,
    timestamp: DateTime<Utc>,
    old_balance: Money,
    new_balance: Money,
}

impl TransactionRecord {
    /// Record a change applied on top of `old_balance`.
    pub fn new(
        user_id: UserId,
        change: Money,
        timestamp: DateTime<Utc>,
        old_balance: Money,
    ) -> DomainResult<Self> {
        let new_balance = old_balance
            .checked_add(change)
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;

        Ok(Self {
            id: TransactionId::new(),
            user_id,
            change,
            timestamp,
            old_balance,
            new_balance,
        })
    }

    /// Record a change given the balance it produced.
    ///
    /// This is the shape an atomic increment reports back: only the resulting
    /// balance is known, the previous one is derived from it.
    pub fn from_adjustment(
        user_id: UserId,
        change: Money,
        timestamp: DateTime<Utc>,
        new_balance: Money,
    ) -> DomainResult<Self> {
        let old_balance = new_balance
            .checked_sub(change)
            .ok_or_else(|| DomainError::invariant("balance overflow"))?;

        Ok(Self {
            id: TransactionId::new(),
            user_id,
            change,
            timestamp,
            old_balance,
            new_balance,
        })
    }

    /// Rebuild a record loaded from storage, re-checking its invariant.
    pub fn restore(
        id: TransactionId,
        user_id: UserId,
        change: Money,
        timestamp: DateTime<Utc>,
        old_balance: Money,
        new_balance: Money,
    ) -> DomainResult<Self> {
        if old_balance.checked_add(change) != Some(new_balance) {
            return Err(DomainError::invariant(format!(
                "transaction {id}: {old_balance} + {change} != {new_balance}"
            )));
        }

        Ok(Self {
            id,
            user_id,
            change,
            timestamp,
            old_balance,
            new_balance,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn change(&self) -> Money {
        self.change
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn old_balance(&self) -> Money {
        self.old_balance
    }

    pub fn new_balance(&self) -> Money {
        self.new_balance
    }
}

impl core::fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "transaction {} for {}: {:+} ({} -> {}) at {}",
            self.id,
            self.user_id,
            self.change,
            self.old_balance,
            self.new_balance,
            self.timestamp.to_rfc3339()
        )
    }
}

#[derive(Deserialize)]
struct RecordFields {
    id: TransactionId,
    user: UserId,
    change: Money,
    timestamp: DateTime<Utc>,
    old_balance: Money,
    new_balance: Money,
}

impl TryFrom<RecordFields> for TransactionRecord {
    type Error = DomainError;

    fn try_from(f: RecordFields) -> Result<Self, Self::Error> {
        Self::restore(f.id, f.user, f.change, f.timestamp, f.old_balance, f.new_balance)
    }
}
