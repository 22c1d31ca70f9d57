//! User balance ledger.
//!
//! Tracks a user's stored balance, the money other subsystems hold reserved in
//! memory, and the append-only log of balance changes. Storage is injected
//! through [`BalanceStore`]; concrete bindings live in `bidcat-infra`.

pub mod error;
pub mod ledger;
pub mod reservation;
pub mod store;

#[cfg(test)]
mod test_support;

pub use error::LedgerError;
pub use ledger::Ledger;
pub use reservation::{ReservationError, ReservationHandle, ReservationRegistry, ReservedMoneyChecker};
pub use store::{BalanceStore, StoreError};
