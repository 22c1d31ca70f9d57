//! `bidcat-core`: ledger domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! user identifiers, the money type and the immutable transaction record.

pub mod error;
pub mod id;
pub mod transaction;

pub use error::{DomainError, DomainResult};
pub use id::{TransactionId, UserId};
pub use transaction::{Money, TransactionRecord};
