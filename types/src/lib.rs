//! Core domain types for Tether.
//!
//! This crate contains the vocabulary shared by every other crate: thread and lock
//! identities, the borrow state machine, transfer policy, and the error taxonomy.
//! No IO and no blocking; everything here can be used from any layer.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod borrow;
mod error;
mod ids;

pub use borrow::{BorrowKind, BorrowState, TransferPolicy};
pub use error::{
    BorrowError, DeadlockReport, OwnershipError, OwnershipViolation, TetherError, TimeoutError,
    UseAfterTransferError, WaitEdge,
};
pub use ids::{BorrowId, LockId, ThreadKey};

/// Default upper bounds of the wait-time histogram buckets, in microseconds.
pub const DEFAULT_WAIT_BUCKETS_US: [u64; 6] = [10, 100, 1_000, 10_000, 100_000, 1_000_000];
