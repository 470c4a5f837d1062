//! Error taxonomy.
//!
//! [`TetherError`] is the common base. Each subordinate kind is also its own type
//! so call sites that can only fail one way return exactly that type.

use std::fmt;
use std::fmt::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BorrowKind, BorrowState, LockId, ThreadKey};

/// A request for access could not be satisfied in the current borrow state.
///
/// Only raised by non-blocking calls; blocking calls wait instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot borrow {lock} as {requested}: currently {state}")]
pub struct BorrowError {
    pub lock: LockId,
    pub state: BorrowState,
    pub requested: BorrowKind,
}

/// Why an owner-only operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipViolation {
    /// The caller is not the recorded owner.
    NotOwner,
    /// Borrows are still outstanding.
    BorrowsOutstanding(BorrowState),
    /// The value was created with transfers disabled.
    TransferForbidden,
}

impl fmt::Display for OwnershipViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwner => f.write_str("caller is not the owner"),
            Self::BorrowsOutstanding(state) => write!(f, "value is {state}"),
            Self::TransferForbidden => f.write_str("transfer is forbidden"),
        }
    }
}

/// An owner-only operation (transfer, extraction) was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ownership violation on {lock}: {violation} (owner {owner}, caller {caller})")]
pub struct OwnershipError {
    pub lock: LockId,
    pub owner: ThreadKey,
    pub caller: ThreadKey,
    pub violation: OwnershipViolation,
}

/// A thread that gave ownership away tried to act as owner again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{previous_owner} transferred {lock} away; current owner is {current_owner}")]
pub struct UseAfterTransferError {
    pub lock: LockId,
    pub previous_owner: ThreadKey,
    pub current_owner: ThreadKey,
}

/// A bounded wait expired before the borrow could be granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {waited:?} waiting to borrow {lock} as {requested}")]
pub struct TimeoutError {
    pub lock: LockId,
    pub requested: BorrowKind,
    pub waited: Duration,
}

/// One thread's position in a wait-for cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub thread: ThreadKey,
    /// Locks the thread currently holds, ascending.
    pub holds: Vec<LockId>,
    pub waits_for: LockId,
}

/// A cycle in the wait-for graph.
///
/// Advisory only: producing one never blocks or fails the borrow that revealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("deadlock detected: {}", describe_cycle(.cycle))]
pub struct DeadlockReport {
    pub cycle: Vec<WaitEdge>,
}

impl DeadlockReport {
    /// Threads taking part in the cycle, in cycle order.
    pub fn threads(&self) -> impl Iterator<Item = ThreadKey> + '_ {
        self.cycle.iter().map(|edge| edge.thread)
    }

    #[must_use]
    pub fn involves(&self, thread: ThreadKey) -> bool {
        self.threads().any(|t| t == thread)
    }
}

fn describe_cycle(cycle: &[WaitEdge]) -> String {
    let mut out = String::new();
    for (i, edge) in cycle.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        let _ = write!(out, "{} holds [", edge.thread);
        for (j, lock) in edge.holds.iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{lock}");
        }
        let _ = write!(out, "] waits for {}", edge.waits_for);
    }
    out
}

/// Common base of every error the library raises.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TetherError {
    #[error(transparent)]
    Borrow(#[from] BorrowError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    UseAfterTransfer(#[from] UseAfterTransferError),
    #[error(transparent)]
    Deadlock(#[from] DeadlockReport),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl TetherError {
    #[must_use]
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, Self::Ownership(_))
    }

    #[must_use]
    pub fn is_use_after_transfer(&self) -> bool {
        matches!(self, Self::UseAfterTransfer(_))
    }
}
