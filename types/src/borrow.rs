//! Borrow kinds, the per-lock borrow state machine, and transfer policy.
//!
//! The state machine is pure: callers hold their own mutex and use
//! [`BorrowState::acquire`] / [`BorrowState::release`] to compute the next state.
//!
//! ```text
//! Unborrowed ──shared──▶ Shared(n) ──shared──▶ Shared(n + 1)
//!     ▲                      │
//!     └──── last release ────┘
//!
//! Unborrowed ──exclusive──▶ Exclusive { holder } ──release──▶ Unborrowed
//! ```
//!
//! There is no edge between `Shared` and `Exclusive`: a request of the other kind
//! waits for a full return to `Unborrowed`.

use std::fmt;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::ThreadKey;

/// The kind of access a borrow grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorrowKind {
    /// Read access. Any number may coexist.
    Shared,
    /// Write access. Excludes every other borrow.
    Exclusive,
}

impl BorrowKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for BorrowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Borrow state of a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BorrowState {
    #[default]
    Unborrowed,
    /// One or more live shared borrows.
    Shared { count: NonZeroUsize },
    /// Exactly one live exclusive borrow.
    Exclusive { holder: ThreadKey },
}

impl BorrowState {
    /// Whether a request of `kind` could be granted right now.
    #[must_use]
    pub const fn admits(self, kind: BorrowKind) -> bool {
        match (self, kind) {
            (Self::Unborrowed, _) | (Self::Shared { .. }, BorrowKind::Shared) => true,
            (Self::Shared { .. }, BorrowKind::Exclusive) | (Self::Exclusive { .. }, _) => false,
        }
    }

    /// The state after granting a borrow of `kind` to `holder`, or `None` if the
    /// request is not admissible from this state.
    #[must_use]
    pub fn acquire(self, kind: BorrowKind, holder: ThreadKey) -> Option<Self> {
        match (self, kind) {
            (Self::Unborrowed, BorrowKind::Shared) => Some(Self::Shared {
                count: NonZeroUsize::MIN,
            }),
            (Self::Shared { count }, BorrowKind::Shared) => Some(Self::Shared {
                count: count.checked_add(1)?,
            }),
            (Self::Unborrowed, BorrowKind::Exclusive) => Some(Self::Exclusive { holder }),
            _ => None,
        }
    }

    /// The state after one borrow of `kind` is returned.
    ///
    /// A release that does not match the current state leaves it unchanged.
    #[must_use]
    pub fn release(self, kind: BorrowKind) -> Self {
        match (self, kind) {
            (Self::Shared { count }, BorrowKind::Shared) => NonZeroUsize::new(count.get() - 1)
                .map_or(Self::Unborrowed, |count| Self::Shared { count }),
            (Self::Exclusive { .. }, BorrowKind::Exclusive) => Self::Unborrowed,
            (state, _) => state,
        }
    }

    #[must_use]
    pub const fn is_unborrowed(self) -> bool {
        matches!(self, Self::Unborrowed)
    }

    /// Number of live borrows of any kind.
    #[must_use]
    pub const fn borrow_count(self) -> usize {
        match self {
            Self::Unborrowed => 0,
            Self::Shared { count } => count.get(),
            Self::Exclusive { .. } => 1,
        }
    }

    /// The kind of the live borrows, if any.
    #[must_use]
    pub const fn kind(self) -> Option<BorrowKind> {
        match self {
            Self::Unborrowed => None,
            Self::Shared { .. } => Some(BorrowKind::Shared),
            Self::Exclusive { .. } => Some(BorrowKind::Exclusive),
        }
    }
}

impl fmt::Display for BorrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unborrowed => f.write_str("unborrowed"),
            Self::Shared { count } => write!(f, "borrowed shared ({count})"),
            Self::Exclusive { holder } => write!(f, "borrowed exclusively by {holder}"),
        }
    }
}

/// Whether ownership of an `Owned` value may move to another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPolicy {
    #[default]
    Allowed,
    Forbidden,
}

impl TransferPolicy {
    #[must_use]
    pub const fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Forbidden
        }
    }

    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}
