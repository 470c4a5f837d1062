use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Zero means "not yet assigned". A const-initialized `Cell` registers no
    // destructor, so the key stays readable while other thread-locals are torn down.
    static CURRENT_THREAD_KEY: Cell<u64> = const { Cell::new(0) };
}

/// Process-unique identity of an OS thread.
///
/// Keys are handed out lazily from a global counter the first time a thread asks
/// for its own key, and are never reused, so a key recorded in a diagnostic stays
/// unambiguous after the thread exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(u64);

impl ThreadKey {
    /// The key of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_THREAD_KEY.with(|slot| {
            let mut key = slot.get();
            if key == 0 {
                key = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
                slot.set(key);
            }
            Self(key)
        })
    }

    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Identity of one lock: the borrow gate of an `Owned` value or the control block
/// of a `SharedRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(u64);

impl LockId {
    /// Allocate a fresh, never-before-seen id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// Identity of one granted borrow, as recorded in a thread's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BorrowId(u64);

impl BorrowId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BorrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "borrow#{}", self.0)
    }
}
