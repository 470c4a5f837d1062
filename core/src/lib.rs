//! Runtime ownership and borrowing for values shared across OS threads.
//!
//! - [`Owned`]: one owning thread, many readers or one writer at a time.
//! - [`SharedRef`] / [`WeakRef`]: reference-counted co-ownership with
//!   writer-preferring reader/writer exclusion.
//! - [`ThreadLocal`]: one lazily built value per thread.
//! - [`AssertSend`] / [`AssertSync`]: hand-off markers.
//! - [`ThreadContextRegistry`]: which thread holds which borrow, including
//!   borrows still held by threads that exited.
//!
//! Everything is created against a [`Coordinator`], which also carries the
//! diagnostics sink.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod context;
mod coordinator;
mod local;
mod marker;
mod owned;
mod shared;
mod sync;

pub use context::{
    BorrowRecord, CleanupReport, ContextSnapshot, ForcedRelease, Gate, ThreadContext,
    ThreadContextRegistry,
};
pub use coordinator::{Coordinator, CoordinatorSnapshot};
pub use local::ThreadLocal;
pub use marker::{AssertSend, AssertSync};
pub use owned::{BorrowHandle, BorrowHandleMut, IntoInnerError, Owned};
pub use shared::{ReadGuard, Release, SharedRef, WeakRef, WriteGuard};

pub use tether_config::{ConfigError, ResolvedConfig, TetherConfig};
pub use tether_diagnostics::{DeadlockObserver, Diagnostics, DiagnosticsSnapshot};
pub use tether_types::{
    BorrowError, BorrowId, BorrowKind, BorrowState, DeadlockReport, LockId, OwnershipError,
    OwnershipViolation, TetherError, ThreadKey, TimeoutError, TransferPolicy,
    UseAfterTransferError, WaitEdge,
};
