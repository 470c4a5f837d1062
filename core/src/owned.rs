//! Single-owner values with runtime-checked borrows.
//!
//! An [`Owned`] pairs a value with a borrow gate: the borrow state machine,
//! the owning thread and the transfer policy, all behind one mutex. Any thread
//! may borrow. Only the owner may transfer or extract, and a thread that gave
//! ownership away is refused as a *former* owner from then on.
//!
//! Borrows are handed out as [`BorrowHandle`] / [`BorrowHandleMut`]. A handle
//! borrows the `Owned` it came from, stays on the thread that acquired it, and
//! returns its borrow when dropped, on every exit path.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use tether_diagnostics::Diagnostics;
use tether_types::{
    BorrowError, BorrowId, BorrowKind, BorrowState, LockId, OwnershipError, OwnershipViolation,
    TetherError, ThreadKey, TimeoutError, TransferPolicy, UseAfterTransferError,
};

use crate::context::{Gate, Grant, ThreadContextRegistry};
use crate::sync::{lock, wait_until_ready};
use crate::Coordinator;

struct GateState {
    owner: ThreadKey,
    former_owners: Vec<ThreadKey>,
    borrow: BorrowState,
    policy: TransferPolicy,
}

impl GateState {
    fn check_owner(&self, lock_id: LockId, caller: ThreadKey) -> Result<(), TetherError> {
        if caller == self.owner {
            return Ok(());
        }
        if self.former_owners.contains(&caller) {
            return Err(UseAfterTransferError {
                lock: lock_id,
                previous_owner: caller,
                current_owner: self.owner,
            }
            .into());
        }
        Err(self.violation(lock_id, caller, OwnershipViolation::NotOwner))
    }

    fn check_unborrowed(&self, lock_id: LockId, caller: ThreadKey) -> Result<(), TetherError> {
        if self.borrow.is_unborrowed() {
            Ok(())
        } else {
            Err(self.violation(
                lock_id,
                caller,
                OwnershipViolation::BorrowsOutstanding(self.borrow),
            ))
        }
    }

    fn violation(
        &self,
        lock_id: LockId,
        caller: ThreadKey,
        violation: OwnershipViolation,
    ) -> TetherError {
        OwnershipError {
            lock: lock_id,
            owner: self.owner,
            caller,
            violation,
        }
        .into()
    }
}

/// The non-generic half of an [`Owned`]: the part thread contexts point at.
pub(crate) struct BorrowGate {
    id: LockId,
    state: Mutex<GateState>,
    released: Condvar,
    diagnostics: Arc<Diagnostics>,
}

impl BorrowGate {
    fn new(owner: ThreadKey, policy: TransferPolicy, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(GateState {
                owner,
                former_owners: Vec::new(),
                borrow: BorrowState::Unborrowed,
                policy,
            }),
            released: Condvar::new(),
            diagnostics,
        }
    }

    /// Grant immediately or report the state that prevents it.
    fn try_acquire(&self, kind: BorrowKind, holder: ThreadKey) -> Result<(), BorrowState> {
        let mut state = lock(&self.state);
        let next = state.borrow.acquire(kind, holder).ok_or(state.borrow)?;
        state.borrow = next;
        Ok(())
    }

    /// Grant, waiting until `deadline` if necessary.
    ///
    /// `Ok` carries how long the request waited (`None` if it did not). `Err`
    /// carries the time spent before giving up.
    fn acquire(
        &self,
        kind: BorrowKind,
        holder: ThreadKey,
        deadline: Option<Instant>,
    ) -> Result<Option<Duration>, Duration> {
        if self.try_acquire(kind, holder).is_ok() {
            return Ok(None);
        }

        let started = Instant::now();
        self.diagnostics.record_wait_start(holder, self.id, kind);

        let state = lock(&self.state);
        match wait_until_ready(&self.released, state, deadline, |s| s.borrow.admits(kind)) {
            Ok(mut state) => {
                if let Some(next) = state.borrow.acquire(kind, holder) {
                    state.borrow = next;
                }
                Ok(Some(started.elapsed()))
            }
            Err(state) => {
                drop(state);
                let waited = started.elapsed();
                self.diagnostics.record_wait_abandoned(holder, waited);
                Err(waited)
            }
        }
    }
}

impl Gate for BorrowGate {
    fn lock_id(&self) -> LockId {
        self.id
    }

    fn release_borrow(&self, kind: BorrowKind, _holder: ThreadKey) {
        let mut state = lock(&self.state);
        state.borrow = state.borrow.release(kind);
        let idle = state.borrow.is_unborrowed();
        drop(state);
        if idle {
            self.released.notify_all();
        }
    }
}

/// A value with exactly one owning thread and runtime-checked borrows.
///
/// `Owned<T>` is `Sync` when `T: Send + Sync`, so it can be shared by
/// reference (scoped threads, `Arc`) and borrowed from any thread.
pub struct Owned<T> {
    gate: Arc<BorrowGate>,
    value: UnsafeCell<T>,
    registry: ThreadContextRegistry,
}

// SAFETY: access to `value` is only handed out through handles granted by the
// gate, which never admits an exclusive borrow alongside any other borrow. An
// exclusive borrow may be taken on another thread, hence `T: Send`.
unsafe impl<T: Send + Sync> Sync for Owned<T> {}

impl<T> Owned<T> {
    /// Wrap `value`, owned by the calling thread, with the coordinator's
    /// default transfer policy.
    pub fn new(coordinator: &Coordinator, value: T) -> Self {
        Self::with_policy(coordinator, value, coordinator.transfer_policy())
    }

    pub fn with_policy(coordinator: &Coordinator, value: T, policy: TransferPolicy) -> Self {
        let owner = ThreadKey::current();
        let gate = Arc::new(BorrowGate::new(
            owner,
            policy,
            Arc::clone(coordinator.diagnostics()),
        ));
        let registry = coordinator.registry().clone();
        registry.register_owned(Arc::downgrade(&gate) as Weak<dyn Gate>);
        Self {
            gate,
            value: UnsafeCell::new(value),
            registry,
        }
    }

    #[must_use]
    pub fn id(&self) -> LockId {
        self.gate.id
    }

    #[must_use]
    pub fn owner(&self) -> ThreadKey {
        lock(&self.gate.state).owner
    }

    #[must_use]
    pub fn state(&self) -> BorrowState {
        lock(&self.gate.state).borrow
    }

    #[must_use]
    pub fn transfer_policy(&self) -> TransferPolicy {
        lock(&self.gate.state).policy
    }

    /// Shared borrow, waiting while an exclusive borrow is outstanding.
    pub fn borrow(&self) -> BorrowHandle<'_, T> {
        BorrowHandle::new(self, self.acquire_blocking(BorrowKind::Shared))
    }

    /// Exclusive borrow, waiting until no borrow of any kind is outstanding.
    ///
    /// Any thread may borrow; ownership only gates transfer and extraction.
    pub fn borrow_mut(&self) -> BorrowHandleMut<'_, T> {
        BorrowHandleMut::new(self, self.acquire_blocking(BorrowKind::Exclusive))
    }

    pub fn try_borrow(&self) -> Result<BorrowHandle<'_, T>, BorrowError> {
        self.try_acquire(BorrowKind::Shared)
            .map(|grant| BorrowHandle::new(self, grant))
    }

    pub fn try_borrow_mut(&self) -> Result<BorrowHandleMut<'_, T>, BorrowError> {
        self.try_acquire(BorrowKind::Exclusive)
            .map(|grant| BorrowHandleMut::new(self, grant))
    }

    /// Shared borrow, giving up after `timeout`.
    pub fn borrow_timeout(&self, timeout: Duration) -> Result<BorrowHandle<'_, T>, TimeoutError> {
        self.acquire_timeout(BorrowKind::Shared, timeout)
            .map(|grant| BorrowHandle::new(self, grant))
    }

    /// Exclusive borrow, giving up after `timeout`.
    pub fn borrow_mut_timeout(
        &self,
        timeout: Duration,
    ) -> Result<BorrowHandleMut<'_, T>, TimeoutError> {
        self.acquire_timeout(BorrowKind::Exclusive, timeout)
            .map(|grant| BorrowHandleMut::new(self, grant))
    }

    /// Hand ownership to `new_owner`.
    ///
    /// Fails if transfers are forbidden for this value, if the caller is not the
    /// owner, or while any borrow is outstanding. The check and the reassignment
    /// happen under one lock.
    pub fn transfer(&self, new_owner: ThreadKey) -> Result<(), TetherError> {
        let caller = ThreadKey::current();
        let mut state = lock(&self.gate.state);
        if !state.policy.is_allowed() {
            return Err(state.violation(
                self.gate.id,
                caller,
                OwnershipViolation::TransferForbidden,
            ));
        }
        state.check_owner(self.gate.id, caller)?;
        state.check_unborrowed(self.gate.id, caller)?;

        let previous = std::mem::replace(&mut state.owner, new_owner);
        state.former_owners.retain(|&key| key != new_owner);
        if previous != new_owner {
            state.former_owners.push(previous);
        }
        drop(state);

        debug!(lock = %self.gate.id, from = %previous, to = %new_owner, "Ownership transferred");
        Ok(())
    }

    /// Take the value out. Owner only, and only while nothing is borrowed.
    ///
    /// A borrow can only be outstanding here if a handle was leaked with
    /// `mem::forget`; the wrapper is then handed back inside the error.
    pub fn into_inner(self) -> Result<T, IntoInnerError<T>> {
        let caller = ThreadKey::current();
        let check = {
            let state = lock(&self.gate.state);
            state
                .check_owner(self.gate.id, caller)
                .and_then(|()| state.check_unborrowed(self.gate.id, caller))
        };
        match check {
            Ok(()) => {
                let Self { value, .. } = self;
                Ok(value.into_inner())
            }
            Err(error) => Err(IntoInnerError { owned: self, error }),
        }
    }

    fn acquire_blocking(&self, kind: BorrowKind) -> Grant {
        let holder = ThreadKey::current();
        let Ok(waited) = self.gate.acquire(kind, holder, None) else {
            unreachable!("a wait without deadline cannot expire");
        };
        self.grant(kind, holder, waited)
    }

    fn try_acquire(&self, kind: BorrowKind) -> Result<Grant, BorrowError> {
        let holder = ThreadKey::current();
        match self.gate.try_acquire(kind, holder) {
            Ok(()) => Ok(self.grant(kind, holder, None)),
            Err(state) => {
                self.gate.diagnostics.record_try_failure();
                Err(BorrowError {
                    lock: self.gate.id,
                    state,
                    requested: kind,
                })
            }
        }
    }

    fn acquire_timeout(&self, kind: BorrowKind, timeout: Duration) -> Result<Grant, TimeoutError> {
        let holder = ThreadKey::current();
        let deadline = Instant::now() + timeout;
        match self.gate.acquire(kind, holder, Some(deadline)) {
            Ok(waited) => Ok(self.grant(kind, holder, waited)),
            Err(waited) => Err(TimeoutError {
                lock: self.gate.id,
                requested: kind,
                waited,
            }),
        }
    }

    fn grant(&self, kind: BorrowKind, holder: ThreadKey, waited: Option<Duration>) -> Grant {
        self.registry.record_grant(
            Arc::downgrade(&self.gate) as Weak<dyn Gate>,
            self.gate.id,
            kind,
            holder,
            waited,
        )
    }

    fn release(&self, grant: Grant) {
        self.registry.release_grant(self.gate.as_ref(), grant);
    }
}

impl<T> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.gate.state);
        f.debug_struct("Owned")
            .field("id", &self.gate.id)
            .field("owner", &state.owner)
            .field("state", &state.borrow)
            .field("policy", &state.policy)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Owned::into_inner`] when extraction is refused.
pub struct IntoInnerError<T> {
    owned: Owned<T>,
    error: TetherError,
}

impl<T> IntoInnerError<T> {
    /// Recover the wrapper.
    #[must_use]
    pub fn into_owned(self) -> Owned<T> {
        self.owned
    }

    #[must_use]
    pub fn error(&self) -> &TetherError {
        &self.error
    }
}

impl<T> fmt::Debug for IntoInnerError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntoInnerError")
            .field("lock", &self.owned.gate.id)
            .field("error", &self.error)
            .finish()
    }
}

impl<T> fmt::Display for IntoInnerError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot extract value: {}", self.error)
    }
}

impl<T> std::error::Error for IntoInnerError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A granted shared borrow of an [`Owned`] value.
///
/// Neither `Send` nor `Sync`: the handle, and every reference into it, stays on
/// the thread whose context recorded the borrow.
///
/// ```compile_fail
/// use std::thread;
/// use tether_core::Coordinator;
///
/// let coord = Coordinator::default();
/// let owned = coord.owned(1);
/// let handle = owned.borrow();
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _seen: i32 = *handle;
///     });
/// });
/// ```
pub struct BorrowHandle<'a, T> {
    owned: &'a Owned<T>,
    grant: Grant,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> BorrowHandle<'a, T> {
    fn new(owned: &'a Owned<T>, grant: Grant) -> Self {
        Self {
            owned,
            grant,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn holder(&self) -> ThreadKey {
        self.grant.holder
    }

    #[must_use]
    pub fn borrow_id(&self) -> BorrowId {
        self.grant.id
    }
}

impl<T> Deref for BorrowHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate holds a shared borrow until this handle drops. The
        // only other release is `cleanup_thread`, whose caller guarantees this
        // handle is no longer reachable.
        unsafe { &*self.owned.value.get() }
    }
}

impl<T> Drop for BorrowHandle<'_, T> {
    fn drop(&mut self) {
        self.owned.release(self.grant);
    }
}

impl<T: fmt::Debug> fmt::Debug for BorrowHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowHandle")
            .field("lock", &self.owned.gate.id)
            .field("value", &**self)
            .finish()
    }
}

/// A granted exclusive borrow of an [`Owned`] value.
///
/// Like [`BorrowHandle`], pinned to its thread:
///
/// ```compile_fail
/// use std::thread;
/// use tether_core::Coordinator;
///
/// let coord = Coordinator::default();
/// let owned = coord.owned(1);
/// let handle = owned.borrow_mut();
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _seen: i32 = *handle;
///     });
/// });
/// ```
pub struct BorrowHandleMut<'a, T> {
    owned: &'a Owned<T>,
    grant: Grant,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> BorrowHandleMut<'a, T> {
    fn new(owned: &'a Owned<T>, grant: Grant) -> Self {
        Self {
            owned,
            grant,
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn holder(&self) -> ThreadKey {
        self.grant.holder
    }

    #[must_use]
    pub fn borrow_id(&self) -> BorrowId {
        self.grant.id
    }
}

impl<T> Deref for BorrowHandleMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate holds the exclusive borrow until this handle drops,
        // as for `BorrowHandle`.
        unsafe { &*self.owned.value.get() }
    }
}

impl<T> DerefMut for BorrowHandleMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing through this handle.
        unsafe { &mut *self.owned.value.get() }
    }
}

impl<T> Drop for BorrowHandleMut<'_, T> {
    fn drop(&mut self) {
        self.owned.release(self.grant);
    }
}

impl<T: fmt::Debug> fmt::Debug for BorrowHandleMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowHandleMut")
            .field("lock", &self.owned.gate.id)
            .field("value", &**self)
            .finish()
    }
}
