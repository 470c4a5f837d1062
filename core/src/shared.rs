//! Reference-counted values with reader/writer exclusion.
//!
//! Every clone of a [`SharedRef`] points at one control block, so the count and
//! the lock state are the same object for all of them. The count is the `Arc`
//! strong count; [`WeakRef::upgrade`] is `Weak::upgrade`, which can never revive
//! a block whose count already reached zero.
//!
//! The gate prefers writers: a writer announces itself before waiting for
//! readers to drain, and readers arriving after that wait behind it.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use tether_diagnostics::Diagnostics;
use tether_types::{BorrowError, BorrowKind, BorrowState, LockId, ThreadKey, TimeoutError};

use crate::context::{Gate, Grant, ThreadContextRegistry};
use crate::sync::{lock, wait_until_ready};
use crate::Coordinator;

/// Cleanup capability for values held in a [`SharedRef`].
///
/// Runs once, when the last strong handle is dropped.
pub trait Release {
    fn release(&mut self);
}

enum Cleanup<T> {
    Release(fn(&mut T)),
    Hook(Box<dyn FnOnce(&mut T) + Send>),
}

impl<T> Cleanup<T> {
    fn run(self, value: &mut T) {
        match self {
            Self::Release(release) => release(value),
            Self::Hook(hook) => hook(value),
        }
    }
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: Option<ThreadKey>,
    writers_waiting: usize,
}

impl RwState {
    fn admits(&self, kind: BorrowKind) -> bool {
        match kind {
            BorrowKind::Shared => self.writer.is_none() && self.writers_waiting == 0,
            BorrowKind::Exclusive => self.writer.is_none() && self.readers == 0,
        }
    }

    fn grant(&mut self, kind: BorrowKind, holder: ThreadKey) {
        match kind {
            BorrowKind::Shared => self.readers += 1,
            BorrowKind::Exclusive => self.writer = Some(holder),
        }
    }

    fn borrow_state(&self) -> BorrowState {
        if let Some(holder) = self.writer {
            return BorrowState::Exclusive { holder };
        }
        NonZeroUsize::new(self.readers)
            .map_or(BorrowState::Unborrowed, |count| BorrowState::Shared { count })
    }
}

pub(crate) struct RwGate {
    id: LockId,
    state: Mutex<RwState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    diagnostics: Arc<Diagnostics>,
}

impl RwGate {
    fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(RwState::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            diagnostics,
        }
    }

    fn try_acquire(&self, kind: BorrowKind, holder: ThreadKey) -> Result<(), BorrowState> {
        let mut state = lock(&self.state);
        if !state.admits(kind) {
            return Err(state.borrow_state());
        }
        state.grant(kind, holder);
        Ok(())
    }

    fn acquire(
        &self,
        kind: BorrowKind,
        holder: ThreadKey,
        deadline: Option<Instant>,
    ) -> Result<Option<Duration>, Duration> {
        {
            let mut state = lock(&self.state);
            if state.admits(kind) {
                state.grant(kind, holder);
                return Ok(None);
            }
            if kind == BorrowKind::Exclusive {
                // From here on, new readers queue behind this writer.
                state.writers_waiting += 1;
            }
        }

        let started = Instant::now();
        self.diagnostics.record_wait_start(holder, self.id, kind);

        let cv = match kind {
            BorrowKind::Shared => &self.readers_cv,
            BorrowKind::Exclusive => &self.writers_cv,
        };
        let state = lock(&self.state);
        match wait_until_ready(cv, state, deadline, |s| s.admits(kind)) {
            Ok(mut state) => {
                if kind == BorrowKind::Exclusive {
                    state.writers_waiting -= 1;
                }
                state.grant(kind, holder);
                Ok(Some(started.elapsed()))
            }
            Err(mut state) => {
                let mut wake_readers = false;
                if kind == BorrowKind::Exclusive {
                    state.writers_waiting -= 1;
                    wake_readers = state.writers_waiting == 0 && state.writer.is_none();
                }
                drop(state);
                if wake_readers {
                    self.readers_cv.notify_all();
                }
                let waited = started.elapsed();
                self.diagnostics.record_wait_abandoned(holder, waited);
                Err(waited)
            }
        }
    }

    fn borrow_state(&self) -> BorrowState {
        lock(&self.state).borrow_state()
    }
}

impl Gate for RwGate {
    fn lock_id(&self) -> LockId {
        self.id
    }

    fn release_borrow(&self, kind: BorrowKind, holder: ThreadKey) {
        let mut state = lock(&self.state);
        match kind {
            BorrowKind::Shared => {
                state.readers = state.readers.saturating_sub(1);
                let drained = state.readers == 0;
                drop(state);
                if drained {
                    self.writers_cv.notify_all();
                }
            }
            BorrowKind::Exclusive => {
                if state.writer == Some(holder) {
                    state.writer = None;
                }
                drop(state);
                self.writers_cv.notify_all();
                self.readers_cv.notify_all();
            }
        }
    }
}

struct SharedBlock<T> {
    gate: Arc<RwGate>,
    value: UnsafeCell<T>,
    cleanup: Option<Cleanup<T>>,
    registry: ThreadContextRegistry,
}

// SAFETY: `value` is reached only through guards granted by the gate, which
// never admits a writer alongside anything else. A writer may sit on any
// thread, hence `T: Send`. `cleanup` is only touched in `Drop`.
unsafe impl<T: Send + Sync> Sync for SharedBlock<T> {}

impl<T> Drop for SharedBlock<T> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run(self.value.get_mut());
            trace!(lock = %self.gate.id, "Cleanup hook ran");
        }
    }
}

/// A reference-counted handle to one value shared by many owners.
pub struct SharedRef<T> {
    block: Arc<SharedBlock<T>>,
}

impl<T> SharedRef<T> {
    pub fn new(coordinator: &Coordinator, value: T) -> Self {
        Self::build(coordinator, value, None)
    }

    /// Wrap `value` with a hook that runs once, when the last strong handle goes.
    pub fn with_cleanup(
        coordinator: &Coordinator,
        value: T,
        cleanup: impl FnOnce(&mut T) + Send + 'static,
    ) -> Self {
        Self::build(coordinator, value, Some(Cleanup::Hook(Box::new(cleanup))))
    }

    /// Wrap a value whose [`Release`] implementation runs when the last strong
    /// handle goes.
    pub fn with_release(coordinator: &Coordinator, value: T) -> Self
    where
        T: Release,
    {
        Self::build(coordinator, value, Some(Cleanup::Release(T::release)))
    }

    fn build(coordinator: &Coordinator, value: T, cleanup: Option<Cleanup<T>>) -> Self {
        Self {
            block: Arc::new(SharedBlock {
                gate: Arc::new(RwGate::new(Arc::clone(coordinator.diagnostics()))),
                value: UnsafeCell::new(value),
                cleanup,
                registry: coordinator.registry().clone(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> LockId {
        self.block.gate.id
    }

    /// Live strong handles to this value, this one included.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }

    #[must_use]
    pub fn weak_count(&self) -> usize {
        Arc::weak_count(&self.block)
    }

    #[must_use]
    pub fn state(&self) -> BorrowState {
        self.block.gate.borrow_state()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            block: Arc::downgrade(&self.block),
        }
    }

    /// Whether two handles share one control block.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.block, &other.block)
    }

    /// Shared access, waiting while a writer holds or awaits the value.
    pub fn read(&self) -> ReadGuard<'_, T> {
        ReadGuard::new(self, self.acquire_blocking(BorrowKind::Shared))
    }

    /// Exclusive access, waiting for active readers to drain.
    pub fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard::new(self, self.acquire_blocking(BorrowKind::Exclusive))
    }

    pub fn try_read(&self) -> Result<ReadGuard<'_, T>, BorrowError> {
        self.try_acquire(BorrowKind::Shared)
            .map(|grant| ReadGuard::new(self, grant))
    }

    pub fn try_write(&self) -> Result<WriteGuard<'_, T>, BorrowError> {
        self.try_acquire(BorrowKind::Exclusive)
            .map(|grant| WriteGuard::new(self, grant))
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadGuard<'_, T>, TimeoutError> {
        self.acquire_timeout(BorrowKind::Shared, timeout)
            .map(|grant| ReadGuard::new(self, grant))
    }

    pub fn write_timeout(&self, timeout: Duration) -> Result<WriteGuard<'_, T>, TimeoutError> {
        self.acquire_timeout(BorrowKind::Exclusive, timeout)
            .map(|grant| WriteGuard::new(self, grant))
    }

    fn acquire_blocking(&self, kind: BorrowKind) -> Grant {
        let holder = ThreadKey::current();
        let Ok(waited) = self.block.gate.acquire(kind, holder, None) else {
            unreachable!("a wait without deadline cannot expire");
        };
        self.grant(kind, holder, waited)
    }

    fn try_acquire(&self, kind: BorrowKind) -> Result<Grant, BorrowError> {
        let holder = ThreadKey::current();
        match self.block.gate.try_acquire(kind, holder) {
            Ok(()) => Ok(self.grant(kind, holder, None)),
            Err(state) => {
                self.block.gate.diagnostics.record_try_failure();
                Err(BorrowError {
                    lock: self.block.gate.id,
                    state,
                    requested: kind,
                })
            }
        }
    }

    fn acquire_timeout(&self, kind: BorrowKind, timeout: Duration) -> Result<Grant, TimeoutError> {
        let holder = ThreadKey::current();
        let deadline = Instant::now() + timeout;
        match self.block.gate.acquire(kind, holder, Some(deadline)) {
            Ok(waited) => Ok(self.grant(kind, holder, waited)),
            Err(waited) => Err(TimeoutError {
                lock: self.block.gate.id,
                requested: kind,
                waited,
            }),
        }
    }

    fn grant(&self, kind: BorrowKind, holder: ThreadKey, waited: Option<Duration>) -> Grant {
        let gate = &self.block.gate;
        self.block.registry.record_grant(
            Arc::downgrade(gate) as Weak<dyn Gate>,
            gate.id,
            kind,
            holder,
            waited,
        )
    }

    fn release(&self, grant: Grant) {
        self.block
            .registry
            .release_grant(self.block.gate.as_ref(), grant);
    }
}

impl<T> Clone for SharedRef<T> {
    fn clone(&self) -> Self {
        Self {
            block: Arc::clone(&self.block),
        }
    }
}

impl<T> fmt::Debug for SharedRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRef")
            .field("id", &self.id())
            .field("ref_count", &self.ref_count())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A non-owning observer of a [`SharedRef`]'s control block.
pub struct WeakRef<T> {
    block: Weak<SharedBlock<T>>,
}

impl<T> WeakRef<T> {
    /// A new strong handle, if the value is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<SharedRef<T>> {
        self.block.upgrade().map(|block| SharedRef { block })
    }

    /// Live strong handles; zero once the value was finalized.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.block.strong_count()
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            block: Weak::clone(&self.block),
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Shared access to a [`SharedRef`] value.
///
/// Guards stay on the thread that acquired them:
///
/// ```compile_fail
/// use std::thread;
/// use tether_core::Coordinator;
///
/// let coord = Coordinator::default();
/// let shared = coord.shared(1);
/// let guard = shared.read();
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _seen: i32 = *guard;
///     });
/// });
/// ```
pub struct ReadGuard<'a, T> {
    shared: &'a SharedRef<T>,
    grant: Grant,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> ReadGuard<'a, T> {
    fn new(shared: &'a SharedRef<T>, grant: Grant) -> Self {
        Self {
            shared,
            grant,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate counts this guard as a reader until it drops. The
        // only other release is `cleanup_thread`, whose caller guarantees this
        // guard is no longer reachable.
        unsafe { &*self.shared.block.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.release(self.grant);
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive access to a [`SharedRef`] value.
///
/// ```compile_fail
/// use std::thread;
/// use tether_core::Coordinator;
///
/// let coord = Coordinator::default();
/// let shared = coord.shared(1);
/// let guard = shared.write();
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _seen: i32 = *guard;
///     });
/// });
/// ```
pub struct WriteGuard<'a, T> {
    shared: &'a SharedRef<T>,
    grant: Grant,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> WriteGuard<'a, T> {
    fn new(shared: &'a SharedRef<T>, grant: Grant) -> Self {
        Self {
            shared,
            grant,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate records this guard as the only writer until it
        // drops, as for `ReadGuard`.
        unsafe { &*self.shared.block.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing through this guard.
        unsafe { &mut *self.shared.block.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.release(self.grant);
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
