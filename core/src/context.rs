//! Per-thread borrow bookkeeping.
//!
//! Every granted borrow is recorded in the context of the thread that holds it,
//! and every release removes the record again. The records let an operator see
//! what each thread is holding, including borrows a thread still held when it
//! exited.
//!
//! Thread exit is observed, never acted on: a borrow stays held until its handle
//! drops, even if that happens during thread-local teardown after the exit
//! sentinel ran. Returning a borrow without its handle is
//! [`ThreadContextRegistry::cleanup_thread`], which is `unsafe` because only the
//! caller can know that the handle is really gone.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use tether_diagnostics::Diagnostics;
use tether_types::{BorrowId, BorrowKind, LockId, ThreadKey};

use crate::sync::{lock, read, write};

/// A lock whose borrows can be returned by the registry.
pub trait Gate: Send + Sync {
    fn lock_id(&self) -> LockId;

    /// Return one borrow of `kind` held by `holder` and wake eligible waiters.
    fn release_borrow(&self, kind: BorrowKind, holder: ThreadKey);
}

/// A granted borrow as recorded in its holder's context.
#[derive(Debug, Clone, Serialize)]
pub struct BorrowRecord {
    pub id: BorrowId,
    pub lock: LockId,
    pub kind: BorrowKind,
    #[serde(skip)]
    gate: Weak<dyn Gate>,
}

/// What a handle needs to give its borrow back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Grant {
    pub(crate) holder: ThreadKey,
    pub(crate) kind: BorrowKind,
    pub(crate) id: BorrowId,
}

#[derive(Default)]
struct Book {
    borrows: BTreeMap<BorrowId, BorrowRecord>,
    owned: Vec<Weak<dyn Gate>>,
}

/// Bookkeeping for one OS thread.
pub struct ThreadContext {
    key: ThreadKey,
    name: Option<String>,
    exited: AtomicBool,
    retiring: AtomicBool,
    book: Mutex<Book>,
}

impl ThreadContext {
    fn new(key: ThreadKey, name: Option<String>) -> Self {
        Self {
            key,
            name,
            exited: AtomicBool::new(false),
            retiring: AtomicBool::new(false),
            book: Mutex::new(Book::default()),
        }
    }

    #[must_use]
    pub fn key(&self) -> ThreadKey {
        self.key
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The thread has terminated (its exit sentinel ran).
    #[must_use]
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Cleanup was requested while the thread was still running.
    #[must_use]
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    /// Borrows currently held by this thread, in grant order.
    #[must_use]
    pub fn active_borrows(&self) -> Vec<BorrowRecord> {
        lock(&self.book).borrows.values().cloned().collect()
    }

    /// Number of `Owned` values created by this thread that are still alive.
    #[must_use]
    pub fn owned_alive(&self) -> usize {
        lock(&self.book)
            .owned
            .iter()
            .filter(|gate| gate.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            thread: self.key,
            name: self.name.clone(),
            exited: self.is_exited(),
            retiring: self.is_retiring(),
            active_borrows: self.active_borrows(),
            owned_alive: self.owned_alive(),
        }
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("exited", &self.is_exited())
            .field("retiring", &self.is_retiring())
            .finish_non_exhaustive()
    }
}

/// Serializable view of one [`ThreadContext`].
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub thread: ThreadKey,
    pub name: Option<String>,
    pub exited: bool,
    pub retiring: bool,
    pub active_borrows: Vec<BorrowRecord>,
    pub owned_alive: usize,
}

/// A borrow returned by [`ThreadContextRegistry::cleanup_thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForcedRelease {
    pub lock: LockId,
    pub kind: BorrowKind,
}

/// Outcome of [`ThreadContextRegistry::cleanup_thread`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub thread: ThreadKey,
    pub released: Vec<ForcedRelease>,
    /// The thread was still running; cleanup will happen when it exits.
    pub deferred: bool,
}

impl CleanupReport {
    fn empty(thread: ThreadKey) -> Self {
        Self {
            thread,
            released: Vec::new(),
            deferred: false,
        }
    }
}

struct RegistryShared {
    contexts: RwLock<HashMap<ThreadKey, Arc<ThreadContext>>>,
    next_borrow: AtomicU64,
    reap_on_exit: bool,
    diagnostics: Arc<Diagnostics>,
}

impl RegistryShared {
    fn context(&self, key: ThreadKey) -> Option<Arc<ThreadContext>> {
        read(&self.contexts).get(&key).cloned()
    }

    fn on_thread_exit(&self, key: ThreadKey) {
        let Some(context) = self.context(key) else {
            return;
        };
        context.exited.store(true, Ordering::SeqCst);
        if context.is_retiring() {
            self.reclaim(key);
            return;
        }

        let outstanding = lock(&context.book).borrows.len();
        if outstanding > 0 {
            warn!(
                thread = %key,
                outstanding,
                "Thread exited with borrows still recorded; they stay held until released or cleaned up"
            );
            self.diagnostics.record_held_at_exit(outstanding);
        } else if self.reap_on_exit {
            self.remove_if_idle(key);
        }
    }

    /// Drop the context of an exited thread that holds nothing. Returns whether
    /// it was removed.
    fn remove_if_idle(&self, key: ThreadKey) -> bool {
        let removed = {
            let mut contexts = write(&self.contexts);
            let idle = contexts.get(&key).is_some_and(|context| {
                context.is_exited() && lock(&context.book).borrows.is_empty()
            });
            idle && contexts.remove(&key).is_some()
        };
        if removed {
            self.diagnostics.forget_thread(key);
            debug!(thread = %key, "Thread context removed");
        }
        removed
    }

    /// Remove the context of an exited thread and release its leftover borrows.
    ///
    /// Removal from the map decides who reclaims, so concurrent callers release
    /// each record at most once. Callers uphold the contract of
    /// [`ThreadContextRegistry::cleanup_thread`].
    fn reclaim(&self, key: ThreadKey) -> CleanupReport {
        let Some(context) = write(&self.contexts).remove(&key) else {
            return CleanupReport::empty(key);
        };
        let records = std::mem::take(&mut lock(&context.book).borrows);

        let mut released = Vec::with_capacity(records.len());
        for record in records.into_values() {
            let Some(gate) = record.gate.upgrade() else {
                continue;
            };
            warn!(
                thread = %key,
                lock = %record.lock,
                kind = %record.kind,
                "Force-releasing borrow left behind by exited thread"
            );
            gate.release_borrow(record.kind, key);
            self.diagnostics.record_forced_release(key, record.lock);
            released.push(ForcedRelease {
                lock: record.lock,
                kind: record.kind,
            });
        }
        self.diagnostics.forget_thread(key);
        debug!(thread = %key, released = released.len(), "Thread context removed");

        CleanupReport {
            thread: key,
            released,
            deferred: false,
        }
    }
}

#[derive(Default)]
struct ExitSentinel {
    watches: Vec<(Weak<RegistryShared>, ThreadKey)>,
}

impl Drop for ExitSentinel {
    fn drop(&mut self) {
        for (registry, key) in self.watches.drain(..) {
            if let Some(registry) = registry.upgrade() {
                registry.on_thread_exit(key);
            }
        }
    }
}

thread_local! {
    static EXIT_SENTINEL: RefCell<ExitSentinel> = RefCell::new(ExitSentinel::default());
}

/// Tell `registry` when the calling thread exits. Best effort: nothing is armed
/// once thread-local storage is being torn down, and the main thread's
/// thread-locals are not destroyed on every platform.
fn arm_exit_sentinel(registry: &Arc<RegistryShared>, key: ThreadKey) {
    let _ = EXIT_SENTINEL.try_with(|sentinel| {
        if let Ok(mut sentinel) = sentinel.try_borrow_mut() {
            sentinel.watches.push((Arc::downgrade(registry), key));
        }
    });
}

/// Map from thread to its [`ThreadContext`].
///
/// Cheap to clone; clones share one registry. A registry is constructed
/// explicitly (normally by a [`Coordinator`](crate::Coordinator)) and handed to
/// everything that records borrows.
#[derive(Clone)]
pub struct ThreadContextRegistry {
    shared: Arc<RegistryShared>,
}

impl ThreadContextRegistry {
    #[must_use]
    pub fn new(diagnostics: Arc<Diagnostics>, reap_on_exit: bool) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                contexts: RwLock::new(HashMap::new()),
                next_borrow: AtomicU64::new(1),
                reap_on_exit,
                diagnostics,
            }),
        }
    }

    /// The calling thread's context, created on first use.
    pub fn get_current_context(&self) -> Arc<ThreadContext> {
        let key = ThreadKey::current();
        if let Some(context) = self.shared.context(key) {
            return context;
        }

        let name = thread::current().name().map(str::to_owned);
        let (context, created) = {
            let mut contexts = write(&self.shared.contexts);
            match contexts.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let context = Arc::new(ThreadContext::new(key, name));
                    contexts.insert(key, Arc::clone(&context));
                    (context, true)
                }
            }
        };
        if created {
            arm_exit_sentinel(&self.shared, key);
            debug!(thread = %key, name = ?context.name(), "Thread context created");
        }
        context
    }

    /// Look up the context of any thread.
    #[must_use]
    pub fn context(&self, key: ThreadKey) -> Option<Arc<ThreadContext>> {
        self.shared.context(key)
    }

    /// Record an `Owned` value created by the calling thread.
    pub fn register_owned(&self, gate: Weak<dyn Gate>) {
        let context = self.get_current_context();
        let mut book = lock(&context.book);
        book.owned.retain(|gate| gate.strong_count() > 0);
        book.owned.push(gate);
    }

    /// Record a borrow of `lock` just granted to the calling thread.
    pub fn register_borrow(
        &self,
        lock_id: LockId,
        kind: BorrowKind,
        gate: Weak<dyn Gate>,
    ) -> BorrowId {
        let id = BorrowId::new(self.shared.next_borrow.fetch_add(1, Ordering::Relaxed));
        let context = self.get_current_context();
        lock(&context.book).borrows.insert(
            id,
            BorrowRecord {
                id,
                lock: lock_id,
                kind,
                gate,
            },
        );
        id
    }

    /// Remove a borrow record.
    ///
    /// `None` means the record is gone already: the registry force-released the
    /// borrow and the caller must not release it again. Removing the last record
    /// of an exited thread also drops its context when reaping is on.
    pub fn unregister_borrow(&self, holder: ThreadKey, id: BorrowId) -> Option<BorrowRecord> {
        let context = self.shared.context(holder)?;
        let (record, now_idle) = {
            let mut book = lock(&context.book);
            let record = book.borrows.remove(&id)?;
            (record, book.borrows.is_empty())
        };
        if now_idle && self.shared.reap_on_exit && context.is_exited() {
            self.shared.remove_if_idle(holder);
        }
        Some(record)
    }

    /// Account for a borrow a gate just granted to `holder`.
    pub(crate) fn record_grant(
        &self,
        gate: Weak<dyn Gate>,
        lock_id: LockId,
        kind: BorrowKind,
        holder: ThreadKey,
        waited: Option<Duration>,
    ) -> Grant {
        self.shared.diagnostics.record_grant(holder, lock_id, kind, waited);
        let id = self.register_borrow(lock_id, kind, gate);
        match waited {
            Some(waited) => {
                debug!(thread = %holder, lock = %lock_id, %kind, ?waited, "Borrow granted after wait");
            }
            None => trace!(thread = %holder, lock = %lock_id, %kind, "Borrow granted"),
        }
        Grant { holder, kind, id }
    }

    /// Give a handle's borrow back, unless the registry already did.
    pub(crate) fn release_grant(&self, gate: &dyn Gate, grant: Grant) {
        if self.unregister_borrow(grant.holder, grant.id).is_none() {
            return;
        }
        gate.release_borrow(grant.kind, grant.holder);
        self.shared
            .diagnostics
            .record_release(grant.holder, gate.lock_id());
        trace!(thread = %grant.holder, lock = %gate.lock_id(), kind = %grant.kind, "Borrow released");
    }

    /// Release every borrow still recorded for `key` and drop its context.
    ///
    /// An unknown thread yields an empty report. A thread that is still running
    /// is marked retiring instead and cleaned up by its exit sentinel; the report
    /// then has `deferred` set.
    ///
    /// # Safety
    ///
    /// Every handle and guard still recorded for `key` must be gone for good:
    /// leaked by value (`mem::forget`), never dropped afterwards, and not kept
    /// reachable through `Box::leak`, a reference cycle or a thread-local that
    /// outlives the exit sentinel. No reference obtained through one of them may
    /// still be in use. Otherwise the released lock is granted again while the
    /// old handle can still read or write the value.
    pub unsafe fn cleanup_thread(&self, key: ThreadKey) -> CleanupReport {
        let Some(context) = self.shared.context(key) else {
            return CleanupReport::empty(key);
        };
        context.retiring.store(true, Ordering::SeqCst);
        // Pairs with the store in `on_thread_exit`: at least one side sees the other.
        if !context.is_exited() {
            debug!(thread = %key, "Thread still running; cleanup deferred to thread exit");
            return CleanupReport {
                thread: key,
                released: Vec::new(),
                deferred: true,
            };
        }
        self.shared.reclaim(key)
    }

    /// Drop the contexts of exited threads that hold no borrows.
    ///
    /// Contexts of exited threads that still hold borrows are kept. Returns the
    /// threads that were removed.
    pub fn reap_exited(&self) -> Vec<ThreadKey> {
        let exited: Vec<ThreadKey> = read(&self.shared.contexts)
            .values()
            .filter(|context| context.is_exited())
            .map(|context| context.key)
            .collect();
        exited
            .into_iter()
            .filter(|&key| self.shared.remove_if_idle(key))
            .collect()
    }

    /// Exited threads whose contexts still record borrows.
    #[must_use]
    pub fn exited_with_borrows(&self) -> Vec<ThreadKey> {
        let mut keys: Vec<ThreadKey> = read(&self.shared.contexts)
            .values()
            .filter(|context| context.is_exited() && !lock(&context.book).borrows.is_empty())
            .map(|context| context.key)
            .collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.shared.contexts).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All contexts, ordered by thread key.
    #[must_use]
    pub fn contexts(&self) -> Vec<Arc<ThreadContext>> {
        let mut contexts: Vec<_> = read(&self.shared.contexts).values().cloned().collect();
        contexts.sort_by_key(|context| context.key);
        contexts
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ContextSnapshot> {
        self.contexts()
            .iter()
            .map(|context| context.snapshot())
            .collect()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }
}

impl std::fmt::Debug for ThreadContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContextRegistry")
            .field("contexts", &self.len())
            .field("reap_on_exit", &self.shared.reap_on_exit)
            .finish_non_exhaustive()
    }
}
