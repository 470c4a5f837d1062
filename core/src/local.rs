//! Per-thread values held in an ordinary (shareable) object.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tether_types::ThreadKey;

use crate::sync::{read, write};

/// One lazily built `T` per thread that touches it.
///
/// Unlike `thread_local!`, a `ThreadLocal` is a value: it can live in a struct,
/// be shared behind an `Arc`, and be drained by whoever owns it exclusively.
/// A thread only ever sees the instance it created itself.
///
/// Values are never freed through `&self`: a `&T` handed out by
/// [`get`](Self::get) may still be in use on another thread after its own
/// thread exits. Thread keys are never reused, so a `ThreadLocal` touched by an
/// unbounded stream of short-lived threads grows without bound until the owner
/// prunes it with [`remove`](Self::remove) or [`clear`](Self::clear), or drops
/// it.
pub struct ThreadLocal<T> {
    slots: RwLock<HashMap<ThreadKey, Box<T>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

// SAFETY: a shared `&ThreadLocal` only hands each thread the value stored under
// its own key, so no `T` is ever reached from two threads through `&self`.
// Values may still be dropped or drained elsewhere, hence `T: Send`.
unsafe impl<T: Send> Sync for ThreadLocal<T> {}

impl<T> ThreadLocal<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// The calling thread's value, built by the factory on first access.
    pub fn get(&self) -> &T {
        self.get_or_init(|| (self.factory)())
    }

    /// The calling thread's value, built by `init` on first access.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(value) = self.try_get() {
            return value;
        }
        // Built outside the lock: `init` may itself use this `ThreadLocal`.
        let value = Box::new(init());
        let mut slots = write(&self.slots);
        let ptr: *const T = &**slots.entry(ThreadKey::current()).or_insert(value);
        drop(slots);
        // SAFETY: boxed values never move, and an entry is only removed through
        // `&mut self`, which cannot coexist with the returned borrow.
        unsafe { &*ptr }
    }

    /// The calling thread's value, without building one.
    pub fn try_get(&self) -> Option<&T> {
        let slots = read(&self.slots);
        let ptr: *const T = &**slots.get(&ThreadKey::current())?;
        drop(slots);
        // SAFETY: see `get_or_init`.
        Some(unsafe { &*ptr })
    }

    /// Number of threads holding a value.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.slots).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take one thread's value out, typically after that thread has exited.
    pub fn remove(&mut self, key: ThreadKey) -> Option<T> {
        self.slots_mut().remove(&key).map(|value| *value)
    }

    /// Drop every thread's value.
    pub fn clear(&mut self) {
        self.slots_mut().clear();
    }

    /// Every thread's value. Exclusive access means no thread is using them.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ThreadKey, &mut T)> {
        self.slots_mut()
            .iter_mut()
            .map(|(key, value)| (*key, &mut **value))
    }

    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_values()
            .map(|value| *value)
    }

    fn slots_mut(&mut self) -> &mut HashMap<ThreadKey, Box<T>> {
        self.slots
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default + 'static> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("threads", &self.len())
            .finish_non_exhaustive()
    }
}
