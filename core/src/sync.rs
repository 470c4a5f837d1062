//! Poison-tolerant wrappers around the std primitives.
//!
//! Every state transition guarded by these locks completes before any
//! application code runs, so a poisoned lock still holds consistent state.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Block on `cv` until `ready` holds for the guarded state.
///
/// With a deadline, gives the guard back as `Err` once it passes. Spurious and
/// broadcast wakeups re-check `ready`.
pub(crate) fn wait_until_ready<'a, T>(
    cv: &Condvar,
    mut guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
    ready: impl Fn(&T) -> bool,
) -> Result<MutexGuard<'a, T>, MutexGuard<'a, T>> {
    loop {
        if ready(&guard) {
            return Ok(guard);
        }
        guard = match deadline {
            None => cv.wait(guard).unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(guard);
                }
                cv.wait_timeout(guard, remaining)
                    .map_or_else(|poisoned| poisoned.into_inner().0, |(guard, _)| guard)
            }
        };
    }
}
