//! Wait-for graph over threads and the locks they hold or await.
//!
//! Edges:
//! - thread → lock it holds (with multiplicity, since shared borrows stack)
//! - thread → lock it is waiting on (at most one per thread)
//!
//! A deadlock is a cycle `t0 waits L0, held by t1, t1 waits L1, held by t2, ... held by t0`.
//! A thread waiting on a lock it already holds is a cycle of length one.

use std::collections::{BTreeMap, HashMap, HashSet};

use tether_types::{DeadlockReport, LockId, ThreadKey, WaitEdge};

#[derive(Debug, Default)]
pub struct WaitForGraph {
    held: HashMap<ThreadKey, BTreeMap<LockId, usize>>,
    holders: HashMap<LockId, HashSet<ThreadKey>>,
    waiting: HashMap<ThreadKey, LockId>,
}

impl WaitForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `thread` now holds one more borrow of `lock`.
    ///
    /// Also clears any pending wait of `thread`: a grant ends the wait.
    pub fn acquire(&mut self, thread: ThreadKey, lock: LockId) {
        self.waiting.remove(&thread);
        *self.held.entry(thread).or_default().entry(lock).or_insert(0) += 1;
        self.holders.entry(lock).or_default().insert(thread);
    }

    /// Record that `thread` returned one borrow of `lock`.
    pub fn release(&mut self, thread: ThreadKey, lock: LockId) {
        let Some(locks) = self.held.get_mut(&thread) else {
            return;
        };
        let Some(count) = locks.get_mut(&lock) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        locks.remove(&lock);
        if locks.is_empty() {
            self.held.remove(&thread);
        }
        if let Some(threads) = self.holders.get_mut(&lock) {
            threads.remove(&thread);
            if threads.is_empty() {
                self.holders.remove(&lock);
            }
        }
    }

    /// Record that `thread` started waiting on `lock`, and look for a cycle
    /// through it.
    pub fn begin_wait(&mut self, thread: ThreadKey, lock: LockId) -> Option<DeadlockReport> {
        self.waiting.insert(thread, lock);
        self.find_cycle(thread)
    }

    pub fn end_wait(&mut self, thread: ThreadKey) {
        self.waiting.remove(&thread);
    }

    /// Forget everything about `thread` (it exited or was cleaned up).
    pub fn forget_thread(&mut self, thread: ThreadKey) {
        self.waiting.remove(&thread);
        if let Some(locks) = self.held.remove(&thread) {
            for lock in locks.keys() {
                if let Some(threads) = self.holders.get_mut(lock) {
                    threads.remove(&thread);
                    if threads.is_empty() {
                        self.holders.remove(lock);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.held.clear();
        self.holders.clear();
        self.waiting.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty() && self.waiting.is_empty()
    }

    #[must_use]
    pub fn locks_held_by(&self, thread: ThreadKey) -> Vec<LockId> {
        self.held
            .get(&thread)
            .map(|locks| locks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Depth-first search for a path of waits that returns to `start`.
    #[must_use]
    pub fn find_cycle(&self, start: ThreadKey) -> Option<DeadlockReport> {
        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        if self.search(start, start, &mut path, &mut visited) {
            Some(self.report(&path))
        } else {
            None
        }
    }

    fn search(
        &self,
        start: ThreadKey,
        current: ThreadKey,
        path: &mut Vec<ThreadKey>,
        visited: &mut HashSet<ThreadKey>,
    ) -> bool {
        let Some(lock) = self.waiting.get(&current) else {
            return false;
        };
        let Some(holders) = self.holders.get(lock) else {
            return false;
        };
        // Sorted for a deterministic report when several cycles exist.
        let mut holders: Vec<ThreadKey> = holders.iter().copied().collect();
        holders.sort_unstable();

        for holder in holders {
            if holder == start {
                return true;
            }
            if visited.insert(holder) {
                path.push(holder);
                if self.search(start, holder, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    fn report(&self, path: &[ThreadKey]) -> DeadlockReport {
        let cycle = path
            .iter()
            .filter_map(|&thread| {
                let waits_for = *self.waiting.get(&thread)?;
                Some(WaitEdge {
                    thread,
                    holds: self.locks_held_by(thread),
                    waits_for,
                })
            })
            .collect();
        DeadlockReport { cycle }
    }
}
