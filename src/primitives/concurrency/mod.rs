#![forbid(unsafe_code)]

//! Entity-level lock service shared by store scans and transaction apply.
//!
//! Locks are keyed by `(kind, id)` and come in shared and exclusive flavours.
//! Acquisition blocks until the lock is compatible; timeout policy, if any,
//! belongs to the implementation behind [`LockService`], never to its callers.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::types::{EntityId, EntityKind, Result};

/// Entity a lock protects.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LockTarget {
    /// Node or relationship.
    pub kind: EntityKind,
    /// Entity id within `kind`.
    pub id: EntityId,
}

impl LockTarget {
    /// Lock target for a node.
    pub const fn node(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Node,
            id,
        }
    }

    /// Lock target for a relationship.
    pub const fn relationship(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Relationship,
            id,
        }
    }
}

/// Lock flavour.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

/// Held lock; released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Guard that releases nothing, for services without real locking.
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Guard running `release` exactly once on drop.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("armed", &self.release.is_some())
            .finish()
    }
}

/// Process-wide arbiter of entity read/write conflicts.
pub trait LockService: Send + Sync {
    /// Blocks until `target` can be held in `mode`, then returns the guard.
    fn acquire(&self, target: LockTarget, mode: LockMode) -> Result<LockGuard>;
}

/// [`LockService`] that grants everything immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLockService;

impl LockService for NoopLockService {
    fn acquire(&self, _target: LockTarget, _mode: LockMode) -> Result<LockGuard> {
        Ok(LockGuard::noop())
    }
}

/// Snapshot of lock table occupancy for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Entities with at least one holder.
    pub locked_entities: usize,
    /// Shared holds across all entities.
    pub shared_holds: usize,
    /// Exclusive holds across all entities.
    pub exclusive_holds: usize,
}

impl LockSnapshot {
    /// Total holds of either flavour.
    pub fn total_holds(&self) -> usize {
        self.shared_holds + self.exclusive_holds
    }
}

#[derive(Default, Debug)]
struct LockState {
    shared: u32,
    exclusive: bool,
}

#[derive(Default)]
struct Inner {
    table: Mutex<FxHashMap<LockTarget, LockState>>,
    released: Condvar,
}

/// Blocking in-process lock table.
#[derive(Clone, Default)]
pub struct EntityLockService {
    inner: Arc<Inner>,
}

impl EntityLockService {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns current occupancy.
    pub fn snapshot(&self) -> LockSnapshot {
        let table = self.inner.table.lock();
        let mut snapshot = LockSnapshot {
            locked_entities: table.len(),
            ..LockSnapshot::default()
        };
        for state in table.values() {
            snapshot.shared_holds += state.shared as usize;
            if state.exclusive {
                snapshot.exclusive_holds += 1;
            }
        }
        snapshot
    }

    /// Total holds currently outstanding.
    pub fn held_locks(&self) -> usize {
        self.snapshot().total_holds()
    }

    fn release(inner: &Inner, target: LockTarget, mode: LockMode) {
        let mut table = inner.table.lock();
        let remove = match table.get_mut(&target) {
            Some(state) => {
                match mode {
                    LockMode::Shared => state.shared = state.shared.saturating_sub(1),
                    LockMode::Exclusive => state.exclusive = false,
                }
                state.shared == 0 && !state.exclusive
            }
            None => false,
        };
        if remove {
            table.remove(&target);
        }
        drop(table);
        inner.released.notify_all();
    }
}

impl LockService for EntityLockService {
    fn acquire(&self, target: LockTarget, mode: LockMode) -> Result<LockGuard> {
        let mut table = self.inner.table.lock();
        loop {
            let state = table.entry(target).or_default();
            let granted = match mode {
                LockMode::Shared => !state.exclusive,
                LockMode::Exclusive => !state.exclusive && state.shared == 0,
            };
            if granted {
                match mode {
                    LockMode::Shared => state.shared += 1,
                    LockMode::Exclusive => state.exclusive = true,
                }
                break;
            }
            self.inner.released.wait(&mut table);
        }
        drop(table);
        let inner = Arc::clone(&self.inner);
        Ok(LockGuard::new(move || {
            EntityLockService::release(&inner, target, mode);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_locks_stack() -> Result<()> {
        let locks = EntityLockService::new();
        let target = LockTarget::node(EntityId(7));
        let _a = locks.acquire(target, LockMode::Shared)?;
        let _b = locks.acquire(target, LockMode::Shared)?;
        let snapshot = locks.snapshot();
        assert_eq!(snapshot.locked_entities, 1);
        assert_eq!(snapshot.shared_holds, 2);
        Ok(())
    }

    #[test]
    fn guards_release_on_drop() -> Result<()> {
        let locks = EntityLockService::new();
        let guard = locks.acquire(LockTarget::relationship(EntityId(1)), LockMode::Exclusive)?;
        assert_eq!(locks.held_locks(), 1);
        drop(guard);
        assert_eq!(locks.held_locks(), 0);
        assert_eq!(locks.snapshot().locked_entities, 0);
        Ok(())
    }

    #[test]
    fn shared_blocks_until_exclusive_released() -> Result<()> {
        let locks = EntityLockService::new();
        let target = LockTarget::node(EntityId(3));
        let exclusive = locks.acquire(target, LockMode::Exclusive)?;
        let flag = Arc::new(AtomicBool::new(false));
        let waiter_flag = Arc::clone(&flag);
        let waiter_locks = locks.clone();
        let handle = thread::spawn(move || {
            let _shared = waiter_locks
                .acquire(target, LockMode::Shared)
                .expect("shared lock");
            waiter_flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(
            !flag.load(Ordering::SeqCst),
            "shared lock should wait for the exclusive holder"
        );
        drop(exclusive);
        handle.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(locks.held_locks(), 0);
        Ok(())
    }

    #[test]
    fn distinct_kinds_do_not_conflict() -> Result<()> {
        let locks = EntityLockService::new();
        let _node = locks.acquire(LockTarget::node(EntityId(1)), LockMode::Exclusive)?;
        let _rel = locks.acquire(LockTarget::relationship(EntityId(1)), LockMode::Exclusive)?;
        assert_eq!(locks.snapshot().exclusive_holds, 2);
        Ok(())
    }
}
