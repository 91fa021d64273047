//! In-memory transaction and delayed-reference managers.
//!
//! Used by unit tests, the integration test crate and the simulator. The
//! reference manager keeps real per-extent counts and real head locks, so
//! threads contending on a head actually block.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{DedupError, DedupResult};
use crate::index::Extent;
use crate::refs::{HeadLock, RefOwner, ReferenceManager, TransactionManager};

/// Handle returned by [`MockTransactionManager::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTxn {
    /// Sequence number of the transaction.
    pub id: u64,
}

/// Transaction manager that only counts begin/end pairs.
#[derive(Debug, Default)]
pub struct MockTransactionManager {
    begun: AtomicU64,
    ended: AtomicU64,
    fail_begin: AtomicBool,
}

impl MockTransactionManager {
    /// Create a manager that accepts every transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `begin` calls fail.
    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Transactions started so far.
    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::SeqCst)
    }

    /// Transactions started but not yet ended.
    pub fn open_transactions(&self) -> u64 {
        self.begun() - self.ended.load(Ordering::SeqCst)
    }
}

impl TransactionManager for MockTransactionManager {
    type Handle = MockTxn;

    fn begin(&self) -> DedupResult<MockTxn> {
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(DedupError::Transaction("transaction aborted".to_string()));
        }
        let id = self.begun.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockTxn { id })
    }

    fn end(&self, _handle: MockTxn) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

/// A pending reference head handed out by [`MockReferenceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockHead {
    /// Extent the head belongs to.
    pub locator: u64,
    generation: u64,
}

#[derive(Debug)]
struct HeadState {
    generation: u64,
    locked: bool,
}

#[derive(Debug, Default)]
struct RefsInner {
    heads: HashMap<u64, HeadState>,
    refs: HashMap<u64, u64>,
    retire_on_lock: HashSet<u64>,
    next_generation: u64,
}

type HeadLockHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Delayed reference manager with real head locks and reference counts.
#[derive(Default)]
pub struct MockReferenceManager {
    inner: Mutex<RefsInner>,
    head_released: Condvar,
    atomic_increments: AtomicU64,
    locked_increments: AtomicU64,
    fail_increments: AtomicBool,
    on_lock: Mutex<Option<HeadLockHook>>,
    on_unlock: Mutex<Option<HeadLockHook>>,
}

impl MockReferenceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a pending head for `locator`, replacing any existing one.
    pub fn add_pending_head(&self, locator: u64) -> MockHead {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.heads.insert(
            locator,
            HeadState {
                generation,
                locked: false,
            },
        );
        MockHead {
            locator,
            generation,
        }
    }

    /// Run and retire the head for `locator`, waking anyone waiting on it.
    pub fn retire_head(&self, locator: u64) -> bool {
        let removed = self.inner.lock().heads.remove(&locator).is_some();
        self.head_released.notify_all();
        removed
    }

    /// Retire the head for `locator` the next time someone tries to lock it.
    pub fn retire_on_next_lock(&self, locator: u64) {
        self.inner.lock().retire_on_lock.insert(locator);
    }

    /// Lock the head for `locator` on behalf of some other in-flight work.
    ///
    /// Returns false when there is no head or it is already locked.
    pub fn lock_head_externally(&self, locator: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.heads.get_mut(&locator) {
            Some(head) if !head.locked => {
                head.locked = true;
                true
            }
            _ => false,
        }
    }

    /// Release a head locked with [`MockReferenceManager::lock_head_externally`].
    pub fn unlock_head_externally(&self, locator: u64) {
        if let Some(head) = self.inner.lock().heads.get_mut(&locator) {
            head.locked = false;
        }
        self.head_released.notify_all();
    }

    /// Run `hook(locator)` right after a head lock is granted.
    pub fn on_head_lock(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_lock.lock() = Some(Arc::new(hook));
    }

    /// Run `hook(locator)` whenever a head lock is released through
    /// [`ReferenceManager::unlock_head`].
    pub fn on_head_unlock(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_unlock.lock() = Some(Arc::new(hook));
    }

    /// Make every increment fail.
    pub fn fail_increments(&self, fail: bool) {
        self.fail_increments.store(fail, Ordering::SeqCst);
    }

    /// True while the head for `locator` is locked.
    pub fn is_head_locked(&self, locator: u64) -> bool {
        self.inner
            .lock()
            .heads
            .get(&locator)
            .is_some_and(|h| h.locked)
    }

    /// References added to `locator` through this manager.
    pub fn refs_for(&self, locator: u64) -> u64 {
        self.inner.lock().refs.get(&locator).copied().unwrap_or(0)
    }

    /// Total references added across all extents.
    pub fn total_refs(&self) -> u64 {
        self.inner.lock().refs.values().sum()
    }

    /// Increments recorded without a head.
    pub fn atomic_increments(&self) -> u64 {
        self.atomic_increments.load(Ordering::SeqCst)
    }

    /// Increments recorded under a head lock.
    pub fn locked_increments(&self) -> u64 {
        self.locked_increments.load(Ordering::SeqCst)
    }

    fn record_ref(&self, extent: Extent) -> DedupResult<()> {
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(DedupError::RefUpdate {
                locator: extent.locator,
                reason: "injected failure".to_string(),
            });
        }
        *self.inner.lock().refs.entry(extent.locator).or_insert(0) += 1;
        Ok(())
    }
}

impl ReferenceManager for MockReferenceManager {
    type Txn = MockTxn;
    type Head = MockHead;

    fn find_pending_head(&self, _txn: &MockTxn, locator: u64) -> Option<MockHead> {
        let inner = self.inner.lock();
        inner.heads.get(&locator).map(|h| MockHead {
            locator,
            generation: h.generation,
        })
    }

    fn try_lock_head(&self, _txn: &MockTxn, head: &MockHead) -> HeadLock {
        let mut inner = self.inner.lock();
        if inner.retire_on_lock.remove(&head.locator) {
            inner.heads.remove(&head.locator);
            drop(inner);
            self.head_released.notify_all();
            return HeadLock::Retry;
        }
        loop {
            match inner.heads.get_mut(&head.locator) {
                Some(state) if state.generation == head.generation => {
                    if !state.locked {
                        state.locked = true;
                        break;
                    }
                }
                _ => return HeadLock::Retry,
            }
            self.head_released.wait(&mut inner);
        }
        drop(inner);

        trace!(locator = head.locator, "mock head locked");
        let hook = self.on_lock.lock().clone();
        if let Some(hook) = hook {
            hook(head.locator);
        }
        HeadLock::Locked
    }

    fn unlock_head(&self, head: &MockHead) {
        let hook = self.on_unlock.lock().clone();
        if let Some(hook) = hook {
            hook(head.locator);
        }
        if let Some(state) = self.inner.lock().heads.get_mut(&head.locator) {
            if state.generation == head.generation {
                state.locked = false;
            }
        }
        self.head_released.notify_all();
    }

    fn increment_ref_atomic(&self, _txn: &MockTxn, extent: Extent, owner: RefOwner) -> DedupResult<()> {
        self.record_ref(extent)?;
        self.atomic_increments.fetch_add(1, Ordering::SeqCst);
        trace!(locator = extent.locator, inode = owner.inode, "mock atomic ref");
        Ok(())
    }

    fn increment_ref_locked(
        &self,
        _txn: &MockTxn,
        head: &MockHead,
        extent: Extent,
        owner: RefOwner,
    ) -> DedupResult<()> {
        if !self.is_head_locked(head.locator) {
            return Err(DedupError::RefUpdate {
                locator: extent.locator,
                reason: "head not locked".to_string(),
            });
        }
        self.record_ref(extent)?;
        self.locked_increments.fetch_add(1, Ordering::SeqCst);
        trace!(locator = extent.locator, inode = owner.inode, "mock locked ref");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const TXN: MockTxn = MockTxn { id: 1 };

    #[test]
    fn test_txn_counting() {
        let t = MockTransactionManager::new();
        let a = t.begin().unwrap();
        let b = t.begin().unwrap();
        assert_ne!(a, b);
        assert_eq!(t.open_transactions(), 2);
        t.end(a);
        t.end(b);
        assert_eq!(t.open_transactions(), 0);
        t.fail_begin(true);
        assert!(t.begin().is_err());
    }

    #[test]
    fn test_head_lock_cycle() {
        let r = MockReferenceManager::new();
        let head = r.add_pending_head(10);
        assert_eq!(r.find_pending_head(&TXN, 10), Some(head));
        assert_eq!(r.try_lock_head(&TXN, &head), HeadLock::Locked);
        assert!(r.is_head_locked(10));
        r.increment_ref_locked(&TXN, &head, Extent::new(10, 4096), RefOwner::new(5, 1, 0))
            .unwrap();
        r.unlock_head(&head);
        assert!(!r.is_head_locked(10));
        assert_eq!(r.refs_for(10), 1);
    }

    #[test]
    fn test_locked_increment_requires_lock() {
        let r = MockReferenceManager::new();
        let head = r.add_pending_head(10);
        assert!(r
            .increment_ref_locked(&TXN, &head, Extent::new(10, 4096), RefOwner::new(5, 1, 0))
            .is_err());
    }

    #[test]
    fn test_stale_head_retries() {
        let r = MockReferenceManager::new();
        let old = r.add_pending_head(10);
        r.retire_head(10);
        assert_eq!(r.try_lock_head(&TXN, &old), HeadLock::Retry);
        let _new = r.add_pending_head(10);
        assert_eq!(r.try_lock_head(&TXN, &old), HeadLock::Retry);
    }

    #[test]
    fn test_waiter_wakes_on_retire() {
        let r = Arc::new(MockReferenceManager::new());
        let head = r.add_pending_head(10);
        assert!(r.lock_head_externally(10));
        let r2 = Arc::clone(&r);
        let waiter = thread::spawn(move || r2.try_lock_head(&TXN, &head));
        thread::sleep(Duration::from_millis(20));
        r.retire_head(10);
        assert_eq!(waiter.join().unwrap(), HeadLock::Retry);
    }

    #[test]
    fn test_waiter_wakes_on_unlock() {
        let r = Arc::new(MockReferenceManager::new());
        let head = r.add_pending_head(10);
        assert!(r.lock_head_externally(10));
        let r2 = Arc::clone(&r);
        let waiter = thread::spawn(move || r2.try_lock_head(&TXN, &head));
        thread::sleep(Duration::from_millis(20));
        r.unlock_head_externally(10);
        assert_eq!(waiter.join().unwrap(), HeadLock::Locked);
        assert!(r.is_head_locked(10));
    }

    #[test]
    fn test_injected_failure() {
        let r = MockReferenceManager::new();
        r.fail_increments(true);
        assert!(r
            .increment_ref_atomic(&TXN, Extent::new(1, 1), RefOwner::new(5, 1, 0))
            .is_err());
        assert_eq!(r.total_refs(), 0);
    }
}
