//! Contracts of the external collaborators the lookup protocol talks to.
//!
//! The transaction manager and the delayed reference manager live outside
//! this crate and are shared with it behind `Arc`. [`crate::mock`] provides
//! in-memory implementations for tests and the simulator.

use serde::{Deserialize, Serialize};

use crate::error::DedupResult;
use crate::index::Extent;

/// Identity of the file range that will reference a deduplicated extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefOwner {
    /// Subvolume / root that owns the file.
    pub root: u64,
    /// Inode number of the file.
    pub inode: u64,
    /// Byte offset of the write inside the file.
    pub offset: u64,
}

impl RefOwner {
    /// Create an owner record.
    pub fn new(root: u64, inode: u64, offset: u64) -> Self {
        Self {
            root,
            inode,
            offset,
        }
    }
}

/// Outcome of [`ReferenceManager::try_lock_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLock {
    /// The caller now holds the head lock and must call
    /// [`ReferenceManager::unlock_head`].
    Locked,
    /// The head was retired while waiting; the caller must start over.
    Retry,
}

/// Begins and ends the transactions that reference updates belong to.
pub trait TransactionManager: Send + Sync {
    /// Transaction handle.
    type Handle;

    /// Join or start a transaction.
    fn begin(&self) -> DedupResult<Self::Handle>;

    /// Release a handle obtained from [`TransactionManager::begin`].
    fn end(&self, handle: Self::Handle);
}

/// Delayed reference-count subsystem.
///
/// A *pending head* is the not-yet-durable record of reference changes
/// queued against one extent. While a head exists it may be run (and the
/// extent possibly freed) by another thread, so increments must go through
/// the head lock.
pub trait ReferenceManager: Send + Sync {
    /// Transaction handle the manager records updates under.
    type Txn;
    /// Pending reference head.
    type Head;

    /// Find the pending head for `locator`, if any.
    ///
    /// Runs under the manager's own short internal lock only.
    fn find_pending_head(&self, txn: &Self::Txn, locator: u64) -> Option<Self::Head>;

    /// Block until the head lock is held, or report that the head was retired.
    fn try_lock_head(&self, txn: &Self::Txn, head: &Self::Head) -> HeadLock;

    /// Release a head locked by [`ReferenceManager::try_lock_head`].
    fn unlock_head(&self, head: &Self::Head);

    /// Queue a reference increment when no pending head exists.
    ///
    /// Must not block on head locks; callable while holding the engine lock.
    fn increment_ref_atomic(&self, txn: &Self::Txn, extent: Extent, owner: RefOwner) -> DedupResult<()>;

    /// Record a reference increment while the caller holds the head lock.
    fn increment_ref_locked(
        &self,
        txn: &Self::Txn,
        head: &Self::Head,
        extent: Extent,
        owner: RefOwner,
    ) -> DedupResult<()>;
}
