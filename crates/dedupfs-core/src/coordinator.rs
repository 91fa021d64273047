//! Lookup-and-claim protocol.
//!
//! An index hit is only useful once a reference to the matched extent has
//! been recorded, otherwise the extent could be freed underneath the write.
//! The engine lock and a reference head lock are two lock domains that are
//! never nested in a fixed order: the engine lock is dropped before waiting
//! on a head, and the candidate is revalidated after it is retaken.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::digest::ContentHash;
use crate::engine::DedupEngine;
use crate::error::DedupResult;
use crate::index::Extent;
use crate::refs::{HeadLock, RefOwner, ReferenceManager, TransactionManager};

/// Result of a dedupe lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupOutcome {
    /// A reference to this extent was recorded; the write can point at it.
    Deduplicated(Extent),
    /// Nothing usable was found; allocate new space.
    NoMatch,
}

impl LookupOutcome {
    /// The claimed extent, if any.
    pub fn extent(&self) -> Option<Extent> {
        match self {
            LookupOutcome::Deduplicated(extent) => Some(*extent),
            LookupOutcome::NoMatch => None,
        }
    }

    /// True for [`LookupOutcome::Deduplicated`].
    pub fn is_hit(&self) -> bool {
        matches!(self, LookupOutcome::Deduplicated(_))
    }
}

/// Ends the transaction on every exit path.
struct TxnGuard<'a, T: TransactionManager> {
    txns: &'a T,
    handle: Option<T::Handle>,
}

impl<'a, T: TransactionManager> TxnGuard<'a, T> {
    fn begin(txns: &'a T) -> DedupResult<Self> {
        let handle = txns.begin()?;
        Ok(Self {
            txns,
            handle: Some(handle),
        })
    }
}

impl<T: TransactionManager> Drop for TxnGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.txns.end(handle);
        }
    }
}

/// Holds a locked reference head until dropped.
struct HeadGuard<'a, R: ReferenceManager> {
    refs: &'a R,
    head: R::Head,
}

impl<R: ReferenceManager> Drop for HeadGuard<'_, R> {
    fn drop(&mut self) {
        self.refs.unlock_head(&self.head);
    }
}

/// Turns index hits into safe dedupe decisions.
pub struct DedupCoordinator<T, R> {
    txns: Arc<T>,
    refs: Arc<R>,
}

impl<T, R> DedupCoordinator<T, R>
where
    T: TransactionManager,
    R: ReferenceManager<Txn = T::Handle>,
{
    /// Create a coordinator over the given collaborators.
    pub fn new(txns: Arc<T>, refs: Arc<R>) -> Self {
        Self { txns, refs }
    }

    /// Transaction manager in use.
    pub fn transactions(&self) -> &Arc<T> {
        &self.txns
    }

    /// Reference manager in use.
    pub fn references(&self) -> &Arc<R> {
        &self.refs
    }

    /// Look `hash` up in `engine` and, on a hit, add a reference for `owner`.
    ///
    /// Never reports [`LookupOutcome::Deduplicated`] unless the reference
    /// increment was accepted. Retired reference heads restart the protocol
    /// without bound.
    pub fn lookup(
        &self,
        engine: &DedupEngine,
        hash: &ContentHash,
        owner: RefOwner,
    ) -> DedupResult<LookupOutcome> {
        engine.check_hash(hash)?;
        let metrics = engine.metrics();
        metrics.record_lookup();

        if !engine.is_in_memory() {
            metrics.record_miss();
            return Ok(LookupOutcome::NoMatch);
        }

        let txn = match TxnGuard::begin(self.txns.as_ref()) {
            Ok(txn) => txn,
            Err(e) => {
                metrics.record_miss();
                return Err(e);
            }
        };
        let outcome = match txn.handle.as_ref() {
            Some(handle) => self.claim(engine, hash, owner, handle),
            None => Ok(LookupOutcome::NoMatch),
        };
        drop(txn);

        match &outcome {
            Ok(LookupOutcome::Deduplicated(_)) => metrics.record_hit(),
            _ => metrics.record_miss(),
        }
        outcome
    }

    fn claim(
        &self,
        engine: &DedupEngine,
        hash: &ContentHash,
        owner: RefOwner,
        txn: &T::Handle,
    ) -> DedupResult<LookupOutcome> {
        let metrics = engine.metrics();
        loop {
            let mut state = engine.lock();
            let Some(extent) = state.find_by_hash(hash) else {
                trace!(hash = %hash, "dedupe miss");
                return Ok(LookupOutcome::NoMatch);
            };

            let Some(head) = self.refs.find_pending_head(txn, extent.locator) else {
                // No head can be run against this extent while we hold the
                // engine lock, so the atomic increment is safe here.
                self.refs.increment_ref_atomic(txn, extent, owner)?;
                drop(state);
                metrics.record_fast_path();
                trace!(locator = extent.locator, "dedupe hit (fast path)");
                return Ok(LookupOutcome::Deduplicated(extent));
            };

            // Waiting on the head with the engine lock held would invert the
            // lock order against whoever is running that head.
            drop(state);
            metrics.record_slow_path();

            if self.refs.try_lock_head(txn, &head) == HeadLock::Retry {
                metrics.record_retry();
                trace!(locator = extent.locator, "reference head retired, retrying");
                continue;
            }
            let head = HeadGuard {
                refs: self.refs.as_ref(),
                head,
            };

            let mut state = engine.lock();
            let outcome = match state.find_by_hash(hash) {
                Some(current) if current == extent => self
                    .refs
                    .increment_ref_locked(txn, &head.head, extent, owner)
                    .map(|()| LookupOutcome::Deduplicated(extent)),
                _ => {
                    metrics.record_vanished();
                    Ok(LookupOutcome::NoMatch)
                }
            };
            // Head first, then the engine lock.
            drop(head);
            drop(state);

            trace!(locator = extent.locator, outcome = ?outcome, "dedupe slow path done");
            return outcome;
        }
    }
}
