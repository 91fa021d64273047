//! Capacity-bounded, lock-protected owner of one [`DedupIndex`].
//!
//! All index traversal and mutation happens under a single short-held
//! `parking_lot::Mutex`. Eviction runs inline with the mutating call, so the
//! entry count never exceeds the limit once a call returns.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{BackendMode, DedupConfig};
use crate::digest::ContentHash;
use crate::error::{DedupError, DedupResult};
use crate::index::{DedupEntry, DedupIndex, Extent, InsertOutcome};
use crate::metrics::DedupMetrics;

/// Result of a successful [`DedupEngine::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddOutcome {
    /// The entry was indexed; `evicted` older entries were dropped to make room.
    Inserted {
        /// Number of LRU entries evicted by this add.
        evicted: usize,
    },
    /// The hash was already indexed against another extent; nothing changed.
    DuplicateHash,
    /// The extent was already indexed; nothing changed.
    DuplicateLocator,
}

/// State guarded by the engine lock.
pub(crate) struct EngineState {
    index: DedupIndex,
    limit: u64,
    active: bool,
}

impl EngineState {
    fn is_active(&self) -> bool {
        self.active
    }

    /// Promote and return the extent mapped to `hash`.
    pub(crate) fn find_by_hash(&mut self, hash: &ContentHash) -> Option<Extent> {
        if !self.is_active() {
            return None;
        }
        self.index.find_by_hash(hash).map(|e| e.extent)
    }

    fn evict_to_limit(&mut self) -> usize {
        let mut evicted = 0;
        while self.index.len() as u64 > self.limit {
            match self.index.evict_tail() {
                Some(entry) => {
                    trace!(locator = entry.extent.locator, "evicted dedupe entry");
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// The dedupe engine for one enabled configuration.
pub struct DedupEngine {
    config: DedupConfig,
    state: Mutex<EngineState>,
    metrics: Arc<DedupMetrics>,
}

impl DedupEngine {
    /// Build an empty engine. `config` must already be validated.
    pub fn new(config: DedupConfig, metrics: Arc<DedupMetrics>) -> Self {
        debug!(
            digest = %config.digest,
            backend = config.backend.name(),
            block_size = config.block_size,
            limit = config.limit,
            "created dedupe engine"
        );
        Self {
            config,
            state: Mutex::new(EngineState {
                index: DedupIndex::new(),
                limit: config.limit,
                active: true,
            }),
            metrics,
        }
    }

    /// Active configuration, including the current live limit.
    pub fn config(&self) -> DedupConfig {
        DedupConfig {
            limit: self.state.lock().limit,
            ..self.config
        }
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<DedupMetrics> {
        &self.metrics
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// True when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False once [`DedupEngine::disable`] has run.
    pub fn is_active(&self) -> bool {
        self.state.lock().is_active()
    }

    /// Register a freshly written block for future dedupe.
    ///
    /// Duplicates are benign and reported as [`AddOutcome::DuplicateHash`] or
    /// [`AddOutcome::DuplicateLocator`].
    pub fn add(&self, hash: &ContentHash, extent: Extent) -> DedupResult<AddOutcome> {
        if extent.locator == 0 {
            warn!(length = extent.length, "rejected dedupe add with reserved locator 0");
            return Err(DedupError::InvalidLocator);
        }
        self.check_hash(hash)?;
        self.check_backend()?;

        let mut state = self.lock_active()?;
        let outcome = match state.index.insert(hash, extent)? {
            InsertOutcome::Inserted => {
                self.metrics.record_insert();
                let evicted = state.evict_to_limit();
                self.metrics.record_evictions(evicted as u64);
                AddOutcome::Inserted { evicted }
            }
            InsertOutcome::DuplicateHash => {
                self.metrics.record_duplicate_hash();
                AddOutcome::DuplicateHash
            }
            InsertOutcome::DuplicateLocator => {
                self.metrics.record_duplicate_locator();
                AddOutcome::DuplicateLocator
            }
        };
        drop(state);

        trace!(locator = extent.locator, outcome = ?outcome, "dedupe add");
        Ok(outcome)
    }

    /// Forget the entry for `locator`. Absent entries are not an error.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, locator: u64) -> DedupResult<bool> {
        self.check_backend()?;
        let removed = self.lock_active()?.index.remove_by_locator(locator);
        if removed {
            self.metrics.record_removal();
            trace!(locator, "removed dedupe entry");
        }
        Ok(removed)
    }

    /// Entry for `locator`, without touching recency.
    pub fn find_by_locator(&self, locator: u64) -> Option<DedupEntry> {
        let state = self.state.lock();
        if !state.is_active() {
            return None;
        }
        state.index.find_by_locator(locator)
    }

    /// Copies of all entries, most recently touched first.
    pub fn entries(&self) -> Vec<DedupEntry> {
        self.state.lock().index.recency_order()
    }

    /// Change the entry limit in place, evicting surplus entries immediately.
    ///
    /// Returns the number of evicted entries.
    /// A limit of 0 on an in-memory engine restores the default limit.
    pub fn set_limit(&self, limit: u64) -> DedupResult<usize> {
        let limit = self.config.backend.effective_limit(limit);
        let mut state = self.lock_active()?;
        state.limit = limit;
        let evicted = state.evict_to_limit();
        drop(state);

        self.metrics.record_evictions(evicted as u64);
        debug!(limit, evicted, "updated dedupe limit");
        Ok(evicted)
    }

    /// Drain every entry and mark the engine inactive.
    ///
    /// Returns the number of drained entries. Calling it twice is harmless.
    pub fn disable(&self) -> usize {
        let mut state = self.state.lock();
        let mut drained = 0;
        while state.index.evict_tail().is_some() {
            drained += 1;
        }
        state.index.clear();
        state.active = false;
        drop(state);

        self.metrics.record_evictions(drained as u64);
        debug!(drained, "disabled dedupe engine");
        drained
    }

    /// Take the engine lock. Used by the coordinator's lookup protocol.
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    pub(crate) fn check_hash(&self, hash: &ContentHash) -> DedupResult<()> {
        let expected = self.config.hash_len();
        if hash.len() != expected {
            return Err(DedupError::HashLength {
                expected,
                actual: hash.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        self.config.backend == BackendMode::InMemory
    }

    fn check_backend(&self) -> DedupResult<()> {
        if self.is_in_memory() {
            Ok(())
        } else {
            Err(DedupError::UnsupportedBackend {
                backend: self.config.backend.name(),
            })
        }
    }

    fn lock_active(&self) -> DedupResult<MutexGuard<'_, EngineState>> {
        let state = self.state.lock();
        if state.is_active() {
            Ok(state)
        } else {
            Err(DedupError::Disabled)
        }
    }
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("config", &self.config())
            .field("entries", &self.len())
            .finish()
    }
}
