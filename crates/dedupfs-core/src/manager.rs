//! Enable/disable/reconfigure lifecycle and the write-path facade.
//!
//! The manager owns at most one [`DedupEngine`]. Enabling with a different
//! digest, block size or backend drains the old engine and builds a new one;
//! changing only the limit is applied to the live engine. Callers that raced
//! with a disable keep an `Arc` to a drained, inactive engine and simply see
//! `Disabled` / `NoMatch`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DedupConfig, DEFAULT_SECTOR_SIZE};
use crate::coordinator::{DedupCoordinator, LookupOutcome};
use crate::digest::ContentHash;
use crate::engine::{AddOutcome, DedupEngine};
use crate::error::{DedupError, DedupResult};
use crate::index::Extent;
use crate::metrics::{DedupMetrics, DedupMetricsSnapshot};
use crate::refs::{RefOwner, ReferenceManager, TransactionManager};

/// Serializable view of the dedupe state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupStatus {
    /// Whether an engine is active.
    pub enabled: bool,
    /// Active configuration, if enabled.
    pub config: Option<DedupConfig>,
    /// Live entries in the index.
    pub entries: usize,
    /// Counters accumulated since the manager was created.
    pub metrics: DedupMetricsSnapshot,
}

/// Entry point used by the write path.
pub struct DedupManager<T, R> {
    sector_size: u64,
    engine: RwLock<Option<Arc<DedupEngine>>>,
    coordinator: DedupCoordinator<T, R>,
    metrics: Arc<DedupMetrics>,
}

impl<T, R> DedupManager<T, R>
where
    T: TransactionManager,
    R: ReferenceManager<Txn = T::Handle>,
{
    /// Create a disabled manager using the default sector size.
    pub fn new(txns: Arc<T>, refs: Arc<R>) -> Self {
        Self::with_sector_size(txns, refs, DEFAULT_SECTOR_SIZE)
    }

    /// Create a disabled manager for storage with the given sector size.
    pub fn with_sector_size(txns: Arc<T>, refs: Arc<R>, sector_size: u64) -> Self {
        Self {
            sector_size,
            engine: RwLock::new(None),
            coordinator: DedupCoordinator::new(txns, refs),
            metrics: Arc::new(DedupMetrics::new()),
        }
    }

    /// Enable dedupe from raw type codes.
    ///
    /// `limit` 0 selects the default for in-memory backends.
    pub fn enable(&self, digest: u16, backend: u16, block_size: u64, limit: u64) -> DedupResult<()> {
        let config = DedupConfig::from_raw(digest, backend, block_size, limit)?;
        self.enable_with(config)
    }

    /// Enable dedupe, or reconfigure it if it is already enabled.
    pub fn enable_with(&self, config: DedupConfig) -> DedupResult<()> {
        let config = config.validate(self.sector_size).map_err(|e| {
            warn!(error = %e, "rejected dedupe configuration");
            e
        })?;

        let mut slot = self.engine.write();
        if let Some(engine) = slot.as_ref() {
            if !engine.config().requires_rebuild(&config) {
                engine.set_limit(config.limit)?;
                return Ok(());
            }
            debug!("dedupe configuration changed, rebuilding index");
            engine.disable();
        }
        *slot = Some(Arc::new(DedupEngine::new(config, Arc::clone(&self.metrics))));
        drop(slot);

        info!(
            digest = %config.digest,
            backend = config.backend.name(),
            block_size = config.block_size,
            limit = config.limit,
            "dedupe enabled"
        );
        Ok(())
    }

    /// Apply a new configuration to an enabled manager.
    pub fn reconfigure(&self, config: DedupConfig) -> DedupResult<()> {
        if !self.is_enabled() {
            return Err(DedupError::Disabled);
        }
        self.enable_with(config)
    }

    /// Change only the entry limit of the live index.
    ///
    /// Returns the number of evicted entries.
    pub fn set_limit(&self, limit: u64) -> DedupResult<usize> {
        self.current().ok_or(DedupError::Disabled)?.set_limit(limit)
    }

    /// Drain the index and switch dedupe off. Idempotent.
    pub fn disable(&self) -> DedupResult<()> {
        let engine = self.engine.write().take();
        if let Some(engine) = engine {
            let drained = engine.disable();
            info!(drained, "dedupe disabled");
        }
        Ok(())
    }

    /// True while an engine is active.
    pub fn is_enabled(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Active configuration, if enabled.
    pub fn config(&self) -> Option<DedupConfig> {
        self.current().map(|e| e.config())
    }

    /// The active engine, if enabled.
    pub fn engine(&self) -> Option<Arc<DedupEngine>> {
        self.current()
    }

    /// Counters shared by every engine this manager has built.
    pub fn metrics(&self) -> &Arc<DedupMetrics> {
        &self.metrics
    }

    /// Coordinator used for lookups.
    pub fn coordinator(&self) -> &DedupCoordinator<T, R> {
        &self.coordinator
    }

    /// Hash one block with the active digest.
    pub fn hash_block(&self, data: &[u8]) -> DedupResult<ContentHash> {
        let config = self.config().ok_or(DedupError::Disabled)?;
        if data.len() as u64 != config.block_size {
            return Err(DedupError::BlockLength {
                expected: config.block_size,
                actual: data.len() as u64,
            });
        }
        Ok(config.digest.provider().hash(data))
    }

    /// Register a newly written extent.
    pub fn add(&self, hash: &ContentHash, locator: u64, length: u64) -> DedupResult<AddOutcome> {
        self.current()
            .ok_or(DedupError::Disabled)?
            .add(hash, Extent::new(locator, length))
    }

    /// Forget the entry for a freed extent. Absent entries are not an error.
    pub fn remove(&self, locator: u64) -> DedupResult<()> {
        self.current().ok_or(DedupError::Disabled)?.remove(locator)?;
        Ok(())
    }

    /// Try to satisfy a write of `hash` by referencing an existing extent.
    ///
    /// A disabled manager always reports [`LookupOutcome::NoMatch`].
    pub fn lookup(&self, hash: &ContentHash, owner: RefOwner) -> DedupResult<LookupOutcome> {
        match self.current() {
            Some(engine) => self.coordinator.lookup(&engine, hash, owner),
            None => Ok(LookupOutcome::NoMatch),
        }
    }

    /// Snapshot of the current state.
    pub fn status(&self) -> DedupStatus {
        let engine = self.current();
        DedupStatus {
            enabled: engine.is_some(),
            config: engine.as_ref().map(|e| e.config()),
            entries: engine.as_ref().map_or(0, |e| e.len()),
            metrics: self.metrics.snapshot(),
        }
    }

    fn current(&self) -> Option<Arc<DedupEngine>> {
        self.engine.read().clone()
    }
}
