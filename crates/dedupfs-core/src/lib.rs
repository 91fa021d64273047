#![warn(missing_docs)]

//! dedupfs core: in-memory content-addressed dedupe index for an extent store
//!
//! Write path: Block → Digest (SHA-256/BLAKE3) → Lookup (index hit + reference claim) → reuse extent
//!             or allocate → Add (register new extent for future dedupe)
//! Free path:  Extent freed → Remove

pub mod config;
pub mod coordinator;
pub mod digest;
pub mod engine;
pub mod error;
pub mod index;
pub mod manager;
pub mod metrics;
pub mod mock;
pub mod refs;

pub use config::{
    BackendMode, DedupConfig, BLOCKSIZE_MAX, BLOCKSIZE_MIN, DEFAULT_BLOCKSIZE,
    DEFAULT_INMEMORY_LIMIT, DEFAULT_SECTOR_SIZE,
};
pub use coordinator::{DedupCoordinator, LookupOutcome};
pub use digest::{Blake3Digest, ContentHash, DigestProvider, DigestType, Sha256Digest};
pub use engine::{AddOutcome, DedupEngine};
pub use error::{DedupError, DedupResult};
pub use index::{DedupEntry, DedupIndex, Extent, InsertOutcome};
pub use manager::{DedupManager, DedupStatus};
pub use metrics::{render_prometheus, DedupMetric, DedupMetrics, DedupMetricsSnapshot, MetricKind, MetricValue};
pub use mock::{MockHead, MockReferenceManager, MockTransactionManager, MockTxn};
pub use refs::{HeadLock, RefOwner, ReferenceManager, TransactionManager};
