//! Test Harness - dedupe manager wired to in-memory collaborators

use std::sync::{Arc, Once};

use dedupfs_core::{
    ContentHash, DedupConfig, DedupManager, DigestProvider, MockReferenceManager,
    MockTransactionManager, RefOwner, Sha256Digest, DEFAULT_BLOCKSIZE,
};

pub type TestManager = DedupManager<MockTransactionManager, MockReferenceManager>;

pub const BLOCK: u64 = 4096;

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Clone)]
pub struct TestDedup {
    pub manager: Arc<TestManager>,
    pub txns: Arc<MockTransactionManager>,
    pub refs: Arc<MockReferenceManager>,
}

impl TestDedup {
    pub fn disabled() -> Self {
        init_tracing();
        let txns = Arc::new(MockTransactionManager::new());
        let refs = Arc::new(MockReferenceManager::new());
        let manager = Arc::new(DedupManager::new(Arc::clone(&txns), Arc::clone(&refs)));
        Self {
            manager,
            txns,
            refs,
        }
    }

    pub fn with_limit(limit: u64) -> Self {
        let env = Self::disabled();
        env.manager
            .enable_with(DedupConfig {
                block_size: DEFAULT_BLOCKSIZE,
                limit,
                ..DedupConfig::default()
            })
            .expect("default config must enable");
        env
    }

    pub fn entries(&self) -> usize {
        self.manager.status().entries
    }
}

/// SHA-256 of a label, so tests can name their blocks.
pub fn hash(label: &str) -> ContentHash {
    Sha256Digest.hash(label.as_bytes())
}

pub fn owner(inode: u64, offset: u64) -> RefOwner {
    RefOwner::new(5, inode, offset)
}

/// Deterministic block contents for `seed`.
pub fn block(seed: u64, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| ((i as u64).wrapping_mul(31) ^ seed.wrapping_mul(2_654_435_761)) as u8)
        .collect()
}
