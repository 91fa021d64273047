//! Synthetic write workload.
//!
//! Each writer thread produces blocks, some repeating earlier content, and
//! pushes them through the write path: hash, lookup, and on a miss allocate a
//! fresh extent and register it. A separate head runner plays the reference
//! layer, queueing pending heads on new extents and running them later, so
//! lookups exercise both the atomic and the head-locked claim paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use dedupfs_core::{
    DedupError, DedupManager, DedupStatus, LookupOutcome, MockReferenceManager,
    MockTransactionManager, RefOwner,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SimConfig;

type SimManager = DedupManager<MockTransactionManager, MockReferenceManager>;

const SIM_ROOT: u64 = 5;
const FIRST_INODE: u64 = 256;

/// Result of one workload run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub threads: u32,
    pub blocks_written: u64,
    pub deduplicated: u64,
    pub allocated: u64,
    pub freed: u64,
    pub bytes_saved: u64,
    pub dedupe_ratio: f64,
    /// References the mock reference layer recorded.
    pub references: u64,
    pub elapsed_ms: u64,
    pub status: DedupStatus,
}

#[derive(Debug, Default)]
struct ThreadStats {
    written: u64,
    deduplicated: u64,
    allocated: u64,
    freed: u64,
}

struct Shared {
    manager: Arc<SimManager>,
    refs: Arc<MockReferenceManager>,
    block_size: u64,
    next_content: AtomicU64,
    next_locator: AtomicU64,
    live_extents: Mutex<Vec<u64>>,
    pending_heads: Mutex<VecDeque<u64>>,
    stop: AtomicBool,
}

/// Run the workload described by `config` to completion.
pub fn run_workload(config: &SimConfig) -> anyhow::Result<WorkloadReport> {
    let dedup = config.validate()?;
    let txns = Arc::new(MockTransactionManager::new());
    let refs = Arc::new(MockReferenceManager::new());
    let manager = Arc::new(DedupManager::with_sector_size(
        Arc::clone(&txns),
        Arc::clone(&refs),
        config.sector_size,
    ));
    manager.enable_with(dedup)?;

    let w = &config.workload;
    info!(
        digest = %dedup.digest,
        backend = dedup.backend.name(),
        block_size = dedup.block_size,
        limit = dedup.limit,
        threads = w.threads,
        blocks = w.blocks,
        "starting workload"
    );

    let shared = Arc::new(Shared {
        manager: Arc::clone(&manager),
        refs: Arc::clone(&refs),
        block_size: dedup.block_size,
        next_content: AtomicU64::new(0),
        next_locator: AtomicU64::new(dedup.block_size),
        live_extents: Mutex::new(Vec::new()),
        pending_heads: Mutex::new(VecDeque::new()),
        stop: AtomicBool::new(false),
    });

    let start = Instant::now();
    let runner = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || run_heads(&shared))
    };

    let writers: Vec<_> = (0..w.threads)
        .map(|t| {
            let shared = Arc::clone(&shared);
            let w = w.clone();
            thread::spawn(move || write_blocks(&shared, t, &w))
        })
        .collect();

    let mut totals = ThreadStats::default();
    let mut failure = None;
    for writer in writers {
        match writer.join() {
            Ok(Ok(stats)) => {
                totals.written += stats.written;
                totals.deduplicated += stats.deduplicated;
                totals.allocated += stats.allocated;
                totals.freed += stats.freed;
            }
            Ok(Err(e)) => failure = Some(e),
            Err(_) => failure = Some(anyhow!("writer thread panicked")),
        }
    }
    shared.stop.store(true, Ordering::SeqCst);
    runner
        .join()
        .map_err(|_| anyhow!("head runner panicked"))?;
    if let Some(e) = failure {
        return Err(e);
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let dedupe_ratio = if totals.written == 0 {
        0.0
    } else {
        totals.deduplicated as f64 / totals.written as f64
    };
    let report = WorkloadReport {
        threads: w.threads,
        blocks_written: totals.written,
        deduplicated: totals.deduplicated,
        allocated: totals.allocated,
        freed: totals.freed,
        bytes_saved: totals.deduplicated * dedup.block_size,
        dedupe_ratio,
        references: refs.total_refs(),
        elapsed_ms,
        status: manager.status(),
    };
    info!(
        written = report.blocks_written,
        deduplicated = report.deduplicated,
        elapsed_ms,
        open_txns = txns.open_transactions(),
        "workload finished"
    );
    Ok(report)
}

fn write_blocks(
    shared: &Shared,
    thread_id: u32,
    w: &crate::config::WorkloadConfig,
) -> anyhow::Result<ThreadStats> {
    let mut rng = StdRng::seed_from_u64(w.seed.wrapping_add(u64::from(thread_id)));
    let mut buf = vec![0u8; shared.block_size as usize];
    let mut stats = ThreadStats::default();
    let inode = FIRST_INODE + u64::from(thread_id);

    for i in 0..w.blocks {
        let seen = shared.next_content.load(Ordering::Relaxed);
        let content = if seen > 0 && rng.gen_bool(w.duplicate_ratio) {
            rng.gen_range(0..seen)
        } else {
            shared.next_content.fetch_add(1, Ordering::Relaxed)
        };
        fill_block(&mut buf, content);

        let hash = shared.manager.hash_block(&buf)?;
        let owner = RefOwner::new(SIM_ROOT, inode, i * shared.block_size);
        match shared.manager.lookup(&hash, owner)? {
            LookupOutcome::Deduplicated(_) => stats.deduplicated += 1,
            LookupOutcome::NoMatch => {
                let locator = shared
                    .next_locator
                    .fetch_add(shared.block_size, Ordering::Relaxed);
                match shared.manager.add(&hash, locator, shared.block_size) {
                    Ok(_) | Err(DedupError::UnsupportedBackend { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                shared.live_extents.lock().push(locator);
                if rng.gen_bool(w.pending_head_ratio) {
                    shared.refs.add_pending_head(locator);
                    shared.pending_heads.lock().push_back(locator);
                }
                stats.allocated += 1;
            }
        }
        stats.written += 1;

        if w.free_ratio > 0.0 && rng.gen_bool(w.free_ratio) {
            let victim = {
                let mut live = shared.live_extents.lock();
                if live.is_empty() {
                    None
                } else {
                    let idx = rng.gen_range(0..live.len());
                    Some(live.swap_remove(idx))
                }
            };
            if let Some(locator) = victim {
                match shared.manager.remove(locator) {
                    Ok(()) | Err(DedupError::UnsupportedBackend { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                stats.freed += 1;
            }
        }
    }
    debug!(thread = thread_id, written = stats.written, deduplicated = stats.deduplicated, "writer done");
    Ok(stats)
}

/// Run queued heads until writers stop and the queue drains.
fn run_heads(shared: &Shared) {
    loop {
        let next = shared.pending_heads.lock().pop_front();
        match next {
            Some(locator) => {
                // Wait out any lookup currently holding the head.
                while !shared.refs.lock_head_externally(locator) {
                    thread::yield_now();
                }
                shared.refs.retire_head(locator);
            }
            None if shared.stop.load(Ordering::SeqCst) => return,
            None => thread::sleep(Duration::from_micros(200)),
        }
    }
}

/// Deterministic contents for content id `content`.
fn fill_block(buf: &mut [u8], content: u64) {
    let seed = content.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    for (i, chunk) in buf.chunks_mut(8).enumerate() {
        let word = (seed ^ i as u64).to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}
