//! Property-based tests of the write path: arbitrary streams of block writes
//! and frees replayed through lookup/add/remove.

use std::collections::HashMap;

use dedupfs_core::LookupOutcome;
use proptest::prelude::*;

use crate::harness::{hash, owner, TestDedup, BLOCK};

/// One step of a write stream.
#[derive(Debug, Clone, Copy)]
pub enum WriteOp {
    /// File `file` writes a block whose content is identified by `content`.
    Write { file: u8, content: u8 },
    /// Free the `nth` live extent (modulo the live count).
    Free { nth: u8 },
}

pub fn arb_write_op() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        4 => (0u8..4, 0u8..32).prop_map(|(file, content)| WriteOp::Write { file, content }),
        1 => any::<u8>().prop_map(|nth| WriteOp::Free { nth }),
    ]
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    pub writes: u64,
    pub hits: u64,
    pub allocations: u64,
}

fn fail(e: dedupfs_core::DedupError) -> TestCaseError {
    TestCaseError::fail(e.to_string())
}

fn content_hash(content: u8) -> dedupfs_core::ContentHash {
    hash(&format!("content-{}", content))
}

/// Replay `ops` against `env`, checking every hit points at a live extent
/// holding the written content.
pub fn replay_write_stream(env: &TestDedup, ops: &[WriteOp]) -> Result<ReplayStats, TestCaseError> {
    let m = &env.manager;
    // locator -> content currently stored there
    let mut live: HashMap<u64, u8> = HashMap::new();
    let mut live_order: Vec<u64> = Vec::new();
    let mut next_locator = BLOCK;
    let mut offsets = [0u64; 4];
    let mut stats = ReplayStats::default();

    for op in ops {
        match *op {
            WriteOp::Write { file, content } => {
                let offset = offsets[file as usize];
                offsets[file as usize] += BLOCK;
                let h = content_hash(content);
                match m.lookup(&h, owner(u64::from(file), offset)).map_err(fail)? {
                    LookupOutcome::Deduplicated(extent) => {
                        prop_assert_eq!(live.get(&extent.locator).copied(), Some(content));
                        prop_assert_eq!(extent.length, BLOCK);
                        stats.hits += 1;
                    }
                    LookupOutcome::NoMatch => {
                        let locator = next_locator;
                        next_locator += BLOCK;
                        m.add(&h, locator, BLOCK).map_err(fail)?;
                        live.insert(locator, content);
                        live_order.push(locator);
                        stats.allocations += 1;
                    }
                }
                stats.writes += 1;
            }
            WriteOp::Free { nth } => {
                if live_order.is_empty() {
                    continue;
                }
                let locator = live_order.remove(nth as usize % live_order.len());
                live.remove(&locator);
                m.remove(locator).map_err(fail)?;
            }
        }
    }
    Ok(stats)
}
