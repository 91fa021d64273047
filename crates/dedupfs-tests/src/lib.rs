//! dedupfs Test & Validation Infrastructure
//!
//! Shared harness for driving a [`dedupfs_core::DedupManager`] against the mock
//! transaction and reference managers, plus end-to-end scenarios and
//! multi-threaded stress tests of the lookup protocol and property tests of
//! the write path.

pub mod concurrency_tests;
pub mod harness;
pub mod proptest_dedup;
pub mod scenario_tests;

pub use concurrency_tests::{ConcurrentAddTest, ConcurrentLookupTest, ConcurrentTestResult};
pub use harness::{init_tracing, TestDedup, TestManager};
pub use proptest_dedup::{arb_write_op, replay_write_stream, ReplayStats, WriteOp};
