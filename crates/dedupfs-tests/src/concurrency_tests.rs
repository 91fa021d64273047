//! Concurrency and thread-safety tests for the dedupe manager
//!
//! Many writer threads add, remove and look up blocks at the same time while
//! the mock reference manager creates, locks and retires pending heads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::harness::{hash, owner, TestDedup, BLOCK};

#[derive(Debug, Clone, Default)]
pub struct ConcurrentTestResult {
    pub threads_completed: u32,
    pub ops_succeeded: u64,
    pub ops_failed: u64,
    pub hits: u64,
    /// Times a thread saw more live entries than the configured limit.
    pub capacity_violations: u64,
    pub duration_ms: u64,
}

impl ConcurrentTestResult {
    pub fn is_success(&self) -> bool {
        self.ops_failed == 0 && self.capacity_violations == 0
    }

    pub fn throughput_ops_per_sec(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.ops_succeeded as f64) / (self.duration_ms as f64 / 1000.0)
    }
}

/// Writers registering distinct extents under a small limit, each checking
/// the live entry count after every add.
pub struct ConcurrentAddTest {
    pub num_threads: u32,
    pub ops_per_thread: u32,
    pub limit: u64,
}

impl ConcurrentAddTest {
    pub fn run(&self, env: &TestDedup) -> ConcurrentTestResult {
        let mut result = ConcurrentTestResult::default();
        if env.manager.set_limit(self.limit).is_err() {
            result.ops_failed = 1;
            return result;
        }

        let start = Instant::now();
        let handles: Vec<_> = (0..self.num_threads)
            .map(|t| {
                let m = Arc::clone(&env.manager);
                let ops = self.ops_per_thread;
                let limit = self.limit;
                thread::spawn(move || {
                    let mut failed = 0u64;
                    let mut violations = 0u64;
                    for op in 0..ops {
                        let id = (t as u64) * 1_000_000 + op as u64 + 1;
                        if m.add(&hash(&id.to_string()), id * BLOCK, BLOCK).is_err() {
                            failed += 1;
                        }
                        if m.status().entries as u64 > limit {
                            violations += 1;
                        }
                    }
                    (failed, violations)
                })
            })
            .collect();

        for handle in handles {
            let (failed, violations) = handle
                .join()
                .unwrap_or((u64::from(self.ops_per_thread), 0));
            result.threads_completed += 1;
            result.ops_failed += failed;
            result.capacity_violations += violations;
            result.ops_succeeded += u64::from(self.ops_per_thread) - failed;
        }
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

/// Readers claiming a shared working set while heads come and go.
pub struct ConcurrentLookupTest {
    pub num_threads: u32,
    pub rounds: u32,
    pub working_set: u64,
}

impl ConcurrentLookupTest {
    pub fn run(&self, env: &TestDedup) -> ConcurrentTestResult {
        for i in 1..=self.working_set {
            env.manager
                .add(&hash(&format!("ws-{}", i)), i * BLOCK, BLOCK)
                .expect("populate working set");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let refs = Arc::clone(&env.refs);
            let stop = Arc::clone(&stop);
            let working_set = self.working_set;
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(7);
                while !stop.load(Ordering::Relaxed) {
                    let locator = rng.gen_range(1..=working_set) * BLOCK;
                    refs.add_pending_head(locator);
                    if rng.gen_bool(0.5) {
                        thread::yield_now();
                    }
                    // Running a head needs its lock like any other holder.
                    while !refs.lock_head_externally(locator) {
                        thread::yield_now();
                    }
                    thread::yield_now();
                    refs.retire_head(locator);
                }
            })
        };

        let start = Instant::now();
        let handles: Vec<_> = (0..self.num_threads)
            .map(|t| {
                let m = Arc::clone(&env.manager);
                let rounds = self.rounds;
                let working_set = self.working_set;
                thread::spawn(move || {
                    let mut hits = 0u64;
                    let mut failed = 0u64;
                    for r in 0..rounds {
                        for i in 1..=working_set {
                            match m.lookup(&hash(&format!("ws-{}", i)), owner(t as u64, r as u64)) {
                                Ok(out) if out.is_hit() => hits += 1,
                                Ok(_) => {}
                                Err(_) => failed += 1,
                            }
                        }
                    }
                    (hits, failed)
                })
            })
            .collect();

        let mut result = ConcurrentTestResult::default();
        let total = u64::from(self.rounds) * self.working_set;
        for handle in handles {
            let (hits, failed) = handle.join().unwrap_or((0, total));
            result.threads_completed += 1;
            result.hits += hits;
            result.ops_failed += failed;
            result.ops_succeeded += total - failed;
        }
        stop.store(true, Ordering::Relaxed);
        let _ = churn.join();
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupfs_core::{DedupError, LookupOutcome};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_concurrent_adds_respect_limit() {
        // The runner applies its own limit to the live index.
        let env = TestDedup::with_limit(1024);
        let test = ConcurrentAddTest {
            num_threads: 8,
            ops_per_thread: 200,
            limit: 64,
        };
        let result = test.run(&env);
        assert!(result.is_success());
        assert_eq!(result.capacity_violations, 0);
        assert_eq!(result.threads_completed, 8);
        assert_eq!(env.manager.config().unwrap().limit, 64);
        assert_eq!(env.entries() as u64, test.limit);
        let s = env.manager.status().metrics;
        assert_eq!(s.inserts, 1600);
        assert_eq!(s.evictions, 1600 - 64);
    }

    #[test]
    fn test_concurrent_lookups_count_every_reference_once() {
        let env = TestDedup::with_limit(1024);
        let test = ConcurrentLookupTest {
            num_threads: 6,
            rounds: 50,
            working_set: 32,
        };
        let result = test.run(&env);
        assert!(result.is_success());
        // Nothing is evicted, so every lookup must end in a claimed reference.
        assert_eq!(result.hits, 6 * 50 * 32);
        assert_eq!(env.refs.total_refs(), result.hits);
        assert_eq!(env.manager.status().metrics.hits, result.hits);
        assert_eq!(env.txns.open_transactions(), 0);
    }

    #[test]
    fn test_mixed_churn_keeps_invariants() {
        let env = TestDedup::with_limit(16);
        let handles: Vec<_> = (0..6u64)
            .map(|t| {
                let m = Arc::clone(&env.manager);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..2000 {
                        let id: u64 = rng.gen_range(1..64);
                        let h = hash(&id.to_string());
                        match rng.gen_range(0..3) {
                            0 => {
                                m.add(&h, id * BLOCK, BLOCK).unwrap();
                            }
                            1 => {
                                m.remove(id * BLOCK).unwrap();
                            }
                            _ => {
                                if let LookupOutcome::Deduplicated(e) =
                                    m.lookup(&h, owner(t, 0)).unwrap()
                                {
                                    assert_eq!(e.locator, id * BLOCK);
                                }
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = env.manager.engine().unwrap().entries();
        assert!(entries.len() <= 16);
        let hashes: HashSet<_> = entries.iter().map(|e| e.hash.clone()).collect();
        let locators: HashSet<_> = entries.iter().map(|e| e.extent.locator).collect();
        assert_eq!(hashes.len(), entries.len());
        assert_eq!(locators.len(), entries.len());
        assert_eq!(env.refs.total_refs(), env.manager.status().metrics.hits);
    }

    #[test]
    fn test_index_usable_while_lookup_waits_on_head() {
        let env = TestDedup::with_limit(16);
        env.manager.add(&hash("hot"), 0x8000, BLOCK).unwrap();
        env.refs.add_pending_head(0x8000);
        assert!(env.refs.lock_head_externally(0x8000));

        let m = Arc::clone(&env.manager);
        let waiter = thread::spawn(move || m.lookup(&hash("hot"), owner(9, 0)));
        thread::sleep(Duration::from_millis(50));

        // The waiting lookup must not be holding the index lock.
        let (tx, rx) = mpsc::channel();
        let m = Arc::clone(&env.manager);
        thread::spawn(move || {
            let _ = tx.send(m.add(&hash("other"), 0x9000, BLOCK).is_ok());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));

        env.refs.unlock_head_externally(0x8000);
        let out = waiter.join().unwrap().unwrap();
        assert_eq!(out.extent().map(|e| e.locator), Some(0x8000));
        assert_eq!(env.refs.locked_increments(), 1);
    }

    #[test]
    fn test_entry_evicted_while_waiting_is_no_match() {
        let env = TestDedup::with_limit(16);
        env.manager.add(&hash("cold"), 0x8000, BLOCK).unwrap();
        env.refs.add_pending_head(0x8000);
        assert!(env.refs.lock_head_externally(0x8000));

        let m = Arc::clone(&env.manager);
        let waiter = thread::spawn(move || m.lookup(&hash("cold"), owner(9, 0)));
        thread::sleep(Duration::from_millis(50));

        env.manager.remove(0x8000).unwrap();
        env.refs.unlock_head_externally(0x8000);

        assert_eq!(waiter.join().unwrap().unwrap(), LookupOutcome::NoMatch);
        assert_eq!(env.refs.refs_for(0x8000), 0);
        assert_eq!(env.manager.status().metrics.vanished, 1);
    }

    #[test]
    fn test_head_retired_while_waiting_retries() {
        let env = TestDedup::with_limit(16);
        env.manager.add(&hash("busy"), 0x8000, BLOCK).unwrap();
        env.refs.add_pending_head(0x8000);
        assert!(env.refs.lock_head_externally(0x8000));

        let m = Arc::clone(&env.manager);
        let waiter = thread::spawn(move || m.lookup(&hash("busy"), owner(9, 0)));
        thread::sleep(Duration::from_millis(50));
        env.refs.retire_head(0x8000);

        assert!(waiter.join().unwrap().unwrap().is_hit());
        let s = env.manager.status().metrics;
        assert!(s.retries >= 1);
        assert_eq!(env.refs.atomic_increments(), 1);
    }

    #[test]
    fn test_disable_races_with_writers() {
        let env = TestDedup::with_limit(128);
        let stop = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let m = Arc::clone(&env.manager);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut i = 1u64;
                    while !stop.load(Ordering::Relaxed) {
                        let h = hash(&format!("{}-{}", t, i));
                        match m.add(&h, t * 1_000_000 + i, BLOCK) {
                            Ok(_) | Err(DedupError::Disabled) => {}
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                        m.lookup(&h, owner(t, i)).unwrap();
                        i += 1;
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        env.manager.disable().unwrap();
        thread::sleep(Duration::from_millis(10));
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!env.manager.is_enabled());
        assert_eq!(env.entries(), 0);
        assert_eq!(env.txns.open_transactions(), 0);
    }
}
