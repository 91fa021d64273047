//! End-to-end write-path scenarios against the public dedupe API.

#[cfg(test)]
mod tests {
    use crate::harness::{block, hash, owner, TestDedup, BLOCK};
    use dedupfs_core::{AddOutcome, DedupError, Extent, LookupOutcome, DEFAULT_BLOCKSIZE};

    #[test]
    fn test_scenario_a_lru_eviction() {
        let env = TestDedup::with_limit(2);
        let m = &env.manager;
        m.add(&hash("A"), 0x1000, BLOCK).unwrap();
        m.add(&hash("B"), 0x2000, BLOCK).unwrap();
        assert_eq!(
            m.add(&hash("C"), 0x3000, BLOCK).unwrap(),
            AddOutcome::Inserted { evicted: 1 }
        );

        assert_eq!(env.entries(), 2);
        assert_eq!(m.lookup(&hash("A"), owner(257, 0)).unwrap(), LookupOutcome::NoMatch);
        assert_eq!(
            m.lookup(&hash("C"), owner(257, 0)).unwrap(),
            LookupOutcome::Deduplicated(Extent::new(0x3000, BLOCK))
        );
    }

    #[test]
    fn test_scenario_b_duplicate_hash_keeps_first() {
        let env = TestDedup::with_limit(16);
        let m = &env.manager;
        m.add(&hash("1"), 0x1000, BLOCK).unwrap();
        assert_eq!(
            m.add(&hash("1"), 0x2000, BLOCK).unwrap(),
            AddOutcome::DuplicateHash
        );
        assert_eq!(
            m.lookup(&hash("1"), owner(257, 0)).unwrap(),
            LookupOutcome::Deduplicated(Extent::new(0x1000, BLOCK))
        );
        assert_eq!(env.entries(), 1);
    }

    #[test]
    fn test_scenario_c_duplicate_locator_is_noop() {
        let env = TestDedup::with_limit(16);
        let m = &env.manager;
        m.add(&hash("1"), 0x1000, 4096).unwrap();
        assert_eq!(
            m.add(&hash("2"), 0x1000, 8192).unwrap(),
            AddOutcome::DuplicateLocator
        );

        let entries = m.engine().unwrap().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hash, hash("1"));
        assert_eq!(entries[0].extent, Extent::new(0x1000, 4096));
        assert_eq!(m.lookup(&hash("2"), owner(257, 0)).unwrap(), LookupOutcome::NoMatch);
    }

    #[test]
    fn test_scenario_d_disable_forgets_everything() {
        let env = TestDedup::with_limit(16);
        let m = &env.manager;
        for (i, label) in ["x", "y", "z"].iter().enumerate() {
            m.add(&hash(label), (i as u64 + 1) * 0x1000, BLOCK).unwrap();
        }
        m.disable().unwrap();

        for label in ["x", "y", "z"] {
            assert_eq!(m.lookup(&hash(label), owner(1, 0)).unwrap(), LookupOutcome::NoMatch);
        }
        assert!(matches!(m.add(&hash("w"), 0x9000, BLOCK), Err(DedupError::Disabled)));
        assert!(matches!(m.remove(0x1000), Err(DedupError::Disabled)));

        m.enable(0, 0, DEFAULT_BLOCKSIZE, 16).unwrap();
        assert_eq!(m.lookup(&hash("x"), owner(1, 0)).unwrap(), LookupOutcome::NoMatch);
        m.add(&hash("w"), 0x9000, BLOCK).unwrap();
        assert!(m.lookup(&hash("w"), owner(1, 0)).unwrap().is_hit());
    }

    #[test]
    fn test_write_path_round() {
        // Two files writing the same blocks: the second file's writes all
        // reference the first file's extents.
        let env = TestDedup::with_limit(64);
        let m = &env.manager;
        let size = DEFAULT_BLOCKSIZE as usize;
        let mut next_locator = 0x10_0000u64;

        for i in 0..8u64 {
            let data = block(i, size);
            let h = m.hash_block(&data).unwrap();
            match m.lookup(&h, owner(300, i * DEFAULT_BLOCKSIZE)).unwrap() {
                LookupOutcome::NoMatch => {
                    m.add(&h, next_locator, DEFAULT_BLOCKSIZE).unwrap();
                    next_locator += DEFAULT_BLOCKSIZE;
                }
                LookupOutcome::Deduplicated(_) => panic!("first file must not dedupe"),
            }
        }

        for i in 0..8u64 {
            let h = m.hash_block(&block(i, size)).unwrap();
            let out = m.lookup(&h, owner(301, i * DEFAULT_BLOCKSIZE)).unwrap();
            let extent = out.extent().expect("second file must dedupe");
            assert_eq!(extent.locator, 0x10_0000 + i * DEFAULT_BLOCKSIZE);
            assert_eq!(env.refs.refs_for(extent.locator), 1);
        }

        let status = m.status();
        assert_eq!(status.metrics.hits, 8);
        assert_eq!(status.metrics.misses, 8);
        assert_eq!(env.txns.open_transactions(), 0);
    }

    #[test]
    fn test_status_report_json() {
        let env = TestDedup::with_limit(4);
        env.manager.add(&hash("s"), 0x1000, BLOCK).unwrap();
        env.manager.lookup(&hash("s"), owner(4, 0)).unwrap();

        let json = serde_json::to_value(env.manager.status()).unwrap();
        assert_eq!(json["enabled"], true);
        assert_eq!(json["entries"], 1);
        assert_eq!(json["config"]["limit"], 4);
        assert_eq!(json["config"]["digest"], "sha256");
        assert_eq!(json["metrics"]["hits"], 1);
    }

    #[test]
    fn test_freed_extent_is_forgotten() {
        let env = TestDedup::with_limit(16);
        let m = &env.manager;
        m.add(&hash("f"), 0x4000, BLOCK).unwrap();
        m.remove(0x4000).unwrap();
        m.remove(0x4000).unwrap();
        assert_eq!(m.lookup(&hash("f"), owner(2, 0)).unwrap(), LookupOutcome::NoMatch);
        // The locator can be reused for different content.
        m.add(&hash("g"), 0x4000, BLOCK).unwrap();
        assert_eq!(
            m.lookup(&hash("g"), owner(2, 0)).unwrap(),
            LookupOutcome::Deduplicated(Extent::new(0x4000, BLOCK))
        );
    }

    #[test]
    fn test_live_limit_shrink_then_grow() {
        let env = TestDedup::with_limit(8);
        let m = &env.manager;
        for i in 1..=8u64 {
            m.add(&hash(&i.to_string()), i * 0x1000, BLOCK).unwrap();
        }
        assert_eq!(m.set_limit(2).unwrap(), 6);
        assert_eq!(env.entries(), 2);
        m.set_limit(8).unwrap();
        m.add(&hash("9"), 9 * 0x1000, BLOCK).unwrap();
        assert_eq!(env.entries(), 3);
        assert!(m.lookup(&hash("8"), owner(3, 0)).unwrap().is_hit());
        assert_eq!(m.lookup(&hash("1"), owner(3, 0)).unwrap(), LookupOutcome::NoMatch);
    }
}
