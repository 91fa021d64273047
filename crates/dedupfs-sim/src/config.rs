use dedupfs_core::{DedupConfig, DEFAULT_SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Shape of the synthetic write stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Blocks written per thread.
    pub blocks: u64,
    /// Writer threads.
    pub threads: u32,
    /// Probability that a write repeats content written earlier.
    pub duplicate_ratio: f64,
    /// Probability that a new extent gets a pending reference head.
    pub pending_head_ratio: f64,
    /// Probability that a write is followed by freeing an older extent.
    pub free_ratio: f64,
    /// RNG seed; thread `t` uses `seed + t`.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            blocks: 1024,
            threads: 4,
            duplicate_ratio: 0.5,
            pending_head_ratio: 0.1,
            free_ratio: 0.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub dedup: DedupConfig,
    pub sector_size: u64,
    pub workload: WorkloadConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            sector_size: DEFAULT_SECTOR_SIZE,
            workload: WorkloadConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: SimConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: SimConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Check the dedupe settings and workload ratios, returning the
    /// normalized dedupe config.
    pub fn validate(&self) -> anyhow::Result<DedupConfig> {
        let dedup = self.dedup.validate(self.sector_size)?;
        let w = &self.workload;
        for (name, ratio) in [
            ("duplicate_ratio", w.duplicate_ratio),
            ("pending_head_ratio", w.pending_head_ratio),
            ("free_ratio", w.free_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                anyhow::bail!("{} must be within [0, 1], got {}", name, ratio);
            }
        }
        if w.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        Ok(dedup)
    }
}
