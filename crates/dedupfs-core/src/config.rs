//! Dedupe configuration: digest, backend, block size and entry limit.

use serde::{Deserialize, Serialize};

use crate::digest::DigestType;
use crate::error::{DedupError, DedupResult};

/// Smallest accepted dedupe block size (16 KiB).
pub const BLOCKSIZE_MIN: u64 = 16 * 1024;
/// Largest accepted dedupe block size (8 MiB).
pub const BLOCKSIZE_MAX: u64 = 8 * 1024 * 1024;
/// Default dedupe block size (128 KiB).
pub const DEFAULT_BLOCKSIZE: u64 = 128 * 1024;
/// Entry limit applied when an in-memory backend is enabled with limit 0.
pub const DEFAULT_INMEMORY_LIMIT: u64 = 4096;
/// Sector size assumed when the storage layer does not supply one.
pub const DEFAULT_SECTOR_SIZE: u64 = 4096;

/// Where the dedupe index lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum BackendMode {
    /// Volatile index bounded by entry count.
    InMemory = 0,
    /// Index backed by stable storage. Not implemented by this crate.
    Persistent = 1,
}

impl BackendMode {
    /// Resolve a numeric backend code.
    pub fn from_code(code: u16) -> DedupResult<Self> {
        match code {
            0 => Ok(BackendMode::InMemory),
            1 => Ok(BackendMode::Persistent),
            other => Err(DedupError::invalid_config(format!(
                "unknown backend mode {}",
                other
            ))),
        }
    }

    /// Numeric backend code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Entry limit actually applied for a requested `limit`.
    ///
    /// In-memory 0 means [`DEFAULT_INMEMORY_LIMIT`]; persistent is always 0.
    pub fn effective_limit(self, limit: u64) -> u64 {
        match self {
            BackendMode::InMemory if limit == 0 => DEFAULT_INMEMORY_LIMIT,
            BackendMode::InMemory => limit,
            BackendMode::Persistent => 0,
        }
    }

    /// Backend name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            BackendMode::InMemory => "inmemory",
            BackendMode::Persistent => "persistent",
        }
    }
}

/// Configuration of an enabled dedupe index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Digest used to fingerprint blocks.
    pub digest: DigestType,
    /// Index backend.
    pub backend: BackendMode,
    /// Dedupe block size in bytes.
    pub block_size: u64,
    /// Maximum live entries (in-memory) or 0 (persistent, not applicable).
    pub limit: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            digest: DigestType::Sha256,
            backend: BackendMode::InMemory,
            block_size: DEFAULT_BLOCKSIZE,
            limit: DEFAULT_INMEMORY_LIMIT,
        }
    }
}

impl DedupConfig {
    /// Build a config from the numeric enable interface.
    ///
    /// The result still has to pass [`DedupConfig::validate`].
    pub fn from_raw(digest: u16, backend: u16, block_size: u64, limit: u64) -> DedupResult<Self> {
        Ok(Self {
            digest: DigestType::from_code(digest)?,
            backend: BackendMode::from_code(backend)?,
            block_size,
            limit,
        })
    }

    /// Check bounds against the storage sector size and normalize the limit.
    ///
    /// In-memory limit 0 becomes [`DEFAULT_INMEMORY_LIMIT`]; a persistent
    /// backend always gets limit 0.
    pub fn validate(mut self, sector_size: u64) -> DedupResult<Self> {
        if !self.block_size.is_power_of_two() {
            return Err(DedupError::invalid_config(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size < BLOCKSIZE_MIN || self.block_size > BLOCKSIZE_MAX {
            return Err(DedupError::invalid_config(format!(
                "block size {} outside [{}, {}]",
                self.block_size, BLOCKSIZE_MIN, BLOCKSIZE_MAX
            )));
        }
        if self.block_size < sector_size {
            return Err(DedupError::invalid_config(format!(
                "block size {} smaller than sector size {}",
                self.block_size, sector_size
            )));
        }
        self.limit = self.backend.effective_limit(self.limit);
        Ok(self)
    }

    /// True when switching from `self` to `other` needs a fresh index.
    ///
    /// Only the limit can change on a live index.
    pub fn requires_rebuild(&self, other: &DedupConfig) -> bool {
        self.digest != other.digest
            || self.block_size != other.block_size
            || self.backend != other.backend
    }

    /// Hash length for the configured digest.
    pub fn hash_len(&self) -> usize {
        self.digest.output_len()
    }
}
