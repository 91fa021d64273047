//! Content hashing: digest algorithms keyed by a small integer type code.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DedupError, DedupResult};

/// Digest algorithm used to fingerprint dedupe blocks.
///
/// The discriminant is the on-the-wire type code accepted by
/// [`crate::DedupManager::enable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum DigestType {
    /// SHA-256, 32-byte output.
    Sha256 = 0,
    /// BLAKE3, 32-byte output.
    Blake3 = 1,
}

impl DigestType {
    /// Every supported digest, ordered by type code.
    pub const ALL: [DigestType; 2] = [DigestType::Sha256, DigestType::Blake3];

    /// Resolve a numeric type code.
    pub fn from_code(code: u16) -> DedupResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.code() == code)
            .ok_or_else(|| DedupError::invalid_config(format!("unknown digest type {}", code)))
    }

    /// Numeric type code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Output length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            DigestType::Sha256 => 32,
            DigestType::Blake3 => 32,
        }
    }

    /// Human readable algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            DigestType::Sha256 => "sha256",
            DigestType::Blake3 => "blake3",
        }
    }

    /// Stateless provider implementing this algorithm.
    pub fn provider(self) -> &'static dyn DigestProvider {
        match self {
            DigestType::Sha256 => &Sha256Digest,
            DigestType::Blake3 => &Blake3Digest,
        }
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A content hash of a single dedupe block. Used as the dedupe index key.
///
/// Ordering is lexicographic over the raw bytes; all hashes stored in one
/// index share the same length.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(Box<[u8]>);

impl ContentHash {
    /// Copy raw digest bytes into a new hash.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length hash.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(Box::new(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Pluggable, stateless digest primitive.
pub trait DigestProvider: Send + Sync {
    /// Algorithm implemented by this provider.
    fn digest_type(&self) -> DigestType;

    /// Hash a block of data.
    fn hash(&self, data: &[u8]) -> ContentHash;
}

/// SHA-256 provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl DigestProvider for Sha256Digest {
    fn digest_type(&self) -> DigestType {
        DigestType::Sha256
    }

    fn hash(&self, data: &[u8]) -> ContentHash {
        ContentHash::from_bytes(Sha256::digest(data).as_slice())
    }
}

/// BLAKE3 provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Digest;

impl DigestProvider for Blake3Digest {
    fn digest_type(&self) -> DigestType {
        DigestType::Blake3
    }

    fn hash(&self, data: &[u8]) -> ContentHash {
        ContentHash::from(*blake3::hash(data).as_bytes())
    }
}
