//! Error types for the dedupfs core.

use thiserror::Error;

/// Result type alias for dedupe operations.
pub type DedupResult<T> = Result<T, DedupError>;

/// All errors that can cross the dedupe component boundary.
///
/// Misses and discarded duplicates are not errors; they are reported through
/// [`crate::LookupOutcome`] and [`crate::AddOutcome`].
#[derive(Debug, Error)]
pub enum DedupError {
    /// The requested configuration was rejected; no state was changed.
    #[error("Invalid dedupe configuration: {reason}")]
    InvalidConfig {
        /// Description of the rejected parameter.
        reason: String,
    },

    /// Memory for a new index entry could not be reserved.
    #[error("Resource exhausted: cannot allocate dedupe entry")]
    ResourceExhausted,

    /// Locator 0 is the reserved "no extent" sentinel.
    #[error("Invalid extent locator: 0 is reserved")]
    InvalidLocator,

    /// A content hash does not match the active digest's output length.
    #[error("Hash length mismatch: expected {expected} bytes, got {actual}")]
    HashLength {
        /// Output length of the configured digest.
        expected: usize,
        /// Length of the hash that was supplied.
        actual: usize,
    },

    /// A block passed for hashing does not have the configured block size.
    #[error("Block length mismatch: expected {expected} bytes, got {actual}")]
    BlockLength {
        /// Configured dedupe block size.
        expected: u64,
        /// Length of the block that was supplied.
        actual: u64,
    },

    /// Dedupe is not enabled.
    #[error("Dedupe is disabled")]
    Disabled,

    /// The active backend does not implement the requested operation.
    #[error("Operation not supported by the {backend} backend")]
    UnsupportedBackend {
        /// Name of the active backend.
        backend: &'static str,
    },

    /// The transaction manager refused to start a transaction.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The reference manager failed to record a reference increment.
    #[error("Reference update failed on extent {locator}: {reason}")]
    RefUpdate {
        /// Extent whose reference count could not be changed.
        locator: u64,
        /// Description from the reference manager.
        reason: String,
    },
}

impl DedupError {
    /// Build an [`DedupError::InvalidConfig`] from any displayable reason.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// True when the error only means dedupe is switched off.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}
