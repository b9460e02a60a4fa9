use std::io;

use crate::Fingerprint;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by the cache core.
///
/// A cache miss is not an error: [`LookupResolver::is_hit`](crate::LookupResolver::is_hit)
/// reports it. Everything here means the caller should fall through to the
/// origin rather than serve cached bytes.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store failed a get, put or clear.
    #[error("store error: {0}")]
    Store(#[from] io::Error),

    /// The response body being inserted failed before it ended.
    #[error("response body failed: {0}")]
    Body(io::Error),

    #[error("{kind} record field of {len} bytes exceeds its u32 length prefix")]
    Encode { kind: &'static str, len: usize },

    #[error("corrupt {kind} record: {reason}")]
    Decode { kind: &'static str, reason: String },

    /// The header entry promises a partition the body map does not hold.
    #[error("partition {index} of {fingerprint} is missing")]
    MissingPartition { fingerprint: Fingerprint, index: u64 },

    /// The stored partition's length disagrees with the configured partition
    /// size and the recorded body size, as when it was written with a
    /// different partition size.
    #[error("partition {index} of {fingerprint} holds {actual} bytes, expected {expected}")]
    PartitionSizeMismatch {
        fingerprint: Fingerprint,
        index: u64,
        actual: usize,
        expected: usize,
    },

    #[error("no cached response for {0}")]
    NotCached(Fingerprint),

    #[error("range {begin}..{end} is not within a body of {total} bytes")]
    InvalidRange { begin: u64, end: u64, total: u64 },

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("insert for {fingerprint} is already {state}")]
    InsertClosed {
        fingerprint: Fingerprint,
        state: &'static str,
    },

    #[error("response headers must be inserted before the body")]
    HeadersNotSet,

    #[error("invalid cache config: {0}")]
    Config(String),

    #[error("invalid cache config json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn decode(kind: &'static str, reason: impl Into<String>) -> Self {
        CacheError::Decode { kind, reason: reason.into() }
    }

    /// True when a header entry exists but the body it describes cannot be
    /// read back intact. Reads abort rather than return partial bytes.
    pub fn is_consistency_failure(&self) -> bool {
        matches!(
            self,
            CacheError::MissingPartition { .. }
                | CacheError::PartitionSizeMismatch { .. }
                | CacheError::Decode { .. }
        )
    }
}

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(e) => e,
            CacheError::InvalidRange { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            CacheError::NotCached(_) => io::Error::new(io::ErrorKind::NotFound, err),
            err if err.is_consistency_failure() => io::Error::new(io::ErrorKind::InvalidData, err),
            err => io::Error::other(err),
        }
    }
}
