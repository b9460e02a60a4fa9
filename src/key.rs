use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Stable 64-bit hash of a cache lookup key.
///
/// Header entries are stored under the fingerprint alone, body partitions
/// under the fingerprint plus their partition index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

/// Derives the [`Fingerprint`] of a cache key.
///
/// The first eight bytes of the BLAKE3 digest, read little-endian. Not meant
/// to resist deliberate collisions, only to be stable across processes.
pub fn fingerprint(cache_key: &[u8]) -> Fingerprint {
    let digest = blake3::hash(cache_key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    Fingerprint(u64::from_le_bytes(head))
}

impl Fingerprint {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Key of the header entry in the header map.
    pub fn header_key(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    /// Key of partition `index` in the body map: the fixed-width fingerprint
    /// followed by the decimal index, so no two (fingerprint, index) pairs
    /// share a key.
    pub fn partition_key(self, index: u64) -> Bytes {
        let index = index.to_string();
        let mut key = BytesMut::with_capacity(8 + index.len());
        key.put_u64(self.0);
        key.put_slice(index.as_bytes());
        key.freeze()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Fingerprint(value)
    }
}
