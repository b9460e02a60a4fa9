use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::entry::{BodyPartition, HeaderEntry};
use crate::error::{CacheError, Result};
use crate::stream::CachedBodyStream;
use crate::{CacheInner, EntryStore, Fingerprint};

/// Read side of one cache lookup.
///
/// Created by [`PartitionedCache::begin_lookup`](crate::PartitionedCache::begin_lookup),
/// which has already fetched the header entry. On a hit the resolver serves
/// byte ranges of the body one partition at a time; on a miss it can still be
/// handed to [`PartitionedCache::begin_insert`](crate::PartitionedCache::begin_insert)
/// to cache the origin's response under the same key.
pub struct LookupResolver<S> {
    inner: Arc<CacheInner<S>>,
    fingerprint: Fingerprint,
    entry: Option<HeaderEntry>,
}

impl<S: EntryStore> LookupResolver<S> {
    pub(crate) async fn begin(inner: Arc<CacheInner<S>>, fingerprint: Fingerprint) -> Result<Self> {
        let entry = match inner.headers.get(&fingerprint.header_key()).await? {
            Some(raw) => Some(HeaderEntry::decode(raw)?),
            None => None,
        };
        match &entry {
            Some(entry) => debug!(%fingerprint, total_body_size = entry.total_body_size, "cache hit"),
            None => debug!(%fingerprint, "cache miss"),
        }
        Ok(LookupResolver { inner, fingerprint, entry })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn is_hit(&self) -> bool {
        self.entry.is_some()
    }

    /// Cached response headers, `None` on a miss.
    pub fn headers(&self) -> Option<&[(String, String)]> {
        self.entry.as_ref().map(|e| e.headers.as_slice())
    }

    pub fn header_entry(&self) -> Option<&HeaderEntry> {
        self.entry.as_ref()
    }

    /// Body length recorded when the response was cached, `None` on a miss.
    pub fn total_body_size(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.total_body_size)
    }

    /// Reads the body starting at `begin`, up to `end` (exclusive).
    ///
    /// At most one partition is fetched per call. When `begin..end` crosses
    /// into the next partition only the rest of the current partition is
    /// returned, and the caller continues from `begin + returned.len()`.
    pub async fn read_range(&self, begin: u64, end: u64) -> Result<Bytes> {
        let total = self.total_body_size().ok_or(CacheError::NotCached(self.fingerprint))?;
        read_range(&self.inner, self.fingerprint, total, begin, end).await
    }

    /// Streams `begin..end` of the body by issuing [`read_range`](Self::read_range)
    /// calls until the range is exhausted.
    pub fn body_stream(&self, begin: u64, end: u64) -> Result<CachedBodyStream<S>> {
        let total = self.total_body_size().ok_or(CacheError::NotCached(self.fingerprint))?;
        check_range(begin, end, total)?;
        Ok(self.stream_within(total, begin, end))
    }

    // caller has checked begin..end against total
    pub(crate) fn stream_within(&self, total: u64, begin: u64, end: u64) -> CachedBodyStream<S> {
        CachedBodyStream::new(self.inner.clone(), self.fingerprint, total, begin, end)
    }

    /// Trailers are never cached.
    pub fn trailers(&self) -> Option<Vec<(String, String)>> {
        None
    }
}

impl<S> std::fmt::Debug for LookupResolver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupResolver")
            .field("fingerprint", &self.fingerprint)
            .field("entry", &self.entry)
            .finish()
    }
}

fn check_range(begin: u64, end: u64, total: u64) -> Result<()> {
    if begin > end || end > total {
        return Err(CacheError::InvalidRange { begin, end, total });
    }
    Ok(())
}

pub(crate) async fn read_range<S: EntryStore>(
    inner: &CacheInner<S>,
    fingerprint: Fingerprint,
    total: u64,
    begin: u64,
    end: u64,
) -> Result<Bytes> {
    check_range(begin, end, total)?;
    if begin == end {
        return Ok(Bytes::new());
    }

    let partition_size = inner.config.partition_size;
    let index = begin / partition_size;
    let offset = (begin % partition_size) as usize;
    let partition_start = index * partition_size;

    let raw = inner
        .bodies
        .get(&fingerprint.partition_key(index))
        .await?
        .ok_or(CacheError::MissingPartition { fingerprint, index })
        .inspect_err(|_| warn!(%fingerprint, index, "header entry points at a missing partition"))?;
    let partition = BodyPartition::decode(raw)
        .inspect_err(|err| warn!(%fingerprint, index, %err, "undecodable partition"))?;

    // every partition but the last is full
    let expected = partition_size.min(total - partition_start) as usize;
    if partition.len() != expected {
        warn!(%fingerprint, index, len = partition.len(), expected, "partition length disagrees with header entry");
        return Err(CacheError::PartitionSizeMismatch {
            fingerprint,
            index,
            actual: partition.len(),
            expected,
        });
    }

    // inclusive: an end exactly on the next boundary still lies in this partition
    let slice_end = if end <= partition_start + partition_size {
        (end - partition_start) as usize
    } else {
        partition_size as usize
    };

    Ok(partition.bytes.slice(offset..slice_end))
}
