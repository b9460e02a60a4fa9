use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use tracing::{debug, error, warn};

use crate::entry::{BodyPartition, HeaderEntry};
use crate::error::{CacheError, Result};
use crate::{CacheInner, EntryStore, Fingerprint};

/// Returned by [`InsertAssembler::append_body`] for pacing the producer.
///
/// Advisory only: the assembler accepts the next chunk either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// The chunk was buffered without touching the store.
    Buffered,
    /// At least one partition was written to the store for this chunk.
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertState {
    /// No headers yet.
    Empty,
    /// Headers held, body partitions being written.
    Accumulating,
    /// Header entry written; the response is visible to lookups.
    Finalized,
    /// A store write failed. The header entry will never be written.
    Failed,
}

/// Write side of one cache insert.
///
/// Cuts an arbitrarily chunked body into partitions of exactly
/// `partition_size` bytes (the last may be shorter), writes each one as soon
/// as it fills, and writes the header entry last so a lookup never sees a
/// body size whose partitions are not all stored.
///
/// One caller drives an assembler; its methods take `&mut self` and are
/// awaited in sequence.
pub struct InsertAssembler<S> {
    inner: Arc<CacheInner<S>>,
    fingerprint: Fingerprint,
    state: InsertState,
    headers: Vec<(String, String)>,
    buffer: BytesMut,
    available: u64,
    partition_index: u64,
    total_body_size: u64,
}

impl<S: EntryStore> InsertAssembler<S> {
    pub(crate) fn begin(inner: Arc<CacheInner<S>>, fingerprint: Fingerprint) -> Self {
        let available = inner.config.partition_size;
        InsertAssembler {
            buffer: BytesMut::with_capacity(available as usize),
            inner,
            fingerprint,
            state: InsertState::Empty,
            headers: Vec::new(),
            available,
            partition_index: 0,
            total_body_size: 0,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn is_finalized(&self) -> bool {
        self.state == InsertState::Finalized
    }

    /// Partitions written so far.
    pub fn partitions_written(&self) -> u64 {
        self.partition_index
    }

    /// Body bytes written to the store so far, not counting the buffer.
    pub fn total_body_size(&self) -> u64 {
        self.total_body_size
    }

    /// Stores the response headers. With `end_of_body` set the response has
    /// no body and is finalized right away with a body size of zero.
    pub async fn set_headers(&mut self, headers: Vec<(String, String)>, end_of_body: bool) -> Result<()> {
        self.ensure_open()?;
        self.headers = headers;
        self.state = InsertState::Accumulating;
        if end_of_body {
            self.finalize().await?;
        }
        Ok(())
    }

    /// Consumes the next body chunk, writing every partition it completes.
    ///
    /// With `end_of_body` set, whatever remains buffered is written as the
    /// final partition and the header entry follows.
    pub async fn append_body(&mut self, mut chunk: Bytes, end_of_body: bool) -> Result<Accepted> {
        self.ensure_open()?;
        if self.state == InsertState::Empty {
            return Err(CacheError::HeadersNotSet);
        }

        let mut accepted = Accepted::Buffered;
        while chunk.len() as u64 >= self.available {
            let fill = chunk.split_to(self.available as usize);
            self.buffer.extend_from_slice(&fill);
            self.flush_partition().await?;
            accepted = Accepted::Flushed;
        }
        if !chunk.is_empty() {
            self.available -= chunk.len() as u64;
            self.buffer.extend_from_slice(&chunk);
        }

        if end_of_body {
            if !self.buffer.is_empty() {
                self.flush_partition().await?;
                accepted = Accepted::Flushed;
            }
            self.finalize().await?;
        }
        Ok(accepted)
    }

    /// Trailers are never cached; calling this is a misuse of the insert.
    pub fn insert_trailers(&mut self, trailers: &[(String, String)]) -> Result<()> {
        error!(fingerprint = %self.fingerprint, count = trailers.len(), "trailers cannot be cached");
        Err(CacheError::Unsupported("inserting trailers"))
    }

    /// Caches a whole response from a chunk stream.
    ///
    /// The last chunk the stream yields is appended as the end of the body.
    /// If the stream fails the insert is abandoned before its header entry is
    /// written, and the error is returned.
    pub async fn insert_stream<St, E>(mut self, headers: Vec<(String, String)>, body: St) -> Result<Self>
    where
        St: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = body.peekable();
        pin_mut!(body);

        if body.as_mut().peek().await.is_none() {
            self.set_headers(headers, true).await?;
            return Ok(self);
        }
        self.set_headers(headers, false).await?;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(fingerprint = %self.fingerprint, "body stream failed, abandoning insert");
                    self.state = InsertState::Failed;
                    return Err(CacheError::Body(std::io::Error::other(e)));
                }
            };
            let end_of_body = body.as_mut().peek().await.is_none();
            self.append_body(chunk, end_of_body).await?;
        }
        Ok(self)
    }

    fn ensure_open(&self) -> Result<()> {
        let state = match self.state {
            InsertState::Empty | InsertState::Accumulating => return Ok(()),
            InsertState::Finalized => "finalized",
            InsertState::Failed => "failed",
        };
        Err(CacheError::InsertClosed { fingerprint: self.fingerprint, state })
    }

    async fn flush_partition(&mut self) -> Result<()> {
        let bytes = self.buffer.split().freeze();
        let len = bytes.len() as u64;
        let key = self.fingerprint.partition_key(self.partition_index);
        // the buffer is already taken; a dropped put must leave the insert failed
        self.state = InsertState::Failed;
        let value = BodyPartition::new(bytes).encode()?;
        if let Err(e) = self.inner.bodies.put(key, value).await {
            warn!(fingerprint = %self.fingerprint, index = self.partition_index, %e, "partition write failed, abandoning insert");
            return Err(e.into());
        }
        self.state = InsertState::Accumulating;
        debug!(fingerprint = %self.fingerprint, index = self.partition_index, len, "flushed partition");

        self.partition_index += 1;
        self.total_body_size += len;
        self.available = self.inner.config.partition_size;
        self.buffer.reserve(self.available as usize);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        let entry = HeaderEntry::new(std::mem::take(&mut self.headers), self.total_body_size);
        self.state = InsertState::Failed;
        let value = entry.encode()?;
        if let Err(e) = self.inner.headers.put(self.fingerprint.header_key(), value).await {
            warn!(fingerprint = %self.fingerprint, %e, "header write failed");
            return Err(e.into());
        }
        debug!(
            fingerprint = %self.fingerprint,
            total_body_size = self.total_body_size,
            partitions = self.partition_index,
            "finalized cache entry"
        );
        self.state = InsertState::Finalized;
        Ok(())
    }
}

impl<S> std::fmt::Debug for InsertAssembler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertAssembler")
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state)
            .field("partition_index", &self.partition_index)
            .field("total_body_size", &self.total_body_size)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::FutureExt;

    use super::Accepted;
    use crate::entry::{BodyPartition, HeaderEntry};
    use crate::{CacheConfig, CacheError, EntryStore, MemoryStore, PartitionedCache};

    fn cache(partition_size: u64) -> PartitionedCache<MemoryStore> {
        PartitionedCache::in_memory(CacheConfig::with_partition_size(partition_size)).unwrap()
    }

    async fn stored_partitions(cache: &PartitionedCache<MemoryStore>, key: &[u8]) -> Vec<Bytes> {
        let fp = crate::fingerprint(key);
        let mut parts = Vec::new();
        while let Some(raw) = cache.body_store().get(&fp.partition_key(parts.len() as u64)).await.unwrap() {
            parts.push(BodyPartition::decode(raw).unwrap().bytes);
        }
        parts
    }

    async fn stored_header(cache: &PartitionedCache<MemoryStore>, key: &[u8]) -> Option<HeaderEntry> {
        let fp = crate::fingerprint(key);
        let raw = cache.header_store().get(&fp.header_key()).await.unwrap()?;
        Some(HeaderEntry::decode(raw).unwrap())
    }

    fn headers() -> Vec<(String, String)> {
        vec![("cache-control".into(), "public,max-age=3600".into())]
    }

    #[tokio::test]
    async fn test_hello_world_partitions() {
        let cache = cache(3);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"hello").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();

        let accepted = insert.append_body(Bytes::from_static(b"Hello, "), false).await.unwrap();
        assert_eq!(Accepted::Flushed, accepted);
        assert_eq!(2, insert.partitions_written());
        // the header entry only appears once the body is complete
        assert_eq!(None, stored_header(&cache, b"hello").await);

        insert.append_body(Bytes::from_static(b"World!"), true).await.unwrap();
        assert!(insert.is_finalized());

        let parts = stored_partitions(&cache, b"hello").await;
        let parts: Vec<&[u8]> = parts.iter().map(|p| &p[..]).collect();
        assert_eq!(vec![&b"Hel"[..], b"lo,", b" Wo", b"rld", b"!"], parts);

        let header = stored_header(&cache, b"hello").await.unwrap();
        assert_eq!(13, header.total_body_size);
        assert_eq!(headers(), header.headers);
    }

    #[tokio::test]
    async fn test_small_chunk_is_buffered() {
        let cache = cache(8);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        assert_eq!(Accepted::Buffered, insert.append_body(Bytes::from_static(b"abc"), false).await.unwrap());
        assert_eq!(Accepted::Buffered, insert.append_body(Bytes::from_static(b"defg"), false).await.unwrap());
        assert_eq!(0, insert.partitions_written());
        assert!(cache.body_store().is_empty().await);

        // one byte completes the partition
        assert_eq!(Accepted::Flushed, insert.append_body(Bytes::from_static(b"h"), false).await.unwrap());
        assert_eq!(1, insert.partitions_written());
    }

    #[tokio::test]
    async fn test_exact_fill_has_no_empty_partition() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        insert.append_body(Bytes::from_static(b"abcd"), false).await.unwrap();
        insert.append_body(Bytes::from_static(b"efgh"), true).await.unwrap();

        assert_eq!(2, cache.body_store().len().await);
        assert_eq!(8, stored_header(&cache, b"k").await.unwrap().total_body_size);
    }

    #[tokio::test]
    async fn test_empty_final_chunk() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        insert.append_body(Bytes::from_static(b"abcdef"), false).await.unwrap();
        insert.append_body(Bytes::new(), true).await.unwrap();

        let parts = stored_partitions(&cache, b"k").await;
        assert_eq!(vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"ef")], parts);
        assert_eq!(6, stored_header(&cache, b"k").await.unwrap().total_body_size);
    }

    #[tokio::test]
    async fn test_headers_only_response() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), true).await.unwrap();
        assert!(insert.is_finalized());

        assert!(cache.body_store().is_empty().await);
        assert_eq!(0, stored_header(&cache, b"k").await.unwrap().total_body_size);
    }

    #[tokio::test]
    async fn test_body_before_headers() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        assert_matches!(
            insert.append_body(Bytes::from_static(b"abc"), true).await,
            Err(CacheError::HeadersNotSet)
        );
    }

    #[tokio::test]
    async fn test_closed_after_finalize() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        insert.append_body(Bytes::from_static(b"abc"), true).await.unwrap();
        assert_matches!(
            insert.append_body(Bytes::from_static(b"more"), false).await,
            Err(CacheError::InsertClosed { state: "finalized", .. })
        );
        assert_matches!(
            insert.set_headers(headers(), true).await,
            Err(CacheError::InsertClosed { .. })
        );
    }

    #[tokio::test]
    async fn test_trailers_unsupported() {
        let cache = cache(4);
        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        let trailers = vec![("grpc-status".to_string(), "0".to_string())];
        assert_matches!(insert.insert_trailers(&trailers), Err(CacheError::Unsupported(_)));
    }

    /// Body map that fails every put after the first `allowed`.
    #[derive(Clone)]
    struct FailingStore {
        inner: MemoryStore,
        allowed: usize,
        puts: Arc<AtomicUsize>,
    }

    impl EntryStore for FailingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: Bytes, value: Bytes) -> io::Result<()> {
            if self.puts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "store went away"));
            }
            self.inner.put(key, value).await
        }

        async fn clear(&self) -> io::Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_flush_failure_never_finalizes() {
        let headers_map = FailingStore {
            inner: MemoryStore::new("cache::header"),
            allowed: usize::MAX,
            puts: Arc::default(),
        };
        let bodies_map = FailingStore {
            inner: MemoryStore::new("cache::body"),
            allowed: 2,
            puts: Arc::default(),
        };
        let cache = PartitionedCache::new(CacheConfig::with_partition_size(3), headers_map, bodies_map).unwrap();

        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        let err = insert.append_body(Bytes::from_static(b"Hello, World!"), true).await.unwrap_err();
        assert_matches!(err, CacheError::Store(_));

        // two orphaned partitions, no header entry
        assert_eq!(2, cache.body_store().inner.len().await);
        assert!(cache.header_store().inner.is_empty().await);
        assert!(!cache.begin_lookup(b"k").await.unwrap().is_hit());

        assert_matches!(
            insert.append_body(Bytes::from_static(b"!"), true).await,
            Err(CacheError::InsertClosed { state: "failed", .. })
        );
    }

    /// Store whose put number `stall_at` never completes.
    #[derive(Clone)]
    struct StallingStore {
        inner: MemoryStore,
        stall_at: usize,
        puts: Arc<AtomicUsize>,
    }

    impl StallingStore {
        fn new(name: &str, stall_at: usize) -> Self {
            StallingStore { inner: MemoryStore::new(name), stall_at, puts: Arc::default() }
        }
    }

    impl EntryStore for StallingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: Bytes, value: Bytes) -> io::Result<()> {
            if self.puts.fetch_add(1, Ordering::SeqCst) == self.stall_at {
                futures::future::pending::<()>().await;
            }
            self.inner.put(key, value).await
        }

        async fn clear(&self) -> io::Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_dropped_partition_write_abandons_insert() {
        let cache = PartitionedCache::new(
            CacheConfig::with_partition_size(3),
            StallingStore::new("cache::header", usize::MAX),
            StallingStore::new("cache::body", 1),
        )
        .unwrap();

        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        // the write of partition 1 is abandoned mid-flight
        let pending = insert.append_body(Bytes::from_static(b"Hello, "), false).now_or_never();
        assert!(pending.is_none());

        assert_matches!(
            insert.append_body(Bytes::from_static(b"World!"), true).await,
            Err(CacheError::InsertClosed { state: "failed", .. })
        );
        assert!(!insert.is_finalized());
        assert!(cache.header_store().inner.is_empty().await);
        assert!(!cache.begin_lookup(b"k").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_dropped_header_write_abandons_insert() {
        let cache = PartitionedCache::new(
            CacheConfig::with_partition_size(3),
            StallingStore::new("cache::header", 0),
            StallingStore::new("cache::body", usize::MAX),
        )
        .unwrap();

        let mut insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        insert.set_headers(headers(), false).await.unwrap();
        let pending = insert.append_body(Bytes::from_static(b"Hello"), true).now_or_never();
        assert!(pending.is_none());

        assert!(!insert.is_finalized());
        assert_matches!(
            insert.append_body(Bytes::new(), true).await,
            Err(CacheError::InsertClosed { state: "failed", .. })
        );
        assert!(!cache.begin_lookup(b"k").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_insert_stream() {
        let cache = cache(3);
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"Hello")),
            Ok(Bytes::from_static(b", ")),
            Ok(Bytes::from_static(b"World!")),
        ];
        let insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        let insert = insert.insert_stream(headers(), futures::stream::iter(chunks)).await.unwrap();
        assert!(insert.is_finalized());
        assert_eq!(5, insert.partitions_written());
        assert_eq!(13, stored_header(&cache, b"k").await.unwrap().total_body_size);
    }

    #[tokio::test]
    async fn test_insert_empty_stream() {
        let cache = cache(3);
        let insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        let empty = futures::stream::iter(Vec::<Result<Bytes, io::Error>>::new());
        let insert = insert.insert_stream(headers(), empty).await.unwrap();
        assert!(insert.is_finalized());
        assert_eq!(0, stored_header(&cache, b"k").await.unwrap().total_body_size);
    }

    #[tokio::test]
    async fn test_insert_stream_error_abandons() {
        let cache = cache(3);
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"Hello, ")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "origin reset")),
        ];
        let insert = cache.begin_insert(cache.begin_lookup(b"k").await.unwrap());
        let err = insert.insert_stream(headers(), futures::stream::iter(chunks)).await.unwrap_err();
        assert_matches!(err, CacheError::Body(_));
        assert_eq!(None, stored_header(&cache, b"k").await);
    }
}
