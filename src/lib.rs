//! # kv-range-cache
//!
//! HTTP response cache that keeps headers and bodies in an external
//! key-value store, with bodies cut into fixed-size partitions so a byte
//! range is served by fetching only the partitions it touches.
//!
//! Any map implementing [`EntryStore`] can back the cache; [`MemoryStore`] is
//! the in-process one. A cache is two such maps: header entries keyed by the
//! [`Fingerprint`] of the request key, and body partitions keyed by the
//! fingerprint plus a partition index.
//!
//! Writes go through an [`InsertAssembler`], which buffers incoming chunks
//! into partitions and only writes the header entry once every partition is
//! stored. Reads go through a [`LookupResolver`], which turns a byte range
//! into at most one partition fetch per call.
//!
//! ```
//! use bytes::Bytes;
//! use kv_range_cache::{CacheConfig, PartitionedCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> kv_range_cache::Result<()> {
//! let cache = PartitionedCache::in_memory(CacheConfig::with_partition_size(3))?;
//!
//! let lookup = cache.begin_lookup("GET example.com/hello").await?;
//! assert!(!lookup.is_hit());
//!
//! let mut insert = cache.begin_insert(lookup);
//! insert.set_headers(vec![("content-type".into(), "text/plain".into())], false).await?;
//! insert.append_body(Bytes::from_static(b"Hello, "), false).await?;
//! insert.append_body(Bytes::from_static(b"World!"), true).await?;
//!
//! let lookup = cache.begin_lookup("GET example.com/hello").await?;
//! // one partition per call, continue from where the last read stopped
//! let first = lookup.read_range(4, 9).await?;
//! assert_eq!(&first[..], b"o,");
//! let rest = lookup.read_range(6, 9).await?;
//! assert_eq!(&rest[..], b" Wo");
//! # Ok(())
//! # }
//! ```
//!
//! [`CachedRanged`] answers an axum request from a lookup, honouring an
//! optional `Range` header.

mod config;
mod entry;
mod error;
mod insert;
mod key;
mod lookup;
mod store;
mod stream;

use std::ops::Bound;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, Range};
use tracing::debug;

pub use config::{CacheConfig, DEFAULT_PARTITION_SIZE, MAX_PARTITION_SIZE};
pub use entry::{BodyPartition, HeaderEntry};
pub use error::{CacheError, Result};
pub use insert::{Accepted, InsertAssembler};
pub use key::{fingerprint, Fingerprint};
pub use lookup::LookupResolver;
pub use store::{EntryStore, MemoryStore};
pub use stream::CachedBodyStream;

pub(crate) struct CacheInner<S> {
    pub(crate) config: CacheConfig,
    pub(crate) headers: S,
    pub(crate) bodies: S,
}

/// Static description of the cache, for the proxy layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub name: &'static str,
    pub supports_range_requests: bool,
}

/// Partitioned response cache over two [`EntryStore`] maps.
///
/// Cloning is cheap and every clone shares the same stores.
pub struct PartitionedCache<S> {
    inner: Arc<CacheInner<S>>,
}

impl<S> Clone for PartitionedCache<S> {
    fn clone(&self) -> Self {
        PartitionedCache { inner: self.inner.clone() }
    }
}

impl<S: EntryStore> PartitionedCache<S> {
    /// Validates `config` and builds a cache over the given header and body
    /// maps.
    pub fn new(config: CacheConfig, headers: S, bodies: S) -> Result<Self> {
        config.validate()?;
        debug!(
            partition_size = config.partition_size,
            header_map = headers.name(),
            body_map = bodies.name(),
            "partitioned cache ready"
        );
        Ok(PartitionedCache {
            inner: Arc::new(CacheInner { config, headers, bodies }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn header_store(&self) -> &S {
        &self.inner.headers
    }

    pub fn body_store(&self) -> &S {
        &self.inner.bodies
    }

    /// Looks up `key`, fetching its header entry. A miss is not an error; see
    /// [`LookupResolver::is_hit`].
    pub async fn begin_lookup(&self, key: impl AsRef<[u8]>) -> Result<LookupResolver<S>> {
        self.begin_lookup_fingerprint(fingerprint(key.as_ref())).await
    }

    pub async fn begin_lookup_fingerprint(&self, fingerprint: Fingerprint) -> Result<LookupResolver<S>> {
        LookupResolver::begin(self.inner.clone(), fingerprint).await
    }

    /// Starts caching a response under the key `lookup` was made for.
    pub fn begin_insert(&self, lookup: LookupResolver<S>) -> InsertAssembler<S> {
        InsertAssembler::begin(self.inner.clone(), lookup.fingerprint())
    }

    /// Refreshing the headers of a cached response in place is not supported;
    /// insert the response again instead.
    pub fn update_headers(&self, lookup: LookupResolver<S>, headers: Vec<(String, String)>) -> Result<()> {
        debug!(fingerprint = %lookup.fingerprint(), count = headers.len(), "header update refused");
        Err(CacheError::Unsupported("updating cached headers"))
    }

    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            name: "kv-range-cache",
            supports_range_requests: true,
        }
    }

    /// Empties both maps. Meant for tests and administration.
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.bodies.clear().await?;
        self.inner.headers.clear().await?;
        Ok(())
    }
}

impl PartitionedCache<MemoryStore> {
    /// Cache over two fresh [`MemoryStore`]s named after the configured maps.
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let headers = MemoryStore::new(config.header_map.as_str());
        let bodies = MemoryStore::new(config.body_map.as_str());
        PartitionedCache::new(config, headers, bodies)
    }
}

impl<S> std::fmt::Debug for PartitionedCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedCache")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Collects response headers as the ordered string pairs a [`HeaderEntry`]
/// stores. Values that are not visible ASCII are dropped.
pub fn headers_from_map(map: &HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

// Framing the responder computes itself instead of replaying from the cache.
const FRAMING_HEADERS: [&str; 4] = ["content-length", "content-range", "transfer-encoding", "accept-ranges"];

fn replay_headers(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        if FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            map.append(name, value);
        }
    }
    map
}

/// Represents a single byte range with start and end positions (exclusive end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_exclusive: u64,
}

impl ByteRange {
    /// Create a new byte range with inclusive start and exclusive end.
    pub fn new(start: u64, end_exclusive: u64) -> Self {
        ByteRange { start, end_exclusive }
    }

    pub fn len(&self) -> u64 {
        self.end_exclusive - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end_exclusive
    }
}

/// Satisfiable ranges of `range` against a body of `total` bytes, with
/// inclusive HTTP ends turned exclusive and clamped to the body.
fn satisfiable_ranges(range: &Range, total: u64) -> Vec<ByteRange> {
    range
        .satisfiable_ranges(total)
        .filter_map(|(start_bound, end_bound)| {
            let start = match start_bound {
                Bound::Included(start) => start,
                Bound::Excluded(start) => start.saturating_add(1),
                Bound::Unbounded => 0,
            };
            let end = match end_bound {
                // HTTP byte ranges are inclusive
                Bound::Included(end) => end.saturating_add(1),
                Bound::Excluded(end) => end,
                Bound::Unbounded => total,
            };
            let range = ByteRange::new(start, end.min(total));
            (!range.is_empty()).then_some(range)
        })
        .collect()
}

/// The responder for cached responses. Implements [`IntoResponse`].
pub struct CachedRanged<S: EntryStore> {
    range: Option<Range>,
    lookup: LookupResolver<S>,
    total_bytes: u64,
}

impl<S: EntryStore> CachedRanged<S> {
    /// Responds from `lookup` with an optional [`Range`] header. Returns
    /// `None` on a miss, so the caller can go to the origin instead.
    pub fn new(range: Option<Range>, lookup: LookupResolver<S>) -> Option<Self> {
        let total_bytes = lookup.total_body_size()?;
        Some(CachedRanged { range, lookup, total_bytes })
    }

    /// Computes status, headers and body as [`CachedResponse`]. Returns
    /// [`RangeNotSatisfiable`] if no requested range overlaps the body.
    ///
    /// A request for several ranges is answered with the full body.
    pub fn try_respond(self) -> Result<CachedResponse<S>, RangeNotSatisfiable> {
        let total_bytes = self.total_bytes;
        let headers = replay_headers(self.lookup.headers().unwrap_or_default());

        let selected = match &self.range {
            None => None,
            Some(range) => {
                let mut ranges = satisfiable_ranges(range, total_bytes);
                match ranges.len() {
                    0 => {
                        debug!(fingerprint = %self.lookup.fingerprint(), total_bytes, "no satisfiable range");
                        return Err(RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total_bytes)));
                    }
                    1 => ranges.pop(),
                    n => {
                        debug!(fingerprint = %self.lookup.fingerprint(), ranges = n, "multiple ranges, serving full body");
                        None
                    }
                }
            }
        };

        match selected {
            None => Ok(CachedResponse::Full {
                content_length: ContentLength(total_bytes),
                headers,
                stream: self.lookup.stream_within(total_bytes, 0, total_bytes),
            }),
            Some(range) => {
                let content_range = ContentRange::bytes(range.start..range.end_exclusive, total_bytes)
                    .expect("ContentRange::bytes cannot panic in this usage");
                Ok(CachedResponse::Single {
                    content_range,
                    content_length: ContentLength(range.len()),
                    headers,
                    stream: self.lookup.stream_within(total_bytes, range.start, range.end_exclusive),
                })
            }
        }
    }
}

impl<S: EntryStore> IntoResponse for CachedRanged<S> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct RangeNotSatisfiable(pub ContentRange);

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Computed headers and body for a cached response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum CachedResponse<S> {
    /// The whole body, status 200.
    Full {
        content_length: ContentLength,
        headers: HeaderMap,
        stream: CachedBodyStream<S>,
    },
    /// One byte range, status 206.
    Single {
        content_range: ContentRange,
        content_length: ContentLength,
        headers: HeaderMap,
        stream: CachedBodyStream<S>,
    },
}

impl<S: EntryStore> IntoResponse for CachedResponse<S> {
    fn into_response(self) -> Response {
        let accept_ranges = TypedHeader(AcceptRanges::bytes());
        match self {
            CachedResponse::Full { content_length, headers, stream } => (
                StatusCode::OK,
                headers,
                accept_ranges,
                TypedHeader(content_length),
                stream,
            )
                .into_response(),
            CachedResponse::Single { content_range, content_length, headers, stream } => (
                StatusCode::PARTIAL_CONTENT,
                headers,
                accept_ranges,
                TypedHeader(content_range),
                TypedHeader(content_length),
                stream,
            )
                .into_response(),
        }
    }
}
