use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_extra::TypedHeader;
use axum_extra::headers::Range;
use tracing::{info, warn};

use kv_range_cache::{headers_from_map, CacheConfig, CachedRanged, MemoryStore, PartitionedCache};

type Cache = PartitionedCache<MemoryStore>;

// request headers worth replaying when the body is served back
const KEPT_HEADERS: [&str; 4] = ["content-type", "cache-control", "etag", "last-modified"];

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // CACHE_CONFIG='{"partition_size": 4096}' overrides the defaults
    let config = match std::env::var("CACHE_CONFIG") {
        Ok(json) => CacheConfig::from_json(&json).unwrap(),
        Err(_) => CacheConfig::default(),
    };
    let cache = PartitionedCache::in_memory(config).unwrap();

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    info!(addr = %listener.local_addr().unwrap(), "serving cache");
    axum::serve(listener, app(cache)).await.unwrap();
}

fn app(cache: Cache) -> Router {
    Router::new()
        .route("/cache/{key}", get(get_cached).put(put_cached))
        .with_state(cache)
}

async fn put_cached(
    State(cache): State<Cache>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    let lookup = match cache.begin_lookup(&key).await {
        Ok(lookup) => lookup,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let kept = headers_from_map(&headers)
        .into_iter()
        .filter(|(name, _)| KEPT_HEADERS.contains(&name.as_str()))
        .collect();

    match cache.begin_insert(lookup).insert_stream(kept, body.into_data_stream()).await {
        Ok(insert) => {
            info!(%key, bytes = insert.total_body_size(), partitions = insert.partitions_written(), "cached");
            StatusCode::CREATED.into_response()
        }
        Err(e) => {
            warn!(%key, %e, "insert abandoned");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn get_cached(
    State(cache): State<Cache>,
    Path(key): Path<String>,
    range_header: Option<TypedHeader<Range>>,
) -> impl IntoResponse {
    let lookup = match cache.begin_lookup(&key).await {
        Ok(lookup) => lookup,
        Err(e) => {
            // an unreadable entry is a miss to the client
            warn!(%key, %e, "lookup failed");
            return (StatusCode::NOT_FOUND, "not cached").into_response();
        }
    };
    let range = range_header.map(|TypedHeader(range)| range);
    match CachedRanged::new(range, lookup) {
        Some(ranged) => ranged.into_response(),
        None => (StatusCode::NOT_FOUND, "not cached").into_response(),
    }
}
