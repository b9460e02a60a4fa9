use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::trace;

/// A key-value map holding encoded cache records.
///
/// The cache uses two of these, one for header entries and one for body
/// partitions. Nothing beyond single-key get and put is assumed: the insert
/// side orders its writes so that a header entry only becomes visible after
/// every partition it describes.
pub trait EntryStore: Send + Sync + 'static {
    /// Name of the map, used in logs.
    fn name(&self) -> &str;

    fn get(&self, key: &[u8]) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    fn put(&self, key: Bytes, value: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Removes every entry. Administrative and test use only.
    fn clear(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// In-process [`EntryStore`]. Clones share the same map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: Arc<str>,
    map: Arc<RwLock<HashMap<Bytes, Bytes>>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        MemoryStore {
            name: name.into(),
            map: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    pub async fn contains_key(&self, key: &[u8]) -> bool {
        self.map.read().await.contains_key(key)
    }

    /// Drops a single entry, as an external eviction would.
    pub async fn remove(&self, key: &[u8]) -> Option<Bytes> {
        self.map.write().await.remove(key)
    }
}

impl EntryStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
        let value = self.map.read().await.get(key).cloned();
        trace!(map = %self.name, key_len = key.len(), hit = value.is_some(), "get");
        Ok(value)
    }

    async fn put(&self, key: Bytes, value: Bytes) -> io::Result<()> {
        trace!(map = %self.name, key_len = key.len(), value_len = value.len(), "put");
        self.map.write().await.insert(key, value);
        Ok(())
    }

    async fn clear(&self) -> io::Result<()> {
        trace!(map = %self.name, "clear");
        self.map.write().await.clear();
        Ok(())
    }
}
