use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub const DEFAULT_PARTITION_SIZE: u64 = 1024;

/// Largest partition the record codec can frame with its `u32` length prefix.
pub const MAX_PARTITION_SIZE: u64 = u32::MAX as u64;

/// Settings fixed for the lifetime of one cache.
///
/// `partition_size` must be the same value that wrote a key's partitions when
/// they are read back; reading with another size is a consistency failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of body bytes per stored partition.
    pub partition_size: u64,
    /// Name of the map holding header entries.
    pub header_map: String,
    /// Name of the map holding body partitions.
    pub body_map: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            partition_size: DEFAULT_PARTITION_SIZE,
            header_map: "cache::header".to_string(),
            body_map: "cache::body".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn with_partition_size(partition_size: u64) -> Self {
        CacheConfig { partition_size, ..Default::default() }
    }

    /// Parses and validates a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_size == 0 {
            return Err(CacheError::Config("partition_size must be greater than zero".into()));
        }
        if self.partition_size > MAX_PARTITION_SIZE {
            return Err(CacheError::Config(format!(
                "partition_size {} exceeds the maximum of {MAX_PARTITION_SIZE}",
                self.partition_size
            )));
        }
        if usize::try_from(self.partition_size).is_err() {
            return Err(CacheError::Config(format!(
                "partition_size {} does not fit in memory",
                self.partition_size
            )));
        }
        if self.header_map.is_empty() || self.body_map.is_empty() {
            return Err(CacheError::Config("map names must not be empty".into()));
        }
        if self.header_map == self.body_map {
            return Err(CacheError::Config(format!(
                "header and body maps must differ, both are {:?}",
                self.header_map
            )));
        }
        Ok(())
    }
}
