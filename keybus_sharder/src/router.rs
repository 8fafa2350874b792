use std::sync::Arc;

use bytes::Bytes;
use keybus_types::{PathKey, ShardDbInfo};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{DirectoryError, ShardDirectory};

/// Errors returned by [`ShardRouter::resolve`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardResolutionError {
    /// The backing directory failed the lookup.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The directory returned an empty assignment list.
    #[error("directory returned no shards for {key}")]
    NoShards {
        /// The key that resolved to nothing.
        key: PathKey,
    },
}

/// The owned cache key: a `(binpath, salt)` pair decoupled from the lifetime
/// of whichever call produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShardKey {
    binpath: Bytes,
    salt: Bytes,
}

/// A caching front-end over a [`ShardDirectory`].
///
/// Resolutions are cached keyed by `(binpath, salt)` for the lifetime of the
/// process - there is no eviction. The cache only ever holds successful
/// resolutions: a directory failure leaves no partial entry behind.
#[derive(Debug)]
pub struct ShardRouter {
    directory: Arc<dyn ShardDirectory>,
    cache: Mutex<hashbrown::HashMap<ShardKey, Vec<ShardDbInfo>>>,
}

impl ShardRouter {
    /// Construct a router over `directory` with an empty cache.
    pub fn new(directory: Arc<dyn ShardDirectory>) -> Self {
        Self {
            directory,
            cache: Mutex::new(hashbrown::HashMap::new()),
        }
    }

    /// Resolve `key` (salted with `salt`) to its shard assignment.
    ///
    /// The directory may return several assignments per key; call sites
    /// consistently use the first entry, and this method returns it. The
    /// full list is retained in the cache.
    ///
    /// Callers must supply the same salt for a given key across retries to
    /// get cache hits.
    pub async fn resolve(
        &self,
        key: &PathKey,
        salt: &[u8],
    ) -> Result<ShardDbInfo, ShardResolutionError> {
        let shard_key = ShardKey {
            binpath: key.encode(),
            salt: Bytes::copy_from_slice(salt),
        };

        if let Some(cached) = self.cache.lock().get(&shard_key) {
            trace!(%key, "shard cache hit");
            return Ok(cached[0]);
        }

        let infos = self
            .directory
            .resolve(&shard_key.binpath, &shard_key.salt)
            .await?;
        let first = *infos.first().ok_or_else(|| ShardResolutionError::NoShards {
            key: key.clone(),
        })?;

        debug!(%key, shard=%first, "resolved shard assignment");
        self.cache.lock().insert(shard_key, infos);
        Ok(first)
    }

    /// The number of distinct `(binpath, salt)` resolutions held.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}
