use std::fmt::Debug;

use async_trait::async_trait;
use keybus_types::ShardDbInfo;
use thiserror::Error;

/// Errors returned by a [`ShardDirectory`] resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The directory service could not be reached.
    #[error("shard directory unreachable: {0}")]
    Unreachable(String),

    /// The directory holds no mapping for the requested key.
    #[error("no shard mapping for key {key:?}")]
    NotFound {
        /// Hex rendering of the unmapped binpath.
        key: String,
    },
}

/// The external shard-directory service contract.
///
/// Given a canonical binpath and the deployment routing salt, a directory
/// returns the ordered list of shard/database assignments for that key.
/// Implementations may be remote services or in-process routing tables.
#[async_trait]
pub trait ShardDirectory: Debug + Send + Sync {
    /// Resolve `binpath` (salted with `salt`) to its shard assignments.
    ///
    /// Callers must supply the same salt for a given key across retries to
    /// observe a stable mapping.
    async fn resolve(&self, binpath: &[u8], salt: &[u8])
        -> Result<Vec<ShardDbInfo>, DirectoryError>;
}
