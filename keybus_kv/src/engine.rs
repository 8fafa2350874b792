use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use keybus_types::{DbNumber, QueryAction, SerialNumber, ShardChunkId};
use thiserror::Error;

/// Errors returned by [`KvEngine`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The engine could not allocate resources for a table.
    #[error("table registration failed for db {db}")]
    TableRegistration {
        /// The database number being registered.
        db: DbNumber,
    },

    /// A data operation failed inside the engine.
    #[error("kv operation failed: {reason}")]
    Op {
        /// Engine-provided failure description.
        reason: String,
    },

    /// A commit referenced a serial number the engine has no staged
    /// operation for.
    #[error("unknown serial number {0}")]
    UnknownSerial(SerialNumber),
}

#[derive(Debug)]
struct HandleInner {
    db: DbNumber,
    token: u64,
}

/// A cheaply cloneable handle to one registered KV table.
///
/// One handle exists per distinct [`DbNumber`] observed by the process (see
/// [`KvTableRegistry`]); clones share identity, observable through
/// [`KvTableHandle::ptr_eq`].
///
/// [`KvTableRegistry`]: crate::KvTableRegistry
#[derive(Debug, Clone)]
pub struct KvTableHandle(Arc<HandleInner>);

impl KvTableHandle {
    /// Construct a handle for `db` carrying an engine-assigned `token`.
    pub fn new(db: DbNumber, token: u64) -> Self {
        Self(Arc::new(HandleInner { db, token }))
    }

    /// The database number this handle is bound to.
    pub fn db(&self) -> DbNumber {
        self.0.db
    }

    /// The engine-assigned table token.
    pub fn token(&self) -> u64 {
        self.0.token
    }

    /// Returns true if `self` and `other` are the same handle instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The external storage engine contract.
///
/// Data operations come in a plain and a transactional (`xact_*`) variant:
/// the plain variants apply immediately, the transactional variants stage
/// the mutation and return a [`SerialNumber`] that a later
/// [`KvEngine::commit`] finalizes.
#[async_trait]
pub trait KvEngine: Debug + Send + Sync {
    /// Allocate engine resources for `db` and return a table handle.
    ///
    /// Table registration is resource allocation, not I/O: it is synchronous
    /// and its failure is treated as unrecoverable by the registry.
    fn register_table(&self, db: DbNumber) -> Result<KvTableHandle, KvError>;

    /// Immediately write `value` under `key` in `chunk`.
    async fn insert(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> Result<SerialNumber, KvError>;

    /// Stage a transactional write of `value` under `key` in `chunk`.
    async fn xact_insert(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> Result<SerialNumber, KvError>;

    /// Immediately remove `key` from `chunk`.
    async fn delete(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> Result<(), KvError>;

    /// Stage a transactional removal of `key` from `chunk`.
    async fn xact_delete(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> Result<SerialNumber, KvError>;

    /// Finalize the staged operation identified by `serial`.
    async fn commit(
        &self,
        table: &KvTableHandle,
        serial: SerialNumber,
        action: QueryAction,
    ) -> Result<(), KvError>;
}
