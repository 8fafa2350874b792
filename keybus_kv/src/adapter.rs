use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use keybus_types::{DataObjectId, QueryAction, ReplyStatus, SerialNumber, ShardChunkId};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{KvEngine, KvError, KvTableHandle};

/// The kind of KV operation a completion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A plain, immediate write.
    Insert,
    /// A staged transactional write.
    XactInsert,
    /// A plain, immediate removal.
    Delete,
    /// A staged transactional removal.
    XactDelete,
    /// Finalization of a staged operation.
    Commit,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::XactInsert => f.write_str("xact-insert"),
            Self::Delete => f.write_str("delete"),
            Self::XactDelete => f.write_str("xact-delete"),
            Self::Commit => f.write_str("commit"),
        }
    }
}

/// The uniform completion message for every asynchronous KV operation,
/// delivered to the issuing member's reactor loop.
///
/// `token` is the typed stand-in for opaque per-operation user data: it
/// identifies the data object that issued the operation without any
/// unchecked casts at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCompletion {
    /// The data object that issued the operation.
    pub token: DataObjectId,
    /// Which operation completed.
    pub op: OpKind,
    /// Whether the engine applied it.
    pub status: ReplyStatus,
    /// The engine serial number, for operations that stage one.
    pub serial: Option<SerialNumber>,
}

/// Lock-free counters observing adapter traffic.
#[derive(Debug, Default)]
pub struct AdapterCounters {
    issued: AtomicU64,
    gated: AtomicU64,
    completed_ok: AtomicU64,
    completed_err: AtomicU64,
}

impl AdapterCounters {
    /// Operations handed to the engine.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Operations dropped because the engine was down.
    pub fn gated(&self) -> u64 {
        self.gated.load(Ordering::Relaxed)
    }

    /// Completions that reported success.
    pub fn completed_ok(&self) -> u64 {
        self.completed_ok.load(Ordering::Relaxed)
    }

    /// Completions that reported failure.
    pub fn completed_err(&self) -> u64 {
        self.completed_err.load(Ordering::Relaxed)
    }
}

/// Wraps a [`KvEngine`]'s asynchronous operations behind uniform
/// [`KvCompletion`] messages.
///
/// Every operation is non-blocking: the engine future runs on a spawned
/// task, and its outcome is delivered through the completion channel
/// supplied at construction - which routes back to the issuing member's
/// single-threaded reactor loop.
///
/// Every call site first consults the `engine_up` gate: while the engine is
/// reported down, operations are silently dropped - no engine call is made
/// and no completion is delivered. This is availability-driven degradation,
/// not an error. Each operation returns whether it was actually handed to
/// the engine, so issuers can keep their in-flight bookkeeping truthful
/// across gated drops.
#[derive(Debug)]
pub struct KvOperationAdapter {
    engine: Arc<dyn KvEngine>,
    engine_up: AtomicBool,
    completions: mpsc::Sender<KvCompletion>,
    counters: Arc<AdapterCounters>,
}

impl KvOperationAdapter {
    /// Construct an adapter over `engine`, delivering completions to
    /// `completions`. The engine starts in the "up" state.
    pub fn new(engine: Arc<dyn KvEngine>, completions: mpsc::Sender<KvCompletion>) -> Self {
        Self {
            engine,
            engine_up: AtomicBool::new(true),
            completions,
            counters: Arc::new(AdapterCounters::default()),
        }
    }

    /// Flip the engine availability gate.
    pub fn set_engine_up(&self, up: bool) {
        debug!(up, "kv engine availability changed");
        self.engine_up.store(up, Ordering::SeqCst);
    }

    /// Whether the engine is currently reported up.
    pub fn engine_up(&self) -> bool {
        self.engine_up.load(Ordering::SeqCst)
    }

    /// The adapter traffic counters.
    pub fn counters(&self) -> &AdapterCounters {
        &self.counters
    }

    /// Immediately write `value` under `key`.
    ///
    /// Returns whether the operation was issued; `false` means the gate
    /// dropped it and no completion will arrive.
    pub fn insert(
        &self,
        token: DataObjectId,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> bool {
        if !self.gate_open(token, OpKind::Insert) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let table = table.clone();
        self.spawn(token, OpKind::Insert, async move {
            engine.insert(&table, chunk, key, value).await.map(Some)
        });
        true
    }

    /// Stage a transactional write of `value` under `key`.
    ///
    /// Returns whether the operation was issued; `false` means the gate
    /// dropped it and no completion will arrive.
    pub fn xact_insert(
        &self,
        token: DataObjectId,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> bool {
        if !self.gate_open(token, OpKind::XactInsert) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let table = table.clone();
        self.spawn(token, OpKind::XactInsert, async move {
            engine.xact_insert(&table, chunk, key, value).await.map(Some)
        });
        true
    }

    /// Immediately remove `key`.
    ///
    /// Returns whether the operation was issued; `false` means the gate
    /// dropped it and no completion will arrive.
    pub fn delete(
        &self,
        token: DataObjectId,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> bool {
        if !self.gate_open(token, OpKind::Delete) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let table = table.clone();
        self.spawn(token, OpKind::Delete, async move {
            engine.delete(&table, chunk, key).await.map(|()| None)
        });
        true
    }

    /// Stage a transactional removal of `key`.
    ///
    /// Returns whether the operation was issued; `false` means the gate
    /// dropped it and no completion will arrive.
    pub fn xact_delete(
        &self,
        token: DataObjectId,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> bool {
        if !self.gate_open(token, OpKind::XactDelete) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let table = table.clone();
        self.spawn(token, OpKind::XactDelete, async move {
            engine.xact_delete(&table, chunk, key).await.map(Some)
        });
        true
    }

    /// Finalize the staged operation identified by `serial`.
    ///
    /// Returns whether the operation was issued; `false` means the gate
    /// dropped it and no completion will arrive.
    pub fn commit(
        &self,
        token: DataObjectId,
        table: &KvTableHandle,
        serial: SerialNumber,
        action: QueryAction,
    ) -> bool {
        if !self.gate_open(token, OpKind::Commit) {
            return false;
        }
        let engine = Arc::clone(&self.engine);
        let table = table.clone();
        self.spawn(token, OpKind::Commit, async move {
            engine.commit(&table, serial, action).await.map(|()| None)
        });
        true
    }

    fn gate_open(&self, token: DataObjectId, op: OpKind) -> bool {
        if self.engine_up.load(Ordering::SeqCst) {
            return true;
        }
        self.counters.gated.fetch_add(1, Ordering::Relaxed);
        trace!(%token, %op, "kv engine down; dropping operation");
        false
    }

    fn spawn<F>(&self, token: DataObjectId, op: OpKind, fut: F)
    where
        F: Future<Output = Result<Option<SerialNumber>, KvError>> + Send + 'static,
    {
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        let tx = self.completions.clone();
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            let completion = match fut.await {
                Ok(serial) => {
                    counters.completed_ok.fetch_add(1, Ordering::Relaxed);
                    KvCompletion {
                        token,
                        op,
                        status: ReplyStatus::Success,
                        serial,
                    }
                }
                Err(error) => {
                    warn!(%error, %token, %op, "kv operation failed");
                    counters.completed_err.fetch_add(1, Ordering::Relaxed);
                    KvCompletion {
                        token,
                        op,
                        status: ReplyStatus::Failure,
                        serial: None,
                    }
                }
            };

            if tx.send(completion).await.is_err() {
                debug!(%token, %op, "completion receiver dropped");
            }
        });
    }
}
