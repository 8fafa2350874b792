//! A call-recording [`KvEngine`] for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use keybus_types::{DbNumber, QueryAction, SerialNumber, ShardChunkId};
use parking_lot::Mutex;

use crate::{KvEngine, KvError, KvTableHandle};

/// One recorded engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEngineCall {
    /// A `register_table` call.
    RegisterTable {
        /// The database number registered.
        db: DbNumber,
    },
    /// A plain `insert` call.
    Insert {
        /// Target database.
        db: DbNumber,
        /// Target shard chunk.
        chunk: ShardChunkId,
        /// Key material written.
        key: Bytes,
        /// Value written.
        value: Bytes,
    },
    /// A staged `xact_insert` call.
    XactInsert {
        /// Target database.
        db: DbNumber,
        /// Target shard chunk.
        chunk: ShardChunkId,
        /// Key material written.
        key: Bytes,
        /// Value written.
        value: Bytes,
    },
    /// A plain `delete` call.
    Delete {
        /// Target database.
        db: DbNumber,
        /// Target shard chunk.
        chunk: ShardChunkId,
        /// Key removed.
        key: Bytes,
    },
    /// A staged `xact_delete` call.
    XactDelete {
        /// Target database.
        db: DbNumber,
        /// Target shard chunk.
        chunk: ShardChunkId,
        /// Key removed.
        key: Bytes,
    },
    /// A `commit` call finalizing a staged operation.
    Commit {
        /// Target database.
        db: DbNumber,
        /// The staged serial being finalized.
        serial: SerialNumber,
        /// The action being committed.
        action: QueryAction,
    },
}

#[derive(Debug)]
struct Inner {
    calls: Vec<MockEngineCall>,
    register_table_errors: VecDeque<KvError>,
    op_errors: VecDeque<KvError>,
    next_serial: i64,
    next_token: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            register_table_errors: VecDeque::new(),
            op_errors: VecDeque::new(),
            next_serial: 1,
            next_token: 1,
        }
    }
}

/// A mock [`KvEngine`] that records every call, serves monotonically
/// increasing serial numbers, and fails operations on demand.
#[derive(Debug, Default)]
pub struct MockKvEngine(Mutex<Inner>);

impl MockKvEngine {
    /// Return the errors specified in `errors` in sequence for calls to
    /// `register_table`, starting from the front; further calls succeed.
    pub fn with_register_table_errors(self, errors: impl Into<VecDeque<KvError>>) -> Self {
        self.0.lock().register_table_errors = errors.into();
        self
    }

    /// Queue `error` to be returned by the next data operation.
    pub fn queue_op_error(&self, error: KvError) {
        self.0.lock().op_errors.push_back(error);
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<MockEngineCall> {
        self.0.lock().calls.clone()
    }

    /// The calls recorded so far, excluding table registrations.
    pub fn data_calls(&self) -> Vec<MockEngineCall> {
        self.0
            .lock()
            .calls
            .iter()
            .filter(|c| !matches!(c, MockEngineCall::RegisterTable { .. }))
            .cloned()
            .collect()
    }

    fn record_op(
        &self,
        call: MockEngineCall,
        serial: bool,
    ) -> Result<Option<SerialNumber>, KvError> {
        let mut guard = self.0.lock();
        guard.calls.push(call);
        if let Some(e) = guard.op_errors.pop_front() {
            return Err(e);
        }
        if serial {
            let s = SerialNumber::new(guard.next_serial);
            guard.next_serial += 1;
            Ok(Some(s))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl KvEngine for MockKvEngine {
    fn register_table(&self, db: DbNumber) -> Result<KvTableHandle, KvError> {
        let mut guard = self.0.lock();
        guard.calls.push(MockEngineCall::RegisterTable { db });
        if let Some(e) = guard.register_table_errors.pop_front() {
            return Err(e);
        }
        let token = guard.next_token;
        guard.next_token += 1;
        Ok(KvTableHandle::new(db, token))
    }

    async fn insert(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> Result<SerialNumber, KvError> {
        self.record_op(
            MockEngineCall::Insert {
                db: table.db(),
                chunk,
                key,
                value,
            },
            true,
        )
        .map(|s| s.expect("insert serves a serial"))
    }

    async fn xact_insert(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
        value: Bytes,
    ) -> Result<SerialNumber, KvError> {
        self.record_op(
            MockEngineCall::XactInsert {
                db: table.db(),
                chunk,
                key,
                value,
            },
            true,
        )
        .map(|s| s.expect("xact_insert serves a serial"))
    }

    async fn delete(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> Result<(), KvError> {
        self.record_op(
            MockEngineCall::Delete {
                db: table.db(),
                chunk,
                key,
            },
            false,
        )
        .map(|_| ())
    }

    async fn xact_delete(
        &self,
        table: &KvTableHandle,
        chunk: ShardChunkId,
        key: Bytes,
    ) -> Result<SerialNumber, KvError> {
        self.record_op(
            MockEngineCall::XactDelete {
                db: table.db(),
                chunk,
                key,
            },
            true,
        )
        .map(|s| s.expect("xact_delete serves a serial"))
    }

    async fn commit(
        &self,
        table: &KvTableHandle,
        serial: SerialNumber,
        action: QueryAction,
    ) -> Result<(), KvError> {
        self.record_op(
            MockEngineCall::Commit {
                db: table.db(),
                serial,
                action,
            },
            false,
        )
        .map(|_| ())
    }
}
