use std::collections::BTreeMap;
use std::sync::Arc;

use keybus_types::DbNumber;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{KvEngine, KvTableHandle};

/// The process-wide cache of registered KV tables.
///
/// One registry is shared (as an injected `Arc`) by every member instance in
/// the process, regardless of which reactor loop it runs on; all lookups and
/// creations serialize on a single lock. Handles are created lazily, exactly
/// once per distinct [`DbNumber`], and are never removed - they live as long
/// as the registry itself.
#[derive(Debug)]
pub struct KvTableRegistry {
    engine: Arc<dyn KvEngine>,
    // Ordering is not semantically required, only uniqueness per db number.
    tables: Mutex<BTreeMap<DbNumber, KvTableHandle>>,
}

impl KvTableRegistry {
    /// Construct an empty registry backed by `engine`.
    pub fn new(engine: Arc<dyn KvEngine>) -> Self {
        Self {
            engine,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the table handle for `db`, registering the table with the
    /// engine on first use.
    ///
    /// Repeated calls for the same `db` return the identical handle
    /// instance, and the engine sees exactly one registration per distinct
    /// `db` across the registry's lifetime.
    ///
    /// # Panics
    ///
    /// Panics if the engine fails to register the table. A table that cannot
    /// be allocated leaves every write against its database number
    /// unservable; this is an unrecoverable process error, not a recoverable
    /// data-path failure.
    pub fn get_or_create(&self, db: DbNumber) -> KvTableHandle {
        let mut tables = self.tables.lock();
        if let Some(handle) = tables.get(&db) {
            trace!(%db, "kv table cache hit");
            return handle.clone();
        }

        // The lock is held across the engine call so a racing lookup for the
        // same db cannot register the table twice.
        let handle = self
            .engine
            .register_table(db)
            .unwrap_or_else(|e| panic!("failed to register kv table for db {db}: {e}"));
        debug!(%db, token = handle.token(), "registered kv table");
        tables.insert(db, handle.clone());
        handle
    }

    /// The number of distinct tables registered so far.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEngineCall, MockKvEngine};
    use crate::KvError;

    #[test]
    fn get_or_create_is_idempotent() {
        let engine = Arc::new(MockKvEngine::default());
        let registry = KvTableRegistry::new(Arc::clone(&engine) as _);

        let a = registry.get_or_create(DbNumber::new(4));
        let b = registry.get_or_create(DbNumber::new(4));
        let c = registry.get_or_create(DbNumber::new(9));

        // Identical handle instance back for the same db, a distinct one for
        // a different db.
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));

        // Exactly one engine registration per distinct db.
        assert_eq!(
            engine.calls(),
            vec![
                MockEngineCall::RegisterTable {
                    db: DbNumber::new(4)
                },
                MockEngineCall::RegisterTable {
                    db: DbNumber::new(9)
                },
            ]
        );
        assert_eq!(registry.table_count(), 2);
    }

    #[test]
    fn tables_are_never_removed() {
        let engine = Arc::new(MockKvEngine::default());
        let registry = KvTableRegistry::new(Arc::clone(&engine) as _);

        for i in 0..50 {
            registry.get_or_create(DbNumber::new(i));
        }
        assert_eq!(registry.table_count(), 50);
    }

    #[test]
    #[should_panic = "failed to register kv table for db 3"]
    fn engine_registration_failure_is_fatal() {
        let engine = Arc::new(MockKvEngine::default().with_register_table_errors([
            KvError::TableRegistration {
                db: DbNumber::new(3),
            },
        ]));
        let registry = KvTableRegistry::new(engine as _);

        registry.get_or_create(DbNumber::new(3));
    }
}
