use std::sync::Arc;

use bytes::Bytes;
use keybus_kv::{KvEngine, KvOperationAdapter, KvTableRegistry};
use keybus_sharder::{ShardDirectory, ShardRouter};
use keybus_types::BusState;
use tokio::sync::{mpsc, watch};

use crate::coordinator::TransactionCoordinator;
use crate::handle::MemberHandle;
use crate::reactor::Reactor;
use crate::transport::{BusEvent, Transport};

/// Member instance configuration and initialisation.
///
/// The [`KvTableRegistry`] is injected rather than created here: the default
/// wiring shares one registry between every member in the process, while
/// tests construct isolated ones. The routing `salt` is deployment
/// configuration and is applied to every shard resolution this member
/// performs; the same key material only routes consistently across members
/// supplying the same salt.
#[derive(Debug)]
pub struct MemberBuilder {
    transport: Arc<dyn Transport>,
    bus_events: mpsc::Receiver<BusEvent>,
    engine: Arc<dyn KvEngine>,
    directory: Arc<dyn ShardDirectory>,
    registry: Arc<KvTableRegistry>,
    salt: Bytes,
    request_queue_depth: usize,
}

impl MemberBuilder {
    /// Configure a member over the given transport halves, KV engine, shard
    /// directory and table registry.
    pub fn new(
        transport: Arc<dyn Transport>,
        bus_events: mpsc::Receiver<BusEvent>,
        engine: Arc<dyn KvEngine>,
        directory: Arc<dyn ShardDirectory>,
        registry: Arc<KvTableRegistry>,
        salt: Bytes,
    ) -> Self {
        Self {
            transport,
            bus_events,
            engine,
            directory,
            registry,
            salt,
            request_queue_depth: 128,
        }
    }

    /// Override the depth of the handle request queue.
    pub fn with_request_queue_depth(mut self, depth: usize) -> Self {
        self.request_queue_depth = depth;
        self
    }

    /// Spawn the member reactor and return a handle to it.
    ///
    /// # Panics
    ///
    /// This call spawns a tokio task, and as such must be called from within
    /// a tokio runtime.
    #[must_use = "member reactor stops when all handles drop"]
    pub fn build(self) -> MemberHandle {
        let (request_tx, request_rx) = mpsc::channel(self.request_queue_depth);
        let (completion_tx, completion_rx) = mpsc::channel(self.request_queue_depth);
        let (state_tx, state_rx) = watch::channel(BusState::Init);

        let adapter = Arc::new(KvOperationAdapter::new(self.engine, completion_tx));
        let router = Arc::new(ShardRouter::new(self.directory));
        let coordinator = TransactionCoordinator::new(
            router,
            self.registry,
            Arc::clone(&adapter),
            self.salt,
        );

        let reactor = Reactor::new(self.transport, coordinator, adapter, state_tx);
        tokio::spawn(reactor.run(request_rx, self.bus_events, completion_rx));

        MemberHandle::new(request_tx, state_rx)
    }
}
