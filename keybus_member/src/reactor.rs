use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use keybus_kv::{KvCompletion, KvOperationAdapter};
use keybus_types::{
    BusState, PathCategory, PathKey, QueryAction, RegistrationFlags, RegistrationId, ReplyCode,
    ReplyDisposition, TransactionId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::{CompletedXact, TransactionCoordinator};
use crate::handle::{ApiError, RegisterError};
use crate::registration::{
    ApplyCursor, CommittedObject, GroupId, MemberRegistration, PrepareContext,
    RegistrationDelegate, RegistrationState,
};
use crate::transport::{Advertisement, BusEvent, Transport};

/// Requests sent from [`MemberHandle`]s to the reactor task.
///
/// [`MemberHandle`]: crate::MemberHandle
#[derive(Debug)]
pub(crate) enum Request {
    Register {
        key: PathKey,
        flags: RegistrationFlags,
        delegate: Arc<dyn RegistrationDelegate>,
        reply: oneshot::Sender<Result<RegistrationId, RegisterError>>,
    },
    RegisterGroup {
        entries: Vec<(PathKey, RegistrationFlags)>,
        delegate: Arc<dyn RegistrationDelegate>,
        reply: oneshot::Sender<Result<Vec<RegistrationId>, RegisterError>>,
    },
    Deregister {
        id: RegistrationId,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    DirectUpdate {
        id: RegistrationId,
        key: PathKey,
        payload: Option<Bytes>,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    AckRunning,
    SetEngineUp(bool),
}

/// The event loop actor owning all state of one member instance.
///
/// Everything for the instance - registration bookkeeping, the transaction
/// coordinator, delegate callbacks, KV completion handling and bus state
/// transitions - executes on this single task, so none of it ever runs
/// concurrently with the rest.
#[derive(Debug)]
pub(crate) struct Reactor {
    transport: Arc<dyn Transport>,
    coordinator: TransactionCoordinator,
    adapter: Arc<KvOperationAdapter>,

    /// Registrations in insertion order (IDs are minted monotonically).
    registrations: BTreeMap<RegistrationId, MemberRegistration>,
    next_registration: u64,
    next_group: u64,

    state: BusState,
    state_tx: watch::Sender<BusState>,
    /// Whether the application has acknowledged readiness to enter `Run`.
    run_acked: bool,
}

impl Reactor {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        coordinator: TransactionCoordinator,
        adapter: Arc<KvOperationAdapter>,
        state_tx: watch::Sender<BusState>,
    ) -> Self {
        Self {
            transport,
            coordinator,
            adapter,
            registrations: BTreeMap::new(),
            next_registration: 1,
            next_group: 1,
            state: BusState::Init,
            state_tx,
            run_acked: false,
        }
    }

    /// Execute the reactor event loop.
    ///
    /// Returns when every handle has been dropped or the bus event stream
    /// closes.
    pub(crate) async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut bus_events: mpsc::Receiver<BusEvent>,
        mut completions: mpsc::Receiver<KvCompletion>,
    ) {
        info!("member reactor started");

        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    None => {
                        info!("member handles dropped; stopping reactor");
                        return;
                    }
                    Some(req) => self.handle_request(req).await,
                },
                event = bus_events.recv() => match event {
                    None => {
                        warn!("bus event stream closed; stopping reactor");
                        return;
                    }
                    Some(event) => self.handle_bus_event(event).await,
                },
                completion = completions.recv() => {
                    // The adapter holds a sender for the reactor's lifetime,
                    // so this channel cannot close while the loop runs.
                    if let Some(completion) = completion {
                        self.handle_completion(completion).await;
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Register {
                key,
                flags,
                delegate,
                reply,
            } => {
                let _ = reply.send(self.register(key, flags, delegate, None).await);
            }
            Request::RegisterGroup {
                entries,
                delegate,
                reply,
            } => {
                let _ = reply.send(self.register_group(entries, delegate).await);
            }
            Request::Deregister { id, reply } => {
                let _ = reply.send(self.deregister(id).await);
            }
            Request::DirectUpdate {
                id,
                key,
                payload,
                reply,
            } => {
                let _ = reply.send(self.direct_update(id, &key, payload).await);
            }
            Request::AckRunning => {
                self.run_acked = true;
                if self.state == BusState::RegnComplete {
                    self.request_state(BusState::Run).await;
                }
            }
            Request::SetEngineUp(up) => self.adapter.set_engine_up(up),
        }
    }

    /// Register one subtree. On a transport failure nothing is retained:
    /// the registration never becomes half-active.
    async fn register(
        &mut self,
        key: PathKey,
        flags: RegistrationFlags,
        delegate: Arc<dyn RegistrationDelegate>,
        group: Option<GroupId>,
    ) -> Result<RegistrationId, RegisterError> {
        let id = RegistrationId::new(self.next_registration);
        self.next_registration += 1;

        let mut reg = MemberRegistration::new(id, key, flags, delegate, group);
        reg.begin_register();

        self.transport
            .advertise(Advertisement {
                registration: id,
                key: reg.key().clone(),
                flags,
            })
            .await
            .inspect_err(|error| {
                warn!(reg = %id, key = %reg.key(), %error, "advertisement failed");
            })?;

        reg.activate();
        info!(reg = %id, key = %reg.key(), %flags, "registration active");
        self.registrations.insert(id, reg);
        Ok(id)
    }

    /// Register several config subtrees as one group sharing a delegate;
    /// their committed objects are applied through a single cursor per
    /// transaction.
    async fn register_group(
        &mut self,
        entries: Vec<(PathKey, RegistrationFlags)>,
        delegate: Arc<dyn RegistrationDelegate>,
    ) -> Result<Vec<RegistrationId>, RegisterError> {
        if entries.is_empty() {
            return Err(RegisterError::EmptyGroup);
        }
        if entries
            .iter()
            .any(|(key, _)| key.category() != PathCategory::Config)
        {
            return Err(RegisterError::NotConfig);
        }

        let group = GroupId(self.next_group);
        self.next_group += 1;

        let mut ids = Vec::with_capacity(entries.len());
        for (key, flags) in entries {
            match self
                .register(key, flags, Arc::clone(&delegate), Some(group))
                .await
            {
                Ok(id) => ids.push(id),
                Err(e) => {
                    // Roll the partial group back; best effort.
                    for id in ids {
                        if self.registrations.remove(&id).is_some() {
                            if let Err(error) = self.transport.retract(id).await {
                                warn!(reg = %id, %error, "group rollback retract failed");
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    async fn deregister(&mut self, id: RegistrationId) -> Result<(), ApiError> {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return Err(ApiError::UnknownRegistration(id));
        };

        // Panics on a partially constructed registration; see
        // `MemberRegistration::begin_deregister`.
        reg.begin_deregister();

        if let Err(error) = self.transport.retract(id).await {
            // The local teardown proceeds regardless; the router notices the
            // stale advertisement on its own.
            warn!(reg = %id, %error, "retract failed");
        }
        self.registrations.remove(&id);
        info!(reg = %id, "registration removed");
        Ok(())
    }

    async fn direct_update(
        &mut self,
        id: RegistrationId,
        key: &PathKey,
        payload: Option<Bytes>,
    ) -> Result<(), ApiError> {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return Err(ApiError::UnknownRegistration(id));
        };
        match self.coordinator.direct_update(reg, key, payload).await {
            ReplyCode::Ok => Ok(()),
            _ => Err(ApiError::Rejected),
        }
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::State(state) => self.handle_state_change(state).await,
            BusEvent::Query {
                xact,
                action,
                binpath,
                payload,
            } => self.handle_query(xact, action, binpath, payload).await,
            BusEvent::Precommit { xact } => self.coordinator.precommit(xact),
            BusEvent::Commit { xact } => self.coordinator.commit(xact),
            BusEvent::Abort { xact } => self.coordinator.abort(xact),
        }
    }

    async fn handle_state_change(&mut self, state: BusState) {
        info!(%state, "bus state changed");
        self.state = state;
        self.state_tx.send_replace(state);

        match state {
            // No registrations are required to reach RegnComplete; request
            // the transition immediately.
            BusState::Init => self.request_state(BusState::RegnComplete).await,
            BusState::RegnComplete => {
                debug!("ready for registrations");
                if self.run_acked {
                    self.request_state(BusState::Run).await;
                }
            }
            BusState::Run => {}
        }
    }

    async fn request_state(&self, state: BusState) {
        if let Err(error) = self.transport.request_state(state).await {
            error!(%state, %error, "state transition request failed");
        }
    }

    async fn handle_query(
        &mut self,
        xact: TransactionId,
        action: u8,
        binpath: Bytes,
        payload: Option<Bytes>,
    ) {
        // An invalid action discriminant is a protocol violation by the
        // router, not a recoverable data error.
        let action = QueryAction::try_from(action)
            .unwrap_or_else(|e| panic!("fatal protocol violation from bus: {e}"));

        let key = match PathKey::decode(&binpath) {
            Ok(key) => key,
            Err(error) => {
                warn!(%xact, %error, "undecodable binpath in query");
                self.reply(xact, ReplyCode::NotOk).await;
                return;
            }
        };

        // Dispatch to the first active registration covering the key, in
        // registration order.
        let Some(id) = self
            .registrations
            .values()
            .find(|reg| {
                reg.state() == RegistrationState::Active && reg.key().is_prefix_of(&key)
            })
            .map(|reg| reg.id())
        else {
            trace!(%xact, %key, "query matches no registration");
            self.reply(xact, ReplyCode::Na).await;
            return;
        };
        let reg = self
            .registrations
            .get_mut(&id)
            .expect("registration id resolved above");

        // Config and RPC-input queries are validated by the delegate before
        // anything is staged.
        if matches!(
            key.category(),
            PathCategory::Config | PathCategory::RpcInput
        ) {
            let delegate = Arc::clone(reg.delegate());
            if let Some(res) = reg.resources_mut() {
                res.note_prepare();
            }
            let code = delegate
                .prepare(PrepareContext {
                    xact,
                    action,
                    key: &key,
                    payload: payload.as_ref(),
                })
                .await;
            if code != ReplyCode::Ok {
                debug!(%xact, reg = %id, %code, "prepare rejected query");
                self.reply(xact, code).await;
                return;
            }
        }

        // Only caching registrations persist routed data.
        let code = if reg.flags().contains(RegistrationFlags::CACHE) {
            self.coordinator
                .handle_query(xact, action, &key, payload, reg)
                .await
        } else {
            ReplyCode::Ok
        };
        self.reply(xact, code).await;
    }

    async fn reply(&self, xact: TransactionId, code: ReplyCode) {
        if let Err(error) = self.transport.reply(xact, code).await {
            warn!(%xact, %code, %error, "query reply failed");
        }
    }

    async fn handle_completion(&mut self, completion: KvCompletion) {
        let outcome = self.coordinator.handle_completion(completion);
        match outcome.disposition {
            ReplyDisposition::Done => {}
            ReplyDisposition::Defer => {
                // Reserved for multi-step completion protocols.
                debug!("defer disposition received; treated as no-op");
            }
        }
        if let Some(completed) = outcome.completed {
            self.dispatch_commit_apply(completed).await;
        }
    }

    /// Invoke `commit_apply` for every config registration touched by a
    /// committed transaction: once per group with a cursor spanning the
    /// group's objects, once per ungrouped registration with a cursor over
    /// its own.
    async fn dispatch_commit_apply(&mut self, completed: CompletedXact) {
        #[derive(PartialEq, Eq, Hash)]
        enum DelegateKey {
            Single(RegistrationId),
            Group(GroupId),
        }

        let mut batches: hashbrown::HashMap<DelegateKey, Vec<CommittedObject>> =
            hashbrown::HashMap::new();
        for object in completed.objects {
            let Some(reg) = self.registrations.get(&object.registration) else {
                // Deregistered while the transaction was in flight.
                debug!(reg = %object.registration, "committed object for removed registration");
                continue;
            };
            if reg.key().category() != PathCategory::Config {
                continue;
            }
            let key = match reg.group() {
                Some(group) => DelegateKey::Group(group),
                None => DelegateKey::Single(reg.id()),
            };
            batches.entry(key).or_default().push(object);
        }

        for (_, objects) in batches {
            let first = objects[0].registration;
            let Some(reg) = self.registrations.get(&first) else {
                continue;
            };
            let delegate = Arc::clone(reg.delegate());
            delegate.commit_apply(ApplyCursor::new(&objects)).await;

            let applied = objects.len() as u64;
            for object in &objects {
                if let Some(reg) = self.registrations.get_mut(&object.registration) {
                    if let Some(res) = reg.resources_mut() {
                        res.note_applied(1);
                    }
                }
            }
            trace!(xact = %completed.xact, applied, "commit apply dispatched");
        }
    }
}
