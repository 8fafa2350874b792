use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use keybus_kv::{KvCompletion, KvOperationAdapter, KvTableHandle, KvTableRegistry, OpKind};
use keybus_sharder::ShardRouter;
use keybus_types::{
    DataObjectId, PathKey, QueryAction, RegistrationId, ReplyCode, ReplyDisposition, ReplyStatus,
    SerialNumber, ShardDbInfo, TransactionId,
};
use tracing::{debug, trace, warn};

use crate::registration::{CommittedObject, MemberRegistration};

/// The two-phase lifecycle of one in-flight data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactPhase {
    /// The transactional write has been issued to the engine.
    Staged,
    /// The precommit step completed.
    Precommitted,
    /// The final commit completed; terminal.
    Committed,
    /// The owning transaction aborted, or the write failed; terminal.
    Aborted,
}

/// A commit step queued against a staged object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XactStep {
    Precommit,
    Final,
}

/// The mutable unit exchanged between a registration and the KV layer: one
/// outgoing operation's key material, payload and transaction-scoped state.
///
/// The table handle is present from construction, so the invariant "a serial
/// number is only ever set on an object with a table handle" holds by
/// construction.
#[derive(Debug)]
struct DataObject {
    xact: Option<TransactionId>,
    registration: RegistrationId,
    key: Bytes,
    payload: Option<Bytes>,
    action: QueryAction,
    table: KvTableHandle,
    shard: ShardDbInfo,
    serial: Option<SerialNumber>,
    phase: XactPhase,
    /// Whether an engine operation for this object is awaiting completion.
    inflight: bool,
    /// The commit step whose completion is awaited, if any.
    pending_step: Option<XactStep>,
    /// Commit steps waiting on the staged serial / prior completions.
    queued: VecDeque<XactStep>,
}

/// The objects of one transaction that reached the committed state.
#[derive(Debug)]
pub struct CompletedXact {
    /// The finished transaction.
    pub xact: TransactionId,
    /// Every object committed under it, in staging order.
    pub objects: Vec<CommittedObject>,
}

/// The result of consuming one KV completion.
#[derive(Debug)]
pub struct CompletionOutcome {
    /// What to do with the completion. Always [`ReplyDisposition::Done`]
    /// today; `Defer` must be tolerated by callers as a logged no-op.
    pub disposition: ReplyDisposition,
    /// Set when this completion finished the last object of a transaction.
    pub completed: Option<CompletedXact>,
}

impl CompletionOutcome {
    fn done(completed: Option<CompletedXact>) -> Self {
        Self {
            disposition: ReplyDisposition::Done,
            completed,
        }
    }
}

/// Per-transaction index entry: the objects staged under the transaction
/// and whether any of them has failed.
///
/// A failed transaction never produces a [`CompletedXact`]; its surviving
/// objects drain through their remaining completions and the entry is
/// reaped once none are left.
#[derive(Debug, Default)]
struct XactState {
    objects: Vec<DataObjectId>,
    failed: bool,
}

/// Drives data objects through the two-phase protocol in response to query
/// and phase events from the bus.
///
/// Staging, precommit and final commit are each asynchronous engine
/// operations; the coordinator issues a commit step only once the staged
/// serial number is known and no operation is in flight for the object, so
/// for any single object the engine observes exactly
/// `stage → commit(precommit) → commit(final)` in order. Objects of
/// different transactions complete in no particular order.
#[derive(Debug)]
pub struct TransactionCoordinator {
    router: Arc<ShardRouter>,
    registry: Arc<KvTableRegistry>,
    adapter: Arc<KvOperationAdapter>,
    salt: Bytes,

    objects: HashMap<DataObjectId, DataObject>,
    xacts: HashMap<TransactionId, XactState>,
    next_object: u64,
}

impl TransactionCoordinator {
    /// Construct a coordinator routing shard lookups through `router`,
    /// table acquisition through `registry` and engine traffic through
    /// `adapter`. `salt` is the deployment routing salt applied to every
    /// shard resolution.
    pub fn new(
        router: Arc<ShardRouter>,
        registry: Arc<KvTableRegistry>,
        adapter: Arc<KvOperationAdapter>,
        salt: Bytes,
    ) -> Self {
        Self {
            router,
            registry,
            adapter,
            salt,
            objects: HashMap::new(),
            xacts: HashMap::new(),
            next_object: 1,
        }
    }

    /// Stage the write a routed query asks for against `reg`'s KV table.
    ///
    /// Resolves the registration's shard assignment and table handle on
    /// first use. If no table handle can be obtained, the query fails with
    /// [`ReplyCode::NotOk`] and no engine call is made.
    pub async fn handle_query(
        &mut self,
        xact: TransactionId,
        action: QueryAction,
        key: &PathKey,
        payload: Option<Bytes>,
        reg: &mut MemberRegistration,
    ) -> ReplyCode {
        let Some((table, shard)) = self.ensure_kv_table(reg).await else {
            warn!(%xact, reg = %reg.id(), "no kv table at write time; failing query");
            return ReplyCode::NotOk;
        };

        let binpath = key.encode();
        let id = self.mint_object_id();

        let (payload, issued) = match action {
            QueryAction::Create | QueryAction::Update => {
                let Some(payload) = payload else {
                    warn!(%xact, reg = %reg.id(), %action, "query carries no payload; failing");
                    return ReplyCode::NotOk;
                };
                let issued = self.adapter.xact_insert(
                    id,
                    &table,
                    shard.chunk,
                    binpath.clone(),
                    payload.clone(),
                );
                (Some(payload), issued)
            }
            QueryAction::Delete => {
                let issued = self
                    .adapter
                    .xact_delete(id, &table, shard.chunk, binpath.clone());
                (None, issued)
            }
        };

        // A gated drop produces no completion; recording it as in flight
        // would keep the object alive across an abort.
        self.objects.insert(
            id,
            DataObject {
                xact: Some(xact),
                registration: reg.id(),
                key: binpath,
                payload,
                action,
                table,
                shard,
                serial: None,
                phase: XactPhase::Staged,
                inflight: issued,
                pending_step: None,
                queued: VecDeque::new(),
            },
        );

        self.xacts.entry(xact).or_default().objects.push(id);
        debug!(
            %xact,
            object = %id,
            %action,
            db = %shard.db,
            chunk = %shard.chunk,
            "staged transactional write"
        );
        ReplyCode::Ok
    }

    /// The non-transactional fast path: apply a single-shot write against
    /// `reg`'s KV table immediately, with no staging.
    pub async fn direct_update(
        &mut self,
        reg: &mut MemberRegistration,
        key: &PathKey,
        payload: Option<Bytes>,
    ) -> ReplyCode {
        let Some((table, shard)) = self.ensure_kv_table(reg).await else {
            warn!(reg = %reg.id(), "no kv table at write time; failing direct update");
            return ReplyCode::NotOk;
        };

        let binpath = key.encode();
        let id = self.mint_object_id();

        let (action, issued) = match &payload {
            Some(value) => {
                let issued = self
                    .adapter
                    .insert(id, &table, shard.chunk, binpath.clone(), value.clone());
                (QueryAction::Update, issued)
            }
            None => {
                let issued = self.adapter.delete(id, &table, shard.chunk, binpath.clone());
                (QueryAction::Delete, issued)
            }
        };

        // Nothing references a direct object besides its completion, so a
        // gated drop keeps no bookkeeping at all.
        if !issued {
            debug!(reg = %reg.id(), object = %id, %action, "direct update dropped while engine down");
            return ReplyCode::Ok;
        }

        self.objects.insert(
            id,
            DataObject {
                xact: None,
                registration: reg.id(),
                key: binpath,
                payload,
                action,
                table,
                shard,
                serial: None,
                phase: XactPhase::Staged,
                inflight: true,
                pending_step: None,
                queued: VecDeque::new(),
            },
        );
        debug!(reg = %reg.id(), object = %id, %action, db = %shard.db, "issued direct update");
        ReplyCode::Ok
    }

    /// Enqueue the precommit step for every staged object of `xact`.
    pub fn precommit(&mut self, xact: TransactionId) {
        self.enqueue_step(xact, XactStep::Precommit);
    }

    /// Enqueue the final commit step for every object of `xact`.
    pub fn commit(&mut self, xact: TransactionId) {
        self.enqueue_step(xact, XactStep::Final);
    }

    /// Abandon `xact`: its objects stop progressing through further phases.
    ///
    /// There is no cancellation of in-flight engine operations; completions
    /// that later arrive for abandoned objects are tolerated as no-ops.
    pub fn abort(&mut self, xact: TransactionId) {
        let Some(state) = self.xacts.remove(&xact) else {
            debug!(%xact, "abort for unknown transaction; ignoring");
            return;
        };
        for id in state.objects {
            if let Some(obj) = self.objects.get_mut(&id) {
                obj.phase = XactPhase::Aborted;
                obj.queued.clear();
                obj.pending_step = None;
                if !obj.inflight {
                    self.objects.remove(&id);
                }
            }
        }
        debug!(%xact, "transaction aborted");
    }

    /// Consume one KV completion, advancing the owning object's phase.
    ///
    /// Completions for unknown or abandoned objects are logged and dropped.
    pub fn handle_completion(&mut self, completion: KvCompletion) -> CompletionOutcome {
        let KvCompletion {
            token,
            op,
            status,
            serial,
        } = completion;

        let Some(obj) = self.objects.get_mut(&token) else {
            debug!(%token, %op, "completion for unknown or reaped object; ignoring");
            return CompletionOutcome::done(None);
        };
        obj.inflight = false;

        if obj.phase == XactPhase::Aborted {
            trace!(%token, %op, "completion for aborted object; reaping");
            self.objects.remove(&token);
            return CompletionOutcome::done(None);
        }

        if status == ReplyStatus::Failure {
            warn!(
                xact = ?obj.xact,
                %token,
                %op,
                "kv operation failed; abandoning object"
            );
            let xact = obj.xact;
            self.objects.remove(&token);
            if let Some(xact) = xact {
                self.note_failure(xact);
            }
            return CompletionOutcome::done(None);
        }

        match op {
            OpKind::XactInsert | OpKind::XactDelete => {
                // The engine's staging serial is written back onto the
                // object; commit steps are gated on its presence.
                obj.serial = serial;
                trace!(%token, serial = ?serial, "staged write acknowledged");
                self.pump(token);
                CompletionOutcome::done(None)
            }
            OpKind::Insert | OpKind::Delete => {
                // Direct path: terminal on first completion.
                obj.phase = XactPhase::Committed;
                trace!(%token, %op, "direct update applied");
                self.objects.remove(&token);
                CompletionOutcome::done(None)
            }
            OpKind::Commit => match obj.pending_step.take() {
                Some(XactStep::Precommit) => {
                    obj.phase = XactPhase::Precommitted;
                    trace!(%token, "object precommitted");
                    self.pump(token);
                    CompletionOutcome::done(None)
                }
                Some(XactStep::Final) => {
                    obj.phase = XactPhase::Committed;
                    let xact = obj.xact;
                    trace!(%token, "object committed");
                    CompletionOutcome::done(xact.and_then(|x| self.maybe_complete(x)))
                }
                None => {
                    warn!(%token, "commit completion with no pending step; ignoring");
                    CompletionOutcome::done(None)
                }
            },
        }
    }

    /// The phase of the object identified by `id`, if it is still live.
    pub fn object_phase(&self, id: DataObjectId) -> Option<XactPhase> {
        self.objects.get(&id).map(|o| o.phase)
    }

    /// Number of live (non-reaped) data objects.
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    fn mint_object_id(&mut self) -> DataObjectId {
        let id = DataObjectId::new(self.next_object);
        self.next_object += 1;
        id
    }

    /// Resolve `reg`'s shard assignment and KV table handle, lazily, reusing
    /// whatever is already resolved. Returns `None` when no table handle
    /// can be obtained - in which case no engine call may be made.
    async fn ensure_kv_table(
        &self,
        reg: &mut MemberRegistration,
    ) -> Option<(KvTableHandle, ShardDbInfo)> {
        if reg.shard.is_none() {
            match self.router.resolve(reg.key(), &self.salt).await {
                Ok(shard) => reg.shard = Some(shard),
                Err(error) => {
                    warn!(reg = %reg.id(), %error, "shard resolution failed");
                    return None;
                }
            }
        }
        let shard = reg.shard?;

        if reg.table.is_none() {
            reg.table = Some(self.registry.get_or_create(shard.db));
        }
        reg.table.clone().map(|t| (t, shard))
    }

    /// Mark `xact` failed and reap its index entry once no live object of
    /// it remains. A failed transaction never completes; siblings that were
    /// already in flight drain through their remaining completions.
    fn note_failure(&mut self, xact: TransactionId) {
        let Some(state) = self.xacts.get_mut(&xact) else {
            return;
        };
        state.failed = true;
        if state
            .objects
            .iter()
            .all(|id| !self.objects.contains_key(id))
        {
            self.xacts.remove(&xact);
            debug!(%xact, "failed transaction reaped");
        }
    }

    fn enqueue_step(&mut self, xact: TransactionId, step: XactStep) {
        let Some(state) = self.xacts.get(&xact) else {
            debug!(%xact, ?step, "phase event for unknown transaction; ignoring");
            return;
        };
        for id in state.objects.clone() {
            if let Some(obj) = self.objects.get_mut(&id) {
                if obj.phase != XactPhase::Aborted {
                    obj.queued.push_back(step);
                }
            }
            self.pump(id);
        }
    }

    /// Issue the next queued commit step for `id`, if the object is ready:
    /// staged serial known, nothing in flight, not terminal.
    fn pump(&mut self, id: DataObjectId) {
        let Some(obj) = self.objects.get_mut(&id) else {
            return;
        };
        if obj.inflight || matches!(obj.phase, XactPhase::Aborted | XactPhase::Committed) {
            return;
        }
        let Some(serial) = obj.serial else {
            // The staged completion has not arrived yet; the step stays
            // queued and is re-examined when it does.
            return;
        };
        let Some(step) = obj.queued.pop_front() else {
            return;
        };

        obj.pending_step = Some(step);
        obj.inflight = true;
        let table = obj.table.clone();
        let action = obj.action;

        trace!(object = %id, ?step, %serial, "issuing commit step");
        if !self.adapter.commit(id, &table, serial, action) {
            // Gated drop: no completion will arrive. Put the step back so
            // the object is not stranded mid-protocol with false in-flight
            // state.
            let obj = self.objects.get_mut(&id).expect("object resolved above");
            obj.pending_step = None;
            obj.inflight = false;
            obj.queued.push_front(step);
        }
    }

    /// If every object of `xact` has committed, reap them and produce the
    /// completed-transaction record.
    ///
    /// A transaction with a failed object never completes: its surviving
    /// objects are reaped as they go terminal, and the index entry once
    /// none remain.
    fn maybe_complete(&mut self, xact: TransactionId) -> Option<CompletedXact> {
        let state = self.xacts.get(&xact)?;

        if state.failed {
            let ids = state.objects.clone();
            for id in &ids {
                if self
                    .objects
                    .get(id)
                    .is_some_and(|o| o.phase == XactPhase::Committed)
                {
                    self.objects.remove(id);
                }
            }
            if ids.iter().all(|id| !self.objects.contains_key(id)) {
                self.xacts.remove(&xact);
                debug!(%xact, "partially failed transaction reaped without completing");
            }
            return None;
        }

        let all_committed = state.objects.iter().all(|id| {
            self.objects
                .get(id)
                .is_some_and(|o| o.phase == XactPhase::Committed)
        });
        if !all_committed {
            return None;
        }

        let state = self.xacts.remove(&xact)?;
        let objects = state
            .objects
            .into_iter()
            .filter_map(|id| self.objects.remove(&id))
            .map(|o| CommittedObject {
                registration: o.registration,
                action: o.action,
                key: o.key,
                payload: o.payload,
            })
            .collect();
        debug!(%xact, "transaction fully committed");
        Some(CompletedXact { xact, objects })
    }
}
