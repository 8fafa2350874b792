use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use keybus_kv::KvTableHandle;
use keybus_types::{
    PathKey, QueryAction, RegistrationFlags, RegistrationId, ReplyCode, ShardDbInfo, TransactionId,
};

/// The lifecycle of one subtree registration.
///
/// `Unregistered → Registering → Active → Deregistering`, after which the
/// object is dropped. A registration that fails to advertise never reaches
/// `Active` - it is dropped in place, so no half-registered object survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Created, not yet announced to the router.
    Unregistered,
    /// Advertisement in flight.
    Registering,
    /// Announced and receiving queries.
    Active,
    /// Retraction in flight; the object is dropped when it completes.
    Deregistering,
}

/// Per-registration bookkeeping allocated when the registration activates.
///
/// Presence of this block marks the registration as fully constructed; the
/// deregistration path checks for it before anything else.
#[derive(Debug, Default)]
pub struct RegistrationResources {
    prepares_seen: u64,
    objects_applied: u64,
}

impl RegistrationResources {
    /// How many prepare callbacks this registration has dispatched.
    pub fn prepares_seen(&self) -> u64 {
        self.prepares_seen
    }

    /// How many committed objects this registration has had applied.
    pub fn objects_applied(&self) -> u64 {
        self.objects_applied
    }

    pub(crate) fn note_prepare(&mut self) {
        self.prepares_seen += 1;
    }

    pub(crate) fn note_applied(&mut self, n: u64) {
        self.objects_applied += n;
    }
}

/// The context handed to [`RegistrationDelegate::prepare`].
#[derive(Debug)]
pub struct PrepareContext<'a> {
    /// The owning transaction.
    pub xact: TransactionId,
    /// The requested mutation.
    pub action: QueryAction,
    /// The addressed key.
    pub key: &'a PathKey,
    /// The serialized payload; absent for deletes.
    pub payload: Option<&'a Bytes>,
}

/// One object that reached the committed state within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedObject {
    /// The registration the object belongs to.
    pub registration: RegistrationId,
    /// The committed mutation.
    pub action: QueryAction,
    /// Canonical binary encoding of the object's key.
    pub key: Bytes,
    /// The committed payload; absent for deletes.
    pub payload: Option<Bytes>,
}

/// A cursor over the committed objects visible to one
/// [`RegistrationDelegate::commit_apply`] invocation.
///
/// For a grouped registration the cursor spans every committed object across
/// the group; for a single registration it covers that registration's own
/// objects.
#[derive(Debug)]
pub struct ApplyCursor<'a> {
    objects: &'a [CommittedObject],
    pos: usize,
}

impl<'a> ApplyCursor<'a> {
    pub(crate) fn new(objects: &'a [CommittedObject]) -> Self {
        Self { objects, pos: 0 }
    }

    /// Total number of committed objects behind this cursor.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the cursor covers no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<'a> Iterator for ApplyCursor<'a> {
    type Item = &'a CommittedObject;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.objects.get(self.pos)?;
        self.pos += 1;
        Some(item)
    }
}

/// The callback set bound to a registration (or a registration group).
///
/// `prepare` is dispatched for queries on `Config` and `RpcInput` category
/// subtrees before any KV write is staged; returning [`ReplyCode::NotOk`] or
/// [`ReplyCode::Na`] short-circuits the query. `commit_apply` is invoked
/// once per fully committed transaction with a cursor over the committed
/// objects.
#[async_trait]
pub trait RegistrationDelegate: Debug + Send + Sync {
    /// Validate an incoming query before it is staged.
    async fn prepare(&self, ctx: PrepareContext<'_>) -> ReplyCode {
        let _ = ctx;
        ReplyCode::Ok
    }

    /// Apply the committed objects of a finished transaction.
    async fn commit_apply(&self, cursor: ApplyCursor<'_>) {
        let _ = cursor;
    }
}

/// Identity of a registration group sharing one delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId(pub(crate) u64);

/// One subtree registration bound to a member instance.
///
/// Owns its [`PathKey`]; the shard assignment and KV table handle are
/// resolved lazily by the coordinator the first time a write touches the
/// registration.
#[derive(Debug)]
pub struct MemberRegistration {
    id: RegistrationId,
    key: PathKey,
    flags: RegistrationFlags,
    delegate: Arc<dyn RegistrationDelegate>,
    state: RegistrationState,
    group: Option<GroupId>,

    pub(crate) shard: Option<ShardDbInfo>,
    pub(crate) table: Option<KvTableHandle>,
    resources: Option<RegistrationResources>,
}

impl MemberRegistration {
    pub(crate) fn new(
        id: RegistrationId,
        key: PathKey,
        flags: RegistrationFlags,
        delegate: Arc<dyn RegistrationDelegate>,
        group: Option<GroupId>,
    ) -> Self {
        Self {
            id,
            key,
            flags,
            delegate,
            state: RegistrationState::Unregistered,
            group,
            shard: None,
            table: None,
            resources: None,
        }
    }

    /// The member-local registration identity.
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// The registered subtree.
    pub fn key(&self) -> &PathKey {
        &self.key
    }

    /// The registration's role flags.
    pub fn flags(&self) -> RegistrationFlags {
        self.flags
    }

    /// The current lifecycle state.
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// The lazily resolved shard assignment, if any write has resolved it.
    pub fn shard(&self) -> Option<ShardDbInfo> {
        self.shard
    }

    /// The bookkeeping block, present once the registration is active.
    pub fn resources(&self) -> Option<&RegistrationResources> {
        self.resources.as_ref()
    }

    pub(crate) fn resources_mut(&mut self) -> Option<&mut RegistrationResources> {
        self.resources.as_mut()
    }

    pub(crate) fn delegate(&self) -> &Arc<dyn RegistrationDelegate> {
        &self.delegate
    }

    pub(crate) fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub(crate) fn begin_register(&mut self) {
        self.state = RegistrationState::Registering;
    }

    /// Mark the advertisement acknowledged and allocate the owning
    /// bookkeeping block.
    pub(crate) fn activate(&mut self) {
        self.state = RegistrationState::Active;
        self.resources = Some(RegistrationResources::default());
    }

    /// Begin tearing this registration down.
    ///
    /// # Panics
    ///
    /// Panics if the registration's owning resources were never allocated -
    /// that means the object is partially constructed, which is programmer
    /// error, not a recoverable condition.
    pub(crate) fn begin_deregister(&mut self) {
        assert!(
            self.resources.is_some(),
            "deregistration of partially constructed registration {}: owning resources absent",
            self.id,
        );
        self.state = RegistrationState::Deregistering;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NopDelegate;

    #[async_trait]
    impl RegistrationDelegate for NopDelegate {}

    fn registration() -> MemberRegistration {
        MemberRegistration::new(
            RegistrationId::new(1),
            "C:/a/b".parse().unwrap(),
            RegistrationFlags::PUBLISHER,
            Arc::new(NopDelegate),
            None,
        )
    }

    #[test]
    fn lifecycle_transitions() {
        let mut reg = registration();
        assert_eq!(reg.state(), RegistrationState::Unregistered);
        assert!(reg.resources().is_none());

        reg.begin_register();
        assert_eq!(reg.state(), RegistrationState::Registering);

        reg.activate();
        assert_eq!(reg.state(), RegistrationState::Active);
        assert!(reg.resources().is_some());

        reg.begin_deregister();
        assert_eq!(reg.state(), RegistrationState::Deregistering);
    }

    #[test]
    #[should_panic = "owning resources absent"]
    fn deregister_without_resources_is_fatal() {
        // A registration that never activated has no bookkeeping block;
        // tearing it down is a precondition violation, not a silent no-op.
        let mut reg = registration();
        reg.begin_register();
        reg.begin_deregister();
    }

    #[test]
    fn apply_cursor_iterates_in_order() {
        let objects = vec![
            CommittedObject {
                registration: RegistrationId::new(1),
                action: QueryAction::Create,
                key: Bytes::from_static(b"a"),
                payload: Some(Bytes::from_static(b"1")),
            },
            CommittedObject {
                registration: RegistrationId::new(1),
                action: QueryAction::Delete,
                key: Bytes::from_static(b"b"),
                payload: None,
            },
        ];

        let cursor = ApplyCursor::new(&objects);
        assert_eq!(cursor.len(), 2);
        assert_eq!(cursor.collect::<Vec<_>>(), objects.iter().collect::<Vec<_>>());
    }
}
