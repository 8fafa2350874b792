//! End-to-end tests driving a member instance exactly like the bus would:
//! events in through the inbound channel, effects observed on the mock
//! transport and mock KV engine.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use keybus_kv::mock::{MockEngineCall, MockKvEngine};
use keybus_kv::KvTableRegistry;
use keybus_member::mock::MockTransport;
use keybus_member::{
    ApiError, ApplyCursor, BusEvent, CommittedObject, MemberBuilder, MemberHandle,
    PrepareContext, RegisterError, RegistrationDelegate, TransportError,
};
use keybus_sharder::JumpHashDirectory;
use keybus_types::{
    BlobMessage, BusState, DbNumber, Message, PathKey, QueryAction, RegistrationFlags,
    ReplyCode, ShardChunkId, ShardDbInfo, TransactionId,
};

/// A delegate recording every callback it receives.
#[derive(Debug, Default)]
struct RecordingDelegate {
    prepares: Mutex<Vec<(TransactionId, QueryAction, PathKey)>>,
    applies: Mutex<Vec<Vec<CommittedObject>>>,
    prepare_code: Mutex<Option<ReplyCode>>,
}

impl RecordingDelegate {
    fn rejecting(code: ReplyCode) -> Self {
        Self {
            prepare_code: Mutex::new(Some(code)),
            ..Default::default()
        }
    }

    fn prepares(&self) -> Vec<(TransactionId, QueryAction, PathKey)> {
        self.prepares.lock().clone()
    }

    fn applies(&self) -> Vec<Vec<CommittedObject>> {
        self.applies.lock().clone()
    }
}

#[async_trait::async_trait]
impl RegistrationDelegate for RecordingDelegate {
    async fn prepare(&self, ctx: PrepareContext<'_>) -> ReplyCode {
        self.prepares
            .lock()
            .push((ctx.xact, ctx.action, ctx.key.clone()));
        self.prepare_code.lock().unwrap_or(ReplyCode::Ok)
    }

    async fn commit_apply(&self, cursor: ApplyCursor<'_>) {
        self.applies.lock().push(cursor.cloned().collect());
    }
}

struct TestBus {
    transport: Arc<MockTransport>,
    engine: Arc<MockKvEngine>,
    registry: Arc<KvTableRegistry>,
    events: mpsc::Sender<BusEvent>,
    handle: MemberHandle,
}

impl TestBus {
    /// Build a member over mocks, with every key routing to one shard on
    /// `db 7` - which also makes shared-table behaviour deterministic.
    fn new() -> Self {
        Self::with_transport(MockTransport::default())
    }

    fn with_transport(transport: MockTransport) -> Self {
        let transport = Arc::new(transport);
        let engine = Arc::new(MockKvEngine::default());
        let registry = Arc::new(KvTableRegistry::new(Arc::clone(&engine) as _));
        let directory = Arc::new(JumpHashDirectory::new([ShardDbInfo {
            chunk: ShardChunkId::new(0),
            db: DbNumber::new(7),
        }]));
        let (events, events_rx) = mpsc::channel(64);

        let handle = MemberBuilder::new(
            Arc::clone(&transport) as _,
            events_rx,
            Arc::clone(&engine) as _,
            directory as _,
            Arc::clone(&registry),
            Bytes::from_static(b"test-salt"),
        )
        .build();

        Self {
            transport,
            engine,
            registry,
            events,
            handle,
        }
    }

    async fn send(&self, event: BusEvent) {
        self.events.send(event).await.expect("reactor alive");
    }

    /// Walk the member through `Init -> RegnComplete`.
    async fn to_regn_complete(&self) {
        self.send(BusEvent::State(BusState::Init)).await;
        wait_for(|| {
            self.transport
                .state_requests()
                .contains(&BusState::RegnComplete)
        })
        .await;
        self.send(BusEvent::State(BusState::RegnComplete)).await;
        let mut state = self.handle.state_events();
        state
            .wait_for(|s| *s == BusState::RegnComplete)
            .await
            .expect("reactor alive");
    }

    /// Acknowledge and complete the transition to `Run`.
    async fn to_run(&self) {
        self.handle.ack_running().await.expect("reactor alive");
        wait_for(|| self.transport.state_requests().contains(&BusState::Run)).await;
        self.send(BusEvent::State(BusState::Run)).await;
        let mut state = self.handle.state_events();
        state
            .wait_for(|s| *s == BusState::Run)
            .await
            .expect("reactor alive");
    }

    async fn query(&self, xact: TransactionId, action: QueryAction, key: &str, payload: Option<&'static [u8]>) {
        self.send(BusEvent::Query {
            xact,
            action: action.wire_value(),
            binpath: key.parse::<PathKey>().unwrap().encode(),
            payload: payload.map(|p| BlobMessage(Bytes::from_static(p)).serialize()),
        })
        .await;
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool + Send) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

fn key(s: &str) -> PathKey {
    s.parse().unwrap()
}

#[test_log::test(tokio::test)]
async fn bus_lifecycle_reaches_run_in_order() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    // Registration happens in the ready window, before Run is requested.
    bus.handle
        .register(
            key("C:/a/b{k=1}"),
            RegistrationFlags::PUBLISHER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();

    bus.to_run().await;
    assert_eq!(
        bus.transport.state_requests(),
        vec![BusState::RegnComplete, BusState::Run]
    );
}

#[test_log::test(tokio::test)]
async fn create_query_runs_the_full_two_phase_protocol() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    let delegate = Arc::new(RecordingDelegate::default());
    bus.handle
        .register(
            key("C:/a/b{k=1}"),
            RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE,
            Arc::clone(&delegate) as _,
        )
        .await
        .unwrap();
    bus.to_run().await;

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/a/b{k=1}/leaf", Some(b"value"))
        .await;

    // The query is accepted once the write is staged.
    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Ok)]).await;
    assert_eq!(delegate.prepares().len(), 1);

    bus.send(BusEvent::Precommit { xact }).await;
    wait_for(|| bus.engine.data_calls().len() == 2).await;
    bus.send(BusEvent::Commit { xact }).await;
    wait_for(|| bus.engine.data_calls().len() == 3).await;

    // Exactly stage -> commit -> commit against db 7, with the serial the
    // stage produced.
    let calls = bus.engine.data_calls();
    assert_matches!(
        &calls[0],
        MockEngineCall::XactInsert { db, key: k, value, .. } => {
            assert_eq!(*db, DbNumber::new(7));
            assert_eq!(k, &key("C:/a/b{k=1}/leaf").encode());
            assert_eq!(value, &Bytes::from_static(b"value"));
        }
    );
    assert_matches!(
        (&calls[1], &calls[2]),
        (
            MockEngineCall::Commit { action: QueryAction::Create, .. },
            MockEngineCall::Commit { action: QueryAction::Create, .. },
        )
    );

    // The fully committed transaction is applied through the delegate.
    wait_for(|| !delegate.applies().is_empty()).await;
    let applies = delegate.applies();
    assert_eq!(applies.len(), 1);
    assert_eq!(applies[0].len(), 1);
    assert_eq!(applies[0][0].key, key("C:/a/b{k=1}/leaf").encode());
}

#[tokio::test]
async fn unmatched_query_is_not_applicable() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;
    bus.handle
        .register(
            key("C:/a/b"),
            RegistrationFlags::SUBSCRIBER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
    bus.to_run().await;

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/other/tree", Some(b"v"))
        .await;

    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Na)]).await;
}

#[tokio::test]
async fn overlapping_registrations_dispatch_to_the_first_match() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    let outer = Arc::new(RecordingDelegate::default());
    let inner = Arc::new(RecordingDelegate::default());
    bus.handle
        .register(
            key("C:/a"),
            RegistrationFlags::SUBSCRIBER,
            Arc::clone(&outer) as _,
        )
        .await
        .unwrap();
    bus.handle
        .register(
            key("C:/a/b"),
            RegistrationFlags::SUBSCRIBER,
            Arc::clone(&inner) as _,
        )
        .await
        .unwrap();
    bus.to_run().await;

    // Both subtrees cover the key; only the first registration sees the
    // query.
    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/a/b/c", Some(b"v")).await;
    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Ok)]).await;

    assert_eq!(outer.prepares().len(), 1);
    assert!(inner.prepares().is_empty());
}

#[tokio::test]
async fn prepare_rejection_short_circuits_the_write() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;
    bus.handle
        .register(
            key("C:/a"),
            RegistrationFlags::SUBSCRIBER | RegistrationFlags::CACHE,
            Arc::new(RecordingDelegate::rejecting(ReplyCode::NotOk)),
        )
        .await
        .unwrap();
    bus.to_run().await;

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Update, "C:/a/x", Some(b"v")).await;

    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::NotOk)]).await;
    assert!(bus.engine.data_calls().is_empty());
}

#[tokio::test]
async fn registrations_on_one_db_share_one_table() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    let a = bus
        .handle
        .register(
            key("C:/left"),
            RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
    let b = bus
        .handle
        .register(
            key("C:/right"),
            RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
    bus.to_run().await;

    bus.handle
        .direct_update(a, key("C:/left/x"), Some(Bytes::from_static(b"1")))
        .await
        .unwrap();
    bus.handle
        .direct_update(b, key("C:/right/y"), Some(Bytes::from_static(b"2")))
        .await
        .unwrap();

    // Both keys route to db 7; the engine saw exactly one table
    // registration and the registry holds exactly one handle.
    let table_registrations = bus
        .engine
        .calls()
        .into_iter()
        .filter(|c| matches!(c, MockEngineCall::RegisterTable { .. }))
        .count();
    assert_eq!(table_registrations, 1);
    assert_eq!(bus.registry.table_count(), 1);
}

#[tokio::test]
async fn late_registration_after_run_succeeds() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;
    bus.to_run().await;

    let id = bus
        .handle
        .register(
            key("C:/late"),
            RegistrationFlags::SUBSCRIBER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/late/x", Some(b"v")).await;
    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Ok)]).await;

    bus.handle.deregister(id).await.unwrap();
    let xact2 = TransactionId::new();
    bus.query(xact2, QueryAction::Create, "C:/late/x", Some(b"v")).await;
    wait_for(|| bus.transport.replies().len() == 2).await;
    assert_eq!(bus.transport.replies()[1], (xact2, ReplyCode::Na));
}

#[tokio::test]
async fn failed_advertisement_registers_nothing() {
    let bus = TestBus::with_transport(MockTransport::default().with_advertise_errors([
        TransportError::Unreachable("router down".into()),
    ]));
    bus.to_regn_complete().await;

    let err = bus
        .handle
        .register(
            key("C:/a"),
            RegistrationFlags::PUBLISHER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ApiError::Register(RegisterError::Transport(TransportError::Unreachable(_)))
    );
    bus.to_run().await;

    // The failed registration left nothing behind: its subtree is not
    // applicable.
    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/a/x", Some(b"v")).await;
    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Na)]).await;

    // A retry on the same handle succeeds.
    bus.handle
        .register(
            key("C:/a"),
            RegistrationFlags::PUBLISHER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn engine_down_gates_all_kv_traffic() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;
    bus.handle
        .register(
            key("C:/a"),
            RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
    bus.to_run().await;
    bus.handle.set_engine_up(false).await.unwrap();

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/a/x", Some(b"v")).await;
    wait_for(|| bus.transport.replies() == vec![(xact, ReplyCode::Ok)]).await;
    bus.send(BusEvent::Precommit { xact }).await;
    bus.send(BusEvent::Commit { xact }).await;

    // Give any stray engine traffic a chance to surface, then assert the
    // gate held: zero engine data calls.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(bus.engine.data_calls().is_empty());
}

#[tokio::test]
async fn aborted_transaction_stops_progressing() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;
    bus.handle
        .register(
            key("C:/a"),
            RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap();
    bus.to_run().await;

    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/a/x", Some(b"v")).await;
    wait_for(|| bus.engine.data_calls().len() == 1).await;

    bus.send(BusEvent::Abort { xact }).await;
    bus.send(BusEvent::Precommit { xact }).await;
    bus.send(BusEvent::Commit { xact }).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    // The staged write is the only engine call; the abort stopped the
    // object from progressing through commit steps.
    assert_eq!(bus.engine.data_calls().len(), 1);
}

#[test_log::test(tokio::test)]
async fn grouped_registrations_apply_through_one_cursor() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    let delegate = Arc::new(RecordingDelegate::default());
    let flags = RegistrationFlags::SUBSCRIBER | RegistrationFlags::CACHE;
    let ids = bus
        .handle
        .register_group(
            vec![(key("C:/net"), flags), (key("C:/sys"), flags)],
            Arc::clone(&delegate) as _,
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    bus.to_run().await;

    // One transaction touching both subtrees.
    let xact = TransactionId::new();
    bus.query(xact, QueryAction::Create, "C:/net/if", Some(b"eth0")).await;
    bus.query(xact, QueryAction::Create, "C:/sys/host", Some(b"node1")).await;
    wait_for(|| bus.transport.replies().len() == 2).await;

    bus.send(BusEvent::Precommit { xact }).await;
    wait_for(|| bus.engine.data_calls().len() == 4).await;
    bus.send(BusEvent::Commit { xact }).await;

    // Both objects arrive through a single cursor.
    wait_for(|| !delegate.applies().is_empty()).await;
    let applies = delegate.applies();
    assert_eq!(applies.len(), 1);
    assert_eq!(applies[0].len(), 2);
}

#[tokio::test]
async fn group_registration_validates_categories() {
    let bus = TestBus::new();
    bus.to_regn_complete().await;

    let err = bus
        .handle
        .register_group(
            vec![
                (key("C:/net"), RegistrationFlags::SUBSCRIBER),
                (key("D:/stats"), RegistrationFlags::SUBSCRIBER),
            ],
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::Register(RegisterError::NotConfig));

    let err = bus
        .handle
        .register_group(vec![], Arc::new(RecordingDelegate::default()))
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::Register(RegisterError::EmptyGroup));
}

#[tokio::test]
async fn dropped_reactor_surfaces_as_terminated() {
    let bus = TestBus::new();
    // Closing the bus event stream stops the reactor.
    drop(bus.events);
    // Allow the reactor to observe the closure and exit.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = bus
        .handle
        .register(
            key("C:/a"),
            RegistrationFlags::PUBLISHER,
            Arc::new(RecordingDelegate::default()),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::Terminated);
}
