use std::sync::Arc;

use bytes::Bytes;
use keybus_types::{BusState, PathKey, RegistrationFlags, RegistrationId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::reactor::Request;
use crate::registration::RegistrationDelegate;
use crate::transport::TransportError;

/// Errors surfaced synchronously from a registration attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The transport refused the advertisement; nothing was registered.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A registration group may only contain config-category keys.
    #[error("registration groups must contain only config-category keys")]
    NotConfig,

    /// A registration group must contain at least one entry.
    #[error("empty registration group")]
    EmptyGroup,
}

/// Errors returned by [`MemberHandle`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The member reactor has stopped; the handle is permanently dead.
    #[error("member reactor terminated")]
    Terminated,

    /// No registration with the given ID exists on this member.
    #[error("unknown registration {0}")]
    UnknownRegistration(RegistrationId),

    /// The write could not be issued (no KV table could be obtained).
    #[error("update rejected: no kv table available")]
    Rejected,

    /// The registration itself failed.
    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// A cloneable handle to one member instance.
///
/// All operations are request/response round-trips to the member's reactor
/// task. Once the reactor stops - all handles dropped elsewhere, or the bus
/// event stream closed - every operation returns [`ApiError::Terminated`];
/// a handle cannot silently outlive its member.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    requests: mpsc::Sender<Request>,
    state_rx: watch::Receiver<BusState>,
}

impl MemberHandle {
    pub(crate) fn new(requests: mpsc::Sender<Request>, state_rx: watch::Receiver<BusState>) -> Self {
        Self { requests, state_rx }
    }

    /// Register interest in the subtree rooted at `key`.
    ///
    /// Surfaces transport failures synchronously; on error nothing was
    /// registered. Registrations made after the bus reaches `Run` succeed
    /// (late joiners are permitted) but see no replayed history.
    pub async fn register(
        &self,
        key: PathKey,
        flags: RegistrationFlags,
        delegate: Arc<dyn RegistrationDelegate>,
    ) -> Result<RegistrationId, ApiError> {
        self.round_trip(|reply| Request::Register {
            key,
            flags,
            delegate,
            reply,
        })
        .await?
        .map_err(ApiError::from)
    }

    /// Register several config subtrees as one group sharing `delegate`.
    ///
    /// The group's committed objects are applied through a single cursor
    /// per transaction.
    pub async fn register_group(
        &self,
        entries: Vec<(PathKey, RegistrationFlags)>,
        delegate: Arc<dyn RegistrationDelegate>,
    ) -> Result<Vec<RegistrationId>, ApiError> {
        self.round_trip(|reply| Request::RegisterGroup {
            entries,
            delegate,
            reply,
        })
        .await?
        .map_err(ApiError::from)
    }

    /// Tear down a registration.
    ///
    /// # Panics
    ///
    /// The reactor panics (taking the member down) if the registration's
    /// owning resources were never allocated; see
    /// [`MemberRegistration::begin_deregister`].
    ///
    /// [`MemberRegistration::begin_deregister`]: crate::MemberRegistration
    pub async fn deregister(&self, id: RegistrationId) -> Result<(), ApiError> {
        self.round_trip(|reply| Request::Deregister { id, reply }).await?
    }

    /// Issue a non-transactional single-shot write (or, with `payload` of
    /// `None`, a removal) against `id`'s KV table, bypassing the two-phase
    /// protocol.
    pub async fn direct_update(
        &self,
        id: RegistrationId,
        key: PathKey,
        payload: Option<Bytes>,
    ) -> Result<(), ApiError> {
        self.round_trip(|reply| Request::DirectUpdate { id, key, payload, reply })
            .await?
    }

    /// Acknowledge readiness to enter `Run`; typically called after the
    /// application has performed its registrations.
    pub async fn ack_running(&self) -> Result<(), ApiError> {
        self.send(Request::AckRunning).await
    }

    /// Flip the KV engine availability gate for this member.
    pub async fn set_engine_up(&self, up: bool) -> Result<(), ApiError> {
        self.send(Request::SetEngineUp(up)).await
    }

    /// A watch over the member's bus connection state.
    pub fn state_events(&self) -> watch::Receiver<BusState> {
        self.state_rx.clone()
    }

    async fn send(&self, request: Request) -> Result<(), ApiError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ApiError::Terminated)
    }

    async fn round_trip<T: Send>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request + Send,
    ) -> Result<T, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| ApiError::Terminated)
    }
}
