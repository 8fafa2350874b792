use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use keybus_types::{BusState, PathKey, RegistrationFlags, RegistrationId, ReplyCode, TransactionId};
use thiserror::Error;

/// Errors returned by [`Transport`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The bus could not be reached.
    #[error("bus unreachable: {0}")]
    Unreachable(String),

    /// The router refused the request.
    #[error("rejected by router: {0}")]
    Rejected(String),
}

/// A subtree registration announcement sent to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// The member-local registration identity.
    pub registration: RegistrationId,
    /// The registered subtree.
    pub key: PathKey,
    /// The registration's role flags.
    pub flags: RegistrationFlags,
}

/// The outbound half of the bus connection.
///
/// The inbound half is the [`BusEvent`] stream handed to the member builder;
/// together they form the narrow contract to the real wire transport, which
/// this crate does not implement.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Announce a subtree registration to the router.
    async fn advertise(&self, ad: Advertisement) -> Result<(), TransportError>;

    /// Withdraw a previously advertised registration.
    async fn retract(&self, registration: RegistrationId) -> Result<(), TransportError>;

    /// Ask the router to move this member to `state`.
    async fn request_state(&self, state: BusState) -> Result<(), TransportError>;

    /// Report the outcome of a routed query.
    async fn reply(&self, xact: TransactionId, code: ReplyCode) -> Result<(), TransportError>;
}

/// One inbound event from the bus.
///
/// The query action arrives as its raw wire discriminant; decoding it is the
/// member's responsibility (and an invalid discriminant is a fatal protocol
/// violation).
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The router moved this member to a new connection state.
    State(BusState),

    /// A query routed to one of this member's registered subtrees.
    ///
    /// When several active registrations cover the addressed key, the query
    /// is dispatched to the first match in registration order; the others
    /// never see it.
    Query {
        /// The owning transaction.
        xact: TransactionId,
        /// Raw wire discriminant of the [`QueryAction`].
        ///
        /// [`QueryAction`]: keybus_types::QueryAction
        action: u8,
        /// Canonical binary encoding of the addressed key.
        binpath: Bytes,
        /// The serialized payload; absent for deletes.
        payload: Option<Bytes>,
    },

    /// Drive every staged write of `xact` through its precommit step.
    Precommit {
        /// The transaction entering precommit.
        xact: TransactionId,
    },

    /// Finalize every precommitted write of `xact`.
    Commit {
        /// The transaction committing.
        xact: TransactionId,
    },

    /// Abandon `xact`; its staged writes stop progressing.
    Abort {
        /// The transaction aborting.
        xact: TransactionId,
    },
}
