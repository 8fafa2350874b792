//! A call-recording [`Transport`] for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use keybus_types::{BusState, RegistrationId, ReplyCode, TransactionId};
use parking_lot::Mutex;

use crate::transport::{Advertisement, Transport, TransportError};

/// One recorded [`Transport`] invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTransportCall {
    /// An `advertise` call.
    Advertise(Advertisement),
    /// A `retract` call.
    Retract(RegistrationId),
    /// A `request_state` call.
    RequestState(BusState),
    /// A `reply` call.
    Reply {
        /// The transaction replied to.
        xact: TransactionId,
        /// The code reported.
        code: ReplyCode,
    },
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<MockTransportCall>,
    advertise_errors: VecDeque<TransportError>,
}

/// A mock [`Transport`] recording every call; advertisements can be made to
/// fail on demand.
#[derive(Debug, Default)]
pub struct MockTransport(Mutex<Inner>);

impl MockTransport {
    /// Return the errors specified in `errors` in sequence for calls to
    /// `advertise`, starting from the front; further calls succeed.
    pub fn with_advertise_errors(self, errors: impl Into<VecDeque<TransportError>>) -> Self {
        self.0.lock().advertise_errors = errors.into();
        self
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<MockTransportCall> {
        self.0.lock().calls.clone()
    }

    /// The query replies recorded so far.
    pub fn replies(&self) -> Vec<(TransactionId, ReplyCode)> {
        self.0
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockTransportCall::Reply { xact, code } => Some((*xact, *code)),
                _ => None,
            })
            .collect()
    }

    /// The state transition requests recorded so far.
    pub fn state_requests(&self) -> Vec<BusState> {
        self.0
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockTransportCall::RequestState(s) => Some(*s),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn advertise(&self, ad: Advertisement) -> Result<(), TransportError> {
        let mut guard = self.0.lock();
        guard.calls.push(MockTransportCall::Advertise(ad));
        match guard.advertise_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn retract(&self, registration: RegistrationId) -> Result<(), TransportError> {
        self.0.lock().calls.push(MockTransportCall::Retract(registration));
        Ok(())
    }

    async fn request_state(&self, state: BusState) -> Result<(), TransportError> {
        self.0
            .lock()
            .calls
            .push(MockTransportCall::RequestState(state));
        Ok(())
    }

    async fn reply(&self, xact: TransactionId, code: ReplyCode) -> Result<(), TransportError> {
        self.0
            .lock()
            .calls
            .push(MockTransportCall::Reply { xact, code });
        Ok(())
    }
}
