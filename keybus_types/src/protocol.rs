use std::fmt::{self, Display};

use thiserror::Error;

/// Error returned when decoding a [`QueryAction`] off the wire.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid query action discriminant {0}")]
pub struct QueryActionError(pub u8);

/// The mutation a routed query asks a registration to perform.
///
/// The wire encoding reserves discriminant `0` as the invalid value;
/// decoding it (or any unknown discriminant) is a protocol violation
/// surfaced as a [`QueryActionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryAction {
    /// Create the addressed object.
    Create,
    /// Update the addressed object in place.
    Update,
    /// Remove the addressed object.
    Delete,
}

impl QueryAction {
    /// The wire discriminant of this action.
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }
}

impl TryFrom<u8> for QueryAction {
    type Error = QueryActionError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(QueryActionError(other)),
        }
    }
}

impl Display for QueryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// The per-query outcome a member reports back to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    /// The query was accepted (not necessarily yet committed).
    Ok,
    /// The query terminally failed at this member.
    NotOk,
    /// The query is not applicable to any registration on this member.
    Na,
}

impl Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::NotOk => f.write_str("not-ok"),
            Self::Na => f.write_str("na"),
        }
    }
}

/// The completion status of one asynchronous KV operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The engine applied the operation.
    Success,
    /// The engine rejected or failed the operation.
    Failure,
}

impl Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// What the completion consumer wants done with a finished KV operation.
///
/// `Done` is the only disposition produced today; `Defer` is reserved for
/// multi-step completion protocols and must be accepted (as a logged no-op)
/// by the plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyDisposition {
    /// The completion has been fully consumed.
    Done,
    /// Reserved: the completion needs a further processing step.
    Defer,
}

/// The lifecycle state of the member's bus connection.
///
/// States are ordered: `Init < RegnComplete < Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusState {
    /// Connected, initial registrations not yet announced.
    Init,
    /// Initial registration exchange with the router is complete;
    /// applications should perform their registrations now.
    RegnComplete,
    /// Fully joined, queries are being routed to this member.
    Run,
}

impl Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::RegnComplete => f.write_str("regn-complete"),
            Self::Run => f.write_str("run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn query_action_wire_round_trip() {
        for action in [QueryAction::Create, QueryAction::Update, QueryAction::Delete] {
            assert_eq!(QueryAction::try_from(action.wire_value()).unwrap(), action);
        }
    }

    #[test]
    fn query_action_rejects_invalid_discriminants() {
        assert_matches!(QueryAction::try_from(0), Err(QueryActionError(0)));
        assert_matches!(QueryAction::try_from(42), Err(QueryActionError(42)));
    }

    #[test]
    fn bus_states_are_ordered() {
        assert!(BusState::Init < BusState::RegnComplete);
        assert!(BusState::RegnComplete < BusState::Run);
    }
}
