//! Typed protocol errors.
//!
//! None of these ever reach the host application as a failure: every case
//! degrades at the boundary to a log line and a dropped message. The typed
//! enum exists so tests can assert on the exact failure class instead of
//! matching log output.

use thiserror::Error;
use uuid::Uuid;

/// Failure classes of the peer protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed control JSON on the channel or the relay.
    #[error("malformed control envelope")]
    Parse(#[from] serde_json::Error),

    /// A binary frame whose header region does not decode to a request id.
    #[error("unreadable chunk header in a {0}-byte frame")]
    Header(usize),

    /// A chunk or control message references a request id with no live record.
    #[error("unknown correlation token {0}")]
    UnknownCorrelation(Uuid),

    /// A response whose request id was superseded by a newer query of the
    /// same class. Expected behavior, not a failure.
    #[error("stale response for superseded request {0}")]
    StaleResponse(Uuid),

    /// An operation invalid in the session's current signaling state,
    /// e.g. a second remote description.
    #[error("signaling state violation: {0}")]
    StateViolation(&'static str),

    /// An operation referencing a peer id with no session.
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}
