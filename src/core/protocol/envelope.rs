//! Control messages exchanged over the data channel.
//!
//! Every non-binary message is one JSON envelope `{event, payload}`. The
//! event names are the protocol's wire vocabulary; the payload shape is
//! fixed per event. [`ControlMessage`] models the envelope as an exhaustive
//! sum type, decoded exactly once at the channel boundary — code past the
//! multiplexer never touches raw JSON.
//!
//! Field names on the wire are camelCase (`requestId`, `recvBytes`); Rust
//! field names are snake_case with serde renames.

use crate::core::provider::DirectoryListing;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One control envelope.
///
/// Serializes as `{"event": "<name>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ControlMessage {
    /// Enumerate all roots the peer shares.
    #[serde(rename = "directory.list.request", rename_all = "camelCase")]
    DirectoryListRequest { request_id: Uuid },

    /// All shared roots, one single-level listing each.
    #[serde(rename = "directory.list.response", rename_all = "camelCase")]
    DirectoryListResponse {
        request_id: Uuid,
        directories: Vec<DirectoryListing>,
    },

    /// Enumerate one subdirectory by hierarchy path.
    #[serde(rename = "directory.get.request", rename_all = "camelCase")]
    DirectoryGetRequest { request_id: Uuid, path: Vec<String> },

    /// The listing at the requested path, absent when the path resolves to
    /// nothing.
    #[serde(rename = "directory.get.response", rename_all = "camelCase")]
    DirectoryGetResponse {
        request_id: Uuid,
        directory: Option<DirectoryListing>,
    },

    /// Ask the peer for a file's content. Opens the negotiation: the
    /// requester proposes a chunk size, the responder may only shrink it.
    #[serde(rename = "file.get.request", rename_all = "camelCase")]
    FileGetRequest {
        request_id: Uuid,
        path: Vec<String>,
        requested_chunk_size: usize,
    },

    /// File metadata plus the negotiated chunk size. Sent by the responder
    /// after it has registered its own outgoing-transfer bookkeeping.
    #[serde(rename = "file.get.response", rename_all = "camelCase")]
    FileGetResponse {
        request_id: Uuid,
        name: String,
        size: u64,
        chunk_size: usize,
    },

    /// Credit grant: the receiver has persisted `recv_bytes` bytes and
    /// authorizes exactly one more chunk.
    #[serde(rename = "file.transfer.proceed", rename_all = "camelCase")]
    TransferProceed { request_id: Uuid, recv_bytes: u64 },

    /// Completion handshake: the sender has nothing left to send; the
    /// receiver closes its write target on receipt.
    #[serde(rename = "file.transfer.complete", rename_all = "camelCase")]
    TransferComplete { request_id: Uuid },
}

impl ControlMessage {
    /// The wire event name, for diagnostics.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::DirectoryListRequest { .. } => "directory.list.request",
            Self::DirectoryListResponse { .. } => "directory.list.response",
            Self::DirectoryGetRequest { .. } => "directory.get.request",
            Self::DirectoryGetResponse { .. } => "directory.get.response",
            Self::FileGetRequest { .. } => "file.get.request",
            Self::FileGetResponse { .. } => "file.get.response",
            Self::TransferProceed { .. } => "file.transfer.proceed",
            Self::TransferComplete { .. } => "file.transfer.complete",
        }
    }
}
