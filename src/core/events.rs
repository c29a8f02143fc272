//! App-facing engine events.
//!
//! Everything the host application learns from the engine arrives as one of
//! these, delivered on an unbounded channel. No failure of the peer protocol
//! ever surfaces here — failed or stale messages degrade to log lines.

use crate::core::provider::DirectoryListing;
use crate::core::transfer::ProgressSnapshot;
use uuid::Uuid;

/// Direction of a transfer, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// Notifications from the engine to the host application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A data channel opened. `initiated` tells which side dialled; only the
    /// initiator issues the first directory query.
    PeerConnected { peer_id: String, initiated: bool },

    /// The channel closed; the session and its transfers are gone.
    PeerDisconnected { peer_id: String },

    /// A peer answered our directory.list request.
    DirectoryList {
        peer_id: String,
        request_id: Uuid,
        directories: Vec<DirectoryListing>,
    },

    /// A peer answered our directory.get request. `None` when the path
    /// resolved to nothing on their side.
    DirectoryContent {
        peer_id: String,
        request_id: Uuid,
        directory: Option<DirectoryListing>,
    },

    /// An incoming transfer was negotiated and its write target opened.
    IncomingFileReady {
        peer_id: String,
        request_id: Uuid,
        name: String,
        size: u64,
    },

    /// Byte-counter progress for one transfer, one update per chunk.
    TransferProgress {
        peer_id: String,
        request_id: Uuid,
        direction: TransferDirection,
        snapshot: ProgressSnapshot,
    },

    /// The completion handshake closed an incoming file.
    IncomingFileComplete {
        peer_id: String,
        request_id: Uuid,
        name: String,
    },

    /// The last chunk of an outgoing transfer was acknowledged.
    OutgoingFileComplete {
        peer_id: String,
        request_id: Uuid,
        name: String,
    },
}
