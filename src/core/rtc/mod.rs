//! RTC backend seam.
//!
//! The signaling state machine drives connection establishment through these
//! traits instead of touching a concrete RTC stack. [`webrtc::WebRtcFactory`]
//! is the production backend; [`memory::MemoryHub`] links peers in-process
//! for tests.
//!
//! Backends push everything asynchronous — locally gathered candidates,
//! channel readiness, inbound frames, closure — into an [`RtcEvent`] channel
//! handed over at construction. The session task is the only consumer.

pub mod memory;
pub mod webrtc;

use crate::core::protocol::{IceCandidate, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One frame received on the data channel, in its native type.
#[derive(Debug, Clone)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

/// Asynchronous notifications from a backend connection.
#[derive(Clone)]
pub enum RtcEvent {
    /// A locally gathered ICE candidate, ready to relay to the peer.
    LocalCandidate(IceCandidate),
    /// The data channel is open; the handle sends frames to the peer.
    ChannelOpen(Arc<dyn ChannelHandle>),
    /// One inbound frame.
    Frame(ChannelFrame),
    /// The channel closed; the session is torn down.
    ChannelClosed,
}

impl std::fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen(_) => f.write_str("ChannelOpen"),
            Self::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Send half of an open data channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_binary(&self, bytes: Bytes) -> Result<()>;
}

/// One peer connection, from the engine's point of view.
///
/// The engine owns all protocol decisions — what is applied, what is queued,
/// what is idempotent. A connector only executes them.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create the local data channel and produce an offer description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce an answer description. Valid after the remote offer has been
    /// applied.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the peer's description. The engine guarantees this is called at
    /// most once per connection.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Add one remote ICE candidate. The engine only calls this after the
    /// remote description has been applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear the connection down.
    async fn close(&self) -> Result<()>;
}

/// Creates backend connections on demand, one per peer session.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnector>>;
}
