//! Per-peer signaling state machine.
//!
//! Owns everything about connection establishment that the RTC backend does
//! not: which side initiated, whether the remote description has been
//! applied, and the FIFO queue of candidates that arrived too early.
//! Malformed or rejected descriptions are logged and dropped — the session
//! simply never reaches `Connected`; there is no retry and no automatic
//! reconnection.

use crate::core::error::ProtocolError;
use crate::core::protocol::{IceCandidate, SessionDescription, SignalDetail};
use crate::core::rtc::PeerConnector;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Signaling progress of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    HasLocalOffer,
    HasRemoteOffer,
    Connected,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::HasLocalOffer => write!(f, "has-local-offer"),
            Self::HasRemoteOffer => write!(f, "has-remote-offer"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Offer/answer/candidate machine for one peer.
pub struct SignalingMachine {
    peer_id: String,
    role: SessionRole,
    state: SignalingState,
    remote_description_applied: bool,
    /// Candidates received before the remote description, replayed FIFO
    /// exactly once when it lands.
    pending_candidates: VecDeque<IceCandidate>,
    connector: Arc<dyn PeerConnector>,
}

impl SignalingMachine {
    pub fn new(peer_id: &str, role: SessionRole, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role,
            state: SignalingState::New,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            connector,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_initiator(&self) -> bool {
        self.role == SessionRole::Initiator
    }

    /// Create the local channel and offer. Valid only from `New`; anywhere
    /// else it is a guarded no-op.
    pub async fn initiate(&mut self) -> Result<Option<SignalDetail>> {
        if self.state != SignalingState::New {
            let e = ProtocolError::StateViolation("initiate is valid only from New");
            warn!(event = "initiate_out_of_state", peer = %self.peer_id, state = %self.state, %e, "Ignoring initiate");
            return Ok(None);
        }
        let offer = self.connector.create_offer().await?;
        self.state = SignalingState::HasLocalOffer;
        debug!(event = "local_offer_created", peer = %self.peer_id, "Offer ready for relay");
        Ok(Some(SignalDetail::from_description(offer)))
    }

    /// Apply a remote offer (at most once), replay queued candidates, and
    /// produce an answer for relay. Repeated offers re-answer without
    /// re-applying.
    pub async fn handle_remote_offer(
        &mut self,
        desc: SessionDescription,
    ) -> Result<Option<SignalDetail>> {
        if self.state == SignalingState::Closed {
            return Ok(None);
        }
        if !self.remote_description_applied {
            self.connector.set_remote_description(desc).await?;
            self.remote_description_applied = true;
            self.state = SignalingState::HasRemoteOffer;
            self.flush_pending_candidates().await;
        } else {
            debug!(
                event = "duplicate_remote_offer",
                peer = %self.peer_id,
                "Remote description already applied, re-answering only"
            );
        }
        let answer = self.connector.create_answer().await?;
        Ok(Some(SignalDetail::from_description(answer)))
    }

    /// Apply a remote answer on an initiator session. Idempotent.
    pub async fn handle_remote_answer(&mut self, desc: SessionDescription) -> Result<()> {
        if self.state == SignalingState::Closed {
            return Ok(());
        }
        if self.remote_description_applied {
            debug!(
                event = "duplicate_remote_answer",
                peer = %self.peer_id,
                "Remote description already applied, ignoring"
            );
            return Ok(());
        }
        self.connector.set_remote_description(desc).await?;
        self.remote_description_applied = true;
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply a candidate immediately, or queue it until the remote
    /// description is known.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.remote_description_applied {
            self.connector.add_ice_candidate(candidate).await?;
        } else {
            self.pending_candidates.push_back(candidate);
            debug!(
                event = "candidate_queued",
                peer = %self.peer_id,
                queued = self.pending_candidates.len(),
                "Candidate queued before remote description"
            );
        }
        Ok(())
    }

    /// Replay queued candidates in arrival order, exactly once.
    async fn flush_pending_candidates(&mut self) {
        let queued = std::mem::take(&mut self.pending_candidates);
        let count = queued.len();
        for candidate in queued {
            if let Err(e) = self.connector.add_ice_candidate(candidate).await {
                warn!(event = "candidate_replay_failure", peer = %self.peer_id, %e, "Dropping queued candidate");
            }
        }
        if count > 0 {
            debug!(event = "candidates_replayed", peer = %self.peer_id, count, "Replayed queued candidates");
        }
    }

    /// The data channel opened; move to `Connected`. Returns `true` on the
    /// first transition only.
    pub fn channel_opened(&mut self) -> bool {
        if matches!(self.state, SignalingState::Connected | SignalingState::Closed) {
            return false;
        }
        self.state = SignalingState::Connected;
        true
    }

    /// The channel (or connection) closed; terminal.
    pub fn channel_closed(&mut self) {
        self.state = SignalingState::Closed;
    }

    /// Tear down the backend connection.
    pub async fn close(&mut self) {
        self.state = SignalingState::Closed;
        if let Err(e) = self.connector.close().await {
            debug!(event = "connector_close_failure", peer = %self.peer_id, %e, "Backend close failed");
        }
    }
}
