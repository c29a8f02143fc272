//! Relay-side signaling messages.
//!
//! Everything crossing the relay is the same `{event, payload}` envelope as
//! the data channel, but with its own vocabulary: `peerconnection` carries
//! offer/answer/candidate details between two peers, `details` announces the
//! local user. Room membership commands use the relay's `{action, payload}`
//! shape.
//!
//! The relay rewrites `target` on delivery: a sender addresses the envelope
//! to the remote peer's id, and the receiver observes the *sender's* id in
//! the same field.

use serde::{Deserialize, Serialize};

// ── SDP / ICE values ─────────────────────────────────────────────────────────

/// Which half of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A connection description produced or consumed by the RTC backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One ICE candidate, in the browser's `candidate.toJSON()` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

// ── Signal payloads ──────────────────────────────────────────────────────────

/// The `details` field of a `peerconnection` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalDetail {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl SignalDetail {
    /// Lift an offer/answer detail into a [`SessionDescription`].
    pub fn into_description(self) -> Option<SessionDescription> {
        match self {
            Self::Offer { sdp } => Some(SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            }),
            Self::Answer { sdp } => Some(SessionDescription {
                kind: SdpKind::Answer,
                sdp,
            }),
            Self::Candidate(_) => None,
        }
    }

    /// Wrap a local description for relay.
    pub fn from_description(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Self::Offer { sdp: desc.sdp },
            SdpKind::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

/// One peer-to-peer signal routed through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSignal {
    /// Remote peer id on send; sender's id on receive (relay-rewritten).
    pub target: String,
    pub details: SignalDetail,
}

// ── Relay envelopes ──────────────────────────────────────────────────────────

/// Messages exchanged with the relay in the `{event, payload}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum RelayMessage {
    /// Offer/answer/candidate exchange between two peers.
    #[serde(rename = "peerconnection")]
    PeerConnection(PeerSignal),

    /// Local user announcement (display name shown in the peer list).
    #[serde(rename = "details")]
    Details { name: String },
}

/// Room membership commands, in the relay's `{action, payload}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum RelayCommand {
    #[serde(rename = "join-room")]
    JoinRoom { room: String },
    #[serde(rename = "leave-room")]
    LeaveRoom,
}
