//! Production RTC backend over webrtc-rs.
//!
//! One `RTCPeerConnection` per peer, one data channel labelled
//! [`CHANNEL_LABEL`]. Candidates trickle: they are pushed to the session as
//! they are gathered and relayed individually, mirroring the browser client
//! this protocol interoperates with.

use super::{ChannelFrame, ChannelHandle, ConnectorFactory, PeerConnector, RtcEvent};
use crate::core::config::CHANNEL_LABEL;
use crate::core::protocol::{IceCandidate, SdpKind, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Connector factory for real WebRTC connections.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl ConnectorFactory for WebRtcFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnector>> {
        let connector = WebRtcConnector::open(peer_id, &self.ice_servers, events).await?;
        Ok(Arc::new(connector))
    }
}

/// One WebRTC peer connection.
pub struct WebRtcConnector {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<RtcEvent>,
}

impl WebRtcConnector {
    async fn open(
        peer_id: &str,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        // Trickle locally gathered candidates to the session for relay.
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(RtcEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => debug!(event = "candidate_serialize_failure", %e, "Skipping candidate"),
                }
            })
        }));

        let peer = peer_id.to_string();
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer.clone();
            let events = state_events.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "rtc_connected", peer = %peer, "Peer connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        warn!(event = "rtc_failed", peer = %peer, "Peer connection failed");
                        let _ = events.send(RtcEvent::ChannelClosed);
                    }
                    other => {
                        debug!(event = "rtc_state_change", peer = %peer, state = ?other, "Connection state changed");
                    }
                }
            })
        }));

        // Responder side: the initiator-created channel arrives here.
        let dc_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = dc_events.clone();
            Box::pin(async move {
                debug!(event = "data_channel_received", label = %dc.label(), "Remote data channel received");
                wire_channel(&dc, events);
            })
        }));

        Ok(Self { pc, events })
    }
}

/// Attach open/message/close handlers, surfacing everything as [`RtcEvent`]s.
fn wire_channel(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<RtcEvent>) {
    let open_events = events.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let handle: Arc<dyn ChannelHandle> = Arc::new(WebRtcChannel {
            dc: open_dc.clone(),
        });
        let _ = open_events.send(RtcEvent::ChannelOpen(handle));
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelFrame::Text(text),
                    Err(_) => return,
                }
            } else {
                ChannelFrame::Binary(msg.data)
            };
            let _ = events.send(RtcEvent::Frame(frame));
        })
    }));

    let close_events = events;
    dc.on_close(Box::new(move || {
        let _ = close_events.send(RtcEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let dc = self.pc.create_data_channel(CHANNEL_LABEL, None).await?;
        wire_channel(&dc, self.events.clone());

        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Send half over one `RTCDataChannel`.
struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChannelHandle for WebRtcChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<()> {
        self.dc.send(&bytes).await?;
        Ok(())
    }
}
