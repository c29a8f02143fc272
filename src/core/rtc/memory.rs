//! In-process loopback backend.
//!
//! A [`MemoryHub`] links pairs of peers living in the same process: frames
//! sent on one end surface as [`RtcEvent::Frame`] on the other, with no
//! network, SDP parsing or ICE underneath. Descriptions are opaque markers;
//! the channel opens on both ends once each side has applied the other's
//! description — the same observable ordering as the production backend.
//!
//! Applied candidates are recorded per end so tests can assert on queueing
//! order and exactly-once replay.

use super::{ChannelFrame, ChannelHandle, ConnectorFactory, PeerConnector, RtcEvent};
use crate::core::protocol::{IceCandidate, SdpKind, SessionDescription};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Unordered pair key for one peer link.
fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Default)]
struct EndState {
    events: Option<mpsc::UnboundedSender<RtcEvent>>,
    remote_description_applied: bool,
    applied_candidates: Vec<IceCandidate>,
    opened: bool,
}

#[derive(Default)]
struct LinkState {
    ends: HashMap<String, EndState>,
}

/// Hub linking in-process peers. Clone-cheap; all clones share the links.
#[derive(Clone, Default)]
pub struct MemoryHub {
    links: Arc<Mutex<HashMap<(String, String), LinkState>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector factory bound to one local peer id.
    pub fn endpoint(&self, local_id: &str) -> MemoryEndpoint {
        MemoryEndpoint {
            hub: self.clone(),
            local_id: local_id.to_string(),
        }
    }

    /// Candidates `local` has applied toward `remote`, in application order.
    pub fn applied_candidates(&self, local: &str, remote: &str) -> Vec<IceCandidate> {
        let links = self.links.lock().unwrap();
        links
            .get(&link_key(local, remote))
            .and_then(|link| link.ends.get(local))
            .map(|end| end.applied_candidates.clone())
            .unwrap_or_default()
    }

    /// Open both ends of a link once each side has the other's description.
    fn maybe_open(&self, local: &str, remote: &str) {
        let mut links = self.links.lock().unwrap();
        let Some(link) = links.get_mut(&link_key(local, remote)) else {
            return;
        };

        let both_applied = [local, remote].iter().all(|id| {
            link.ends
                .get(*id)
                .map(|e| e.remote_description_applied)
                .unwrap_or(false)
        });
        if !both_applied {
            return;
        }

        for (this_end, other_end) in [(local, remote), (remote, local)] {
            let peer_events = link.ends.get(other_end).and_then(|e| e.events.clone());
            let Some(end) = link.ends.get_mut(this_end) else {
                continue;
            };
            if end.opened {
                continue;
            }
            if let (Some(events), Some(peer_events)) = (end.events.clone(), peer_events) {
                end.opened = true;
                let handle: Arc<dyn ChannelHandle> = Arc::new(MemoryChannel { peer_events });
                let _ = events.send(RtcEvent::ChannelOpen(handle));
            }
        }
    }
}

/// Factory creating [`MemoryConnector`]s for one local peer.
pub struct MemoryEndpoint {
    hub: MemoryHub,
    local_id: String,
}

#[async_trait]
impl ConnectorFactory for MemoryEndpoint {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Result<Arc<dyn PeerConnector>> {
        {
            let mut links = self.hub.links.lock().unwrap();
            let link = links.entry(link_key(&self.local_id, peer_id)).or_default();
            let end = link.ends.entry(self.local_id.clone()).or_default();
            end.events = Some(events);
        }
        Ok(Arc::new(MemoryConnector {
            hub: self.hub.clone(),
            local_id: self.local_id.clone(),
            remote_id: peer_id.to_string(),
        }))
    }
}

/// One end of an in-process link.
pub struct MemoryConnector {
    hub: MemoryHub,
    local_id: String,
    remote_id: String,
}

impl MemoryConnector {
    fn with_end<R>(&self, f: impl FnOnce(&mut EndState) -> R) -> Result<R> {
        let mut links = self.hub.links.lock().unwrap();
        let link = links
            .get_mut(&link_key(&self.local_id, &self.remote_id))
            .ok_or_else(|| anyhow!("link vanished"))?;
        let end = link
            .ends
            .get_mut(&self.local_id)
            .ok_or_else(|| anyhow!("end not registered"))?;
        Ok(f(end))
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("memory-offer from {}", self.local_id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("memory-answer from {}", self.local_id),
        })
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.with_end(|end| end.remote_description_applied = true)?;
        self.hub.maybe_open(&self.local_id, &self.remote_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.with_end(|end| {
            if !end.remote_description_applied {
                return Err(anyhow!("candidate before remote description"));
            }
            end.applied_candidates.push(candidate);
            Ok(())
        })?
    }

    async fn close(&self) -> Result<()> {
        let mut links = self.hub.links.lock().unwrap();
        if let Some(link) = links.remove(&link_key(&self.local_id, &self.remote_id)) {
            for end in link.ends.values() {
                if let Some(events) = &end.events {
                    let _ = events.send(RtcEvent::ChannelClosed);
                }
            }
        }
        Ok(())
    }
}

/// Send half: frames surface as events on the opposite end.
struct MemoryChannel {
    peer_events: mpsc::UnboundedSender<RtcEvent>,
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    async fn send_text(&self, text: String) -> Result<()> {
        self.peer_events
            .send(RtcEvent::Frame(ChannelFrame::Text(text)))
            .map_err(|_| anyhow!("peer end closed"))
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<()> {
        self.peer_events
            .send(RtcEvent::Frame(ChannelFrame::Binary(bytes)))
            .map_err(|_| anyhow!("peer end closed"))
    }
}
