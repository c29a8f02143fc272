//! Signaling relay boundary.
//!
//! The relay is a thin message forwarder: it never inspects payloads beyond
//! routing `peerconnection` envelopes to their target. The engine only needs
//! [`SignalingTransport::send`]; inbound signals are delivered to whoever
//! holds the receiver returned by the concrete transport and fed to
//! [`crate::core::registry::PeerRegistry::handle_relay_signal`].
//!
//! [`WsRelay`] is the production client: one WebSocket, a writer task
//! draining an outbound queue, a reader task decoding `{event, payload}`
//! envelopes. Anything that does not decode is dropped silently.

use crate::core::protocol::{PeerSignal, RelayCommand, RelayMessage};
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Send half of the signaling relay.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: RelayMessage) -> Result<()>;
}

/// WebSocket relay client.
pub struct WsRelay {
    outbound: mpsc::UnboundedSender<Message>,
}

impl WsRelay {
    /// Connect and spawn the reader/writer tasks. Returns the client and the
    /// stream of inbound peer signals.
    pub async fn connect(
        url: &str,
        sos: SignalOfStop,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerSignal>)> {
        let (stream, _) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();
        info!(event = "relay_connected", url = %url, "Signaling relay connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_sos = sos.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_sos.wait() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = write.send(message).await {
                            warn!(event = "relay_write_failure", %e, "Relay write failed, stopping writer");
                            break;
                        }
                    }
                }
            }
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sos.wait() => break,
                    frame = read.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<RelayMessage>(text.as_str()) {
                                    Ok(RelayMessage::PeerConnection(signal)) => {
                                        if inbound_tx.send(signal).is_err() {
                                            break;
                                        }
                                    }
                                    Ok(other) => {
                                        debug!(event = "relay_message_ignored", message = ?other, "Non-signaling relay message");
                                    }
                                    // Malformed envelopes are dropped without effect.
                                    Err(_) => {}
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(event = "relay_read_failure", %e, "Relay read failed, stopping reader");
                                break;
                            }
                            None => {
                                info!(event = "relay_closed", "Relay closed the connection");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok((Self { outbound }, inbound_rx))
    }

    fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow::anyhow!("relay writer gone"))
    }

    /// Join a relay room; the relay scopes peer discovery to room members.
    pub fn join_room(&self, room: &str) -> Result<()> {
        self.send_json(&RelayCommand::JoinRoom {
            room: room.to_string(),
        })
    }

    /// Leave the current room.
    pub fn leave_room(&self) -> Result<()> {
        self.send_json(&RelayCommand::LeaveRoom)
    }

    /// Announce the local display name to the room.
    pub fn announce(&self, name: &str) -> Result<()> {
        self.send_json(&RelayMessage::Details {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl SignalingTransport for WsRelay {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        self.send_json(&message)
    }
}
