//! Per-peer session actor.
//!
//! One task per peer owns everything mutable about that peer: the signaling
//! machine, the transfer flow, and the channel handle. Commands arrive from
//! the registry, backend notifications arrive from the RTC event channel,
//! and everything leaving the session — relay signals, staleness-checked
//! responses, app events — goes back through the registry as a
//! [`SessionEvent`]. Single task, single writer: no locks around session
//! state.

use crate::core::channel::{self, InboundMessage};
use crate::core::config::{EngineConfig, LIVENESS_PROBE};
use crate::core::directory::DirectoryExchange;
use crate::core::error::ProtocolError;
use crate::core::events::EngineEvent;
use crate::core::protocol::{ControlMessage, SignalDetail};
use crate::core::provider::{DirectoryListing, FileProvider};
use crate::core::rtc::{ChannelHandle, ConnectorFactory, RtcEvent};
use crate::core::signaling::{SessionRole, SignalingMachine};
use crate::core::transfer::{FlowOutcome, FlowReply, TransferFlow};
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Messages ─────────────────────────────────────────────────────────────────

/// Instructions from the registry to one session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Create the local channel and offer (initiator sessions only).
    Initiate,
    /// A relay-routed offer, answer or candidate from this peer.
    Signal(SignalDetail),
    /// Ask the peer for its shared roots.
    RequestDirectories { request_id: Uuid },
    /// Ask the peer for one subdirectory.
    RequestDirectory { request_id: Uuid, path: Vec<String> },
    /// Ask the peer for a file's content.
    RequestFile { request_id: Uuid, path: Vec<String> },
    /// A registry-approved `file.get.response`: open the write target and
    /// grant the first credit.
    BeginIncoming {
        request_id: Uuid,
        name: String,
        size: u64,
        chunk_size: usize,
    },
    /// Tear the session down.
    Close,
}

/// Notifications from a session back to the registry.
#[derive(Debug)]
pub enum SessionEvent {
    /// A local description or candidate ready for relay to this peer.
    Signal { peer_id: String, detail: SignalDetail },
    /// The channel opened.
    Connected { peer_id: String, initiated: bool },
    /// The channel closed; the session task is gone.
    Closed { peer_id: String },
    /// Response to one of our directory.list requests (staleness-checked by
    /// the registry before it reaches the app).
    DirectoryList {
        peer_id: String,
        request_id: Uuid,
        directories: Vec<DirectoryListing>,
    },
    /// Response to one of our directory.get requests.
    DirectoryContent {
        peer_id: String,
        request_id: Uuid,
        directory: Option<DirectoryListing>,
    },
    /// Response to one of our file.get requests. The registry decides
    /// whether it is still live before the transfer starts.
    FileOffer {
        peer_id: String,
        request_id: Uuid,
        name: String,
        size: u64,
        chunk_size: usize,
    },
    /// Pass-through app event (progress, completion, readiness).
    App(EngineEvent),
}

/// Send half of one session's command channel.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }
}

// ── Spawn ────────────────────────────────────────────────────────────────────

/// Spawn the actor task for one peer and return its command handle.
pub fn spawn(
    peer_id: String,
    role: SessionRole,
    factory: Arc<dyn ConnectorFactory>,
    provider: Arc<dyn FileProvider>,
    config: &EngineConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    sos: SignalOfStop,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let max_chunk_size = config.max_chunk_size;
    let rate_weight = config.rate_weight;

    tokio::spawn(async move {
        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
        let connector = match factory.create(&peer_id, rtc_tx).await {
            Ok(c) => c,
            Err(e) => {
                warn!(event = "connector_create_failure", peer = %peer_id, %e, "Could not create backend connection");
                let _ = events.send(SessionEvent::Closed { peer_id });
                return;
            }
        };

        let mut session = PeerSession {
            peer_id: peer_id.clone(),
            machine: SignalingMachine::new(&peer_id, role, connector),
            transfers: TransferFlow::new(&peer_id, provider.clone(), max_chunk_size, rate_weight),
            directory: DirectoryExchange::new(&peer_id, provider),
            channel: None,
            events,
        };
        session.run(command_rx, rtc_rx, sos).await;
    });

    SessionHandle {
        commands: command_tx,
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

struct PeerSession {
    peer_id: String,
    machine: SignalingMachine,
    transfers: TransferFlow,
    directory: DirectoryExchange,
    channel: Option<Arc<dyn ChannelHandle>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerSession {
    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut rtc: mpsc::UnboundedReceiver<RtcEvent>,
        sos: SignalOfStop,
    ) {
        loop {
            tokio::select! {
                _ = sos.wait() => {
                    self.teardown().await;
                    break;
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Close) | None => {
                            self.teardown().await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = rtc.recv() => {
                    match event {
                        Some(RtcEvent::ChannelClosed) | None => {
                            info!(event = "session_channel_closed", peer = %self.peer_id, "Channel closed, destroying session");
                            self.teardown().await;
                            let _ = self.events.send(SessionEvent::Closed {
                                peer_id: self.peer_id.clone(),
                            });
                            break;
                        }
                        Some(event) => self.handle_rtc_event(event).await,
                    }
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.transfers.abort_all().await;
        self.machine.close().await;
        self.channel = None;
    }

    // ── Registry commands ────────────────────────────────────────────────

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Initiate => match self.machine.initiate().await {
                Ok(Some(detail)) => self.emit_signal(detail),
                Ok(None) => {}
                Err(e) => {
                    warn!(event = "initiate_failure", peer = %self.peer_id, %e, "Offer creation failed")
                }
            },

            SessionCommand::Signal(detail) => self.handle_signal(detail).await,

            SessionCommand::RequestDirectories { request_id } => {
                self.send_control(&ControlMessage::DirectoryListRequest { request_id })
                    .await;
            }

            SessionCommand::RequestDirectory { request_id, path } => {
                self.send_control(&ControlMessage::DirectoryGetRequest { request_id, path })
                    .await;
            }

            SessionCommand::RequestFile { request_id, path } => {
                let request = self.transfers.request_file(request_id, path);
                self.send_control(&request).await;
            }

            SessionCommand::BeginIncoming {
                request_id,
                name,
                size,
                chunk_size,
            } => {
                match self
                    .transfers
                    .handle_file_response(request_id, name, size, chunk_size)
                    .await
                {
                    Ok(Some(outcome)) => self.apply_outcome(outcome).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(event = "incoming_prepare_failure", peer = %self.peer_id, request_id = %request_id, %e, "Could not prepare incoming transfer")
                    }
                }
            }

            SessionCommand::Close => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_signal(&mut self, detail: SignalDetail) {
        match detail {
            SignalDetail::Offer { .. } => {
                let desc = detail.into_description().expect("offer is a description");
                match self.machine.handle_remote_offer(desc).await {
                    Ok(Some(answer)) => self.emit_signal(answer),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(event = "remote_offer_failure", peer = %self.peer_id, %e, "Rejected remote offer")
                    }
                }
            }
            SignalDetail::Answer { .. } => {
                let desc = detail.into_description().expect("answer is a description");
                if let Err(e) = self.machine.handle_remote_answer(desc).await {
                    warn!(event = "remote_answer_failure", peer = %self.peer_id, %e, "Rejected remote answer");
                }
            }
            SignalDetail::Candidate(candidate) => {
                if let Err(e) = self.machine.add_remote_candidate(candidate).await {
                    warn!(event = "remote_candidate_failure", peer = %self.peer_id, %e, "Dropped remote candidate");
                }
            }
        }
    }

    // ── Backend events ───────────────────────────────────────────────────

    async fn handle_rtc_event(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::LocalCandidate(candidate) => {
                self.emit_signal(SignalDetail::Candidate(candidate));
            }

            RtcEvent::ChannelOpen(handle) => {
                self.channel = Some(handle);
                if self.machine.channel_opened() {
                    info!(
                        event = "session_connected",
                        peer = %self.peer_id,
                        initiated = self.machine.is_initiator(),
                        "Data channel open"
                    );
                    // Probe first; the remote multiplexer swallows it.
                    self.send_text(LIVENESS_PROBE.to_string()).await;
                    let _ = self.events.send(SessionEvent::Connected {
                        peer_id: self.peer_id.clone(),
                        initiated: self.machine.is_initiator(),
                    });
                }
            }

            RtcEvent::Frame(frame) => {
                let message = match channel::decode(frame) {
                    Ok(message) => message,
                    // The liveness probe and any garbage land here; parse
                    // failures fire no event by design.
                    Err(ProtocolError::Parse(_)) => return,
                    Err(e) => {
                        debug!(event = "frame_dropped", peer = %self.peer_id, %e, "Dropping undecodable frame");
                        return;
                    }
                };
                match message {
                    InboundMessage::Control(msg) => self.handle_control(msg).await,
                    InboundMessage::Chunk {
                        request_id,
                        payload,
                    } => {
                        match self.transfers.handle_chunk(request_id, payload).await {
                            Ok(Some(outcome)) => self.apply_outcome(outcome).await,
                            Ok(None) => {}
                            Err(e) => {
                                warn!(event = "chunk_persist_failure", peer = %self.peer_id, request_id = %request_id, %e, "Could not persist chunk")
                            }
                        }
                    }
                }
            }

            RtcEvent::ChannelClosed => unreachable!("handled by the run loop"),
        }
    }

    // ── Control dispatch ─────────────────────────────────────────────────

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            // Queries we answer locally.
            ControlMessage::DirectoryListRequest { request_id } => {
                match self.directory.handle_list_request(request_id).await {
                    Ok(response) => self.send_control(&response).await,
                    Err(e) => {
                        warn!(event = "directory_list_failure", peer = %self.peer_id, %e, "Could not serve directory list")
                    }
                }
            }
            ControlMessage::DirectoryGetRequest { request_id, path } => {
                match self.directory.handle_get_request(request_id, path).await {
                    Ok(response) => self.send_control(&response).await,
                    Err(e) => {
                        warn!(event = "directory_get_failure", peer = %self.peer_id, %e, "Could not serve directory")
                    }
                }
            }
            ControlMessage::FileGetRequest {
                request_id,
                path,
                requested_chunk_size,
            } => {
                match self
                    .transfers
                    .handle_file_request(request_id, path, requested_chunk_size)
                    .await
                {
                    Ok(Some(outcome)) => self.apply_outcome(outcome).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(event = "file_request_failure", peer = %self.peer_id, request_id = %request_id, %e, "Could not serve file request")
                    }
                }
            }

            // Responses to our queries: the registry decides staleness.
            ControlMessage::DirectoryListResponse {
                request_id,
                directories,
            } => {
                let _ = self.events.send(SessionEvent::DirectoryList {
                    peer_id: self.peer_id.clone(),
                    request_id,
                    directories,
                });
            }
            ControlMessage::DirectoryGetResponse {
                request_id,
                directory,
            } => {
                let _ = self.events.send(SessionEvent::DirectoryContent {
                    peer_id: self.peer_id.clone(),
                    request_id,
                    directory,
                });
            }
            ControlMessage::FileGetResponse {
                request_id,
                name,
                size,
                chunk_size,
            } => {
                let _ = self.events.send(SessionEvent::FileOffer {
                    peer_id: self.peer_id.clone(),
                    request_id,
                    name,
                    size,
                    chunk_size,
                });
            }

            // Flow control.
            ControlMessage::TransferProceed {
                request_id,
                recv_bytes,
            } => match self.transfers.handle_proceed(request_id, recv_bytes).await {
                Ok(Some(outcome)) => self.apply_outcome(outcome).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(event = "proceed_failure", peer = %self.peer_id, request_id = %request_id, %e, "Could not serve credit grant")
                }
            },
            ControlMessage::TransferComplete { request_id } => {
                match self.transfers.handle_complete(request_id).await {
                    Ok(Some(outcome)) => self.apply_outcome(outcome).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(event = "finalize_failure", peer = %self.peer_id, request_id = %request_id, %e, "Could not finalize incoming transfer")
                    }
                }
            }
        }
    }

    // ── Output ───────────────────────────────────────────────────────────

    async fn apply_outcome(&mut self, outcome: FlowOutcome) {
        for reply in outcome.replies {
            match reply {
                FlowReply::Control(msg) => self.send_control(&msg).await,
                FlowReply::Chunk(frame) => {
                    if let Some(channel) = &self.channel {
                        if let Err(e) = channel.send_binary(frame).await {
                            warn!(event = "chunk_send_failure", peer = %self.peer_id, %e, "Could not transmit chunk");
                        }
                    } else {
                        debug!(event = "chunk_without_channel", peer = %self.peer_id, "Dropping chunk: channel not open");
                    }
                }
            }
        }
        for event in outcome.events {
            let _ = self.events.send(SessionEvent::App(event));
        }
    }

    async fn send_control(&mut self, msg: &ControlMessage) {
        match channel::encode_control(msg) {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                warn!(event = "control_encode_failure", peer = %self.peer_id, %e, "Could not encode control message")
            }
        }
    }

    async fn send_text(&mut self, text: String) {
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send_text(text).await {
                warn!(event = "control_send_failure", peer = %self.peer_id, %e, "Could not transmit control message");
            }
        } else {
            debug!(event = "control_without_channel", peer = %self.peer_id, "Dropping control message: channel not open");
        }
    }

    fn emit_signal(&self, detail: SignalDetail) {
        let _ = self.events.send(SessionEvent::Signal {
            peer_id: self.peer_id.clone(),
            detail,
        });
    }
}
