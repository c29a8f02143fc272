//! Peer session registry.
//!
//! The single writer of the peer-id → session map. Creates sessions on
//! connect attempts and inbound offers (deduplicating both, so
//! near-simultaneous mutual connects cannot race two sessions into
//! existence), routes relay signals to the right session, and filters stale
//! responses: per query class, only the most recently issued request id is
//! live, and responses to superseded requests are discarded without effect.
//!
//! The registry's pump task is also where session events become app events:
//! it relays outbound signals, auto-issues the first directory query on
//! initiator connections, and forwards transfer progress to the host.

use crate::core::config::EngineConfig;
use crate::core::error::ProtocolError;
use crate::core::events::EngineEvent;
use crate::core::protocol::{PeerSignal, RelayMessage, SignalDetail};
use crate::core::provider::FileProvider;
use crate::core::relay::SignalingTransport;
use crate::core::rtc::ConnectorFactory;
use crate::core::session::{self, SessionCommand, SessionEvent, SessionHandle};
use crate::core::signaling::SessionRole;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Staleness filtering ──────────────────────────────────────────────────────

/// The three request/response classes subject to staleness filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryClass {
    DirectoryList,
    DirectoryGet,
    FileGet,
}

/// Tracks the live request id per query class. Issuing a new query
/// supersedes the previous one; responses to superseded ids are discarded.
#[derive(Debug, Default)]
struct StalenessFilter {
    live: HashMap<QueryClass, Uuid>,
}

impl StalenessFilter {
    fn issue(&mut self, class: QueryClass) -> Uuid {
        let request_id = Uuid::new_v4();
        self.live.insert(class, request_id);
        request_id
    }

    fn check(&self, class: QueryClass, request_id: &Uuid) -> Result<(), ProtocolError> {
        if self.live.get(&class) == Some(request_id) {
            Ok(())
        } else {
            Err(ProtocolError::StaleResponse(*request_id))
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

struct RegistryInner {
    sessions: HashMap<String, SessionHandle>,
    staleness: StalenessFilter,
}

/// Point-in-time registry state, exposed for diagnostics instead of any
/// ambient global.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Peer ids with a live session, sorted.
    pub peers: Vec<String>,
    /// Live request id per query class.
    pub live_queries: Vec<(QueryClass, Uuid)>,
}

/// Owns all peer sessions. Clone-cheap; clones share the same state.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    provider: Arc<dyn FileProvider>,
    factory: Arc<dyn ConnectorFactory>,
    relay: Arc<dyn SignalingTransport>,
    config: EngineConfig,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    app_events: mpsc::UnboundedSender<EngineEvent>,
    sos: SignalOfStop,
}

impl PeerRegistry {
    /// Build the registry and spawn its pump task. Must be called inside a
    /// tokio runtime. The returned receiver carries every app-facing event.
    pub fn new(
        provider: Arc<dyn FileProvider>,
        factory: Arc<dyn ConnectorFactory>,
        relay: Arc<dyn SignalingTransport>,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (session_events, session_events_rx) = mpsc::unbounded_channel();
        let (app_events, app_events_rx) = mpsc::unbounded_channel();

        let registry = Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                staleness: StalenessFilter::default(),
            })),
            provider,
            factory,
            relay,
            config,
            session_events,
            app_events,
            sos: SignalOfStop::new(),
        };

        let pump = registry.clone();
        tokio::spawn(async move { pump.run(session_events_rx).await });

        (registry, app_events_rx)
    }

    /// Stop the pump and every session task.
    pub fn shutdown(&self) {
        self.sos.cancel();
        self.inner.lock().unwrap().sessions.clear();
    }

    /// Whether a session exists for `peer_id`.
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.inner.lock().unwrap().sessions.contains_key(peer_id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Point-in-time view of the registry, for diagnostics and metrics.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().unwrap();
        let mut peers: Vec<String> = inner.sessions.keys().cloned().collect();
        peers.sort();
        RegistrySnapshot {
            peers,
            live_queries: inner
                .staleness
                .live
                .iter()
                .map(|(class, id)| (*class, *id))
                .collect(),
        }
    }

    // ── Session creation ─────────────────────────────────────────────────

    fn spawn_session(&self, peer_id: &str, role: SessionRole) -> SessionHandle {
        session::spawn(
            peer_id.to_string(),
            role,
            self.factory.clone(),
            self.provider.clone(),
            &self.config,
            self.session_events.clone(),
            self.sos.clone(),
        )
    }

    /// Dial a peer. No-op when a session already exists.
    pub fn connect(&self, peer_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(peer_id) {
            debug!(event = "connect_deduplicated", peer = %peer_id, "Session already exists");
            return;
        }
        info!(event = "peer_dialling", peer = %peer_id, "Creating initiator session");
        let handle = self.spawn_session(peer_id, SessionRole::Initiator);
        handle.send(SessionCommand::Initiate);
        inner.sessions.insert(peer_id.to_string(), handle);
    }

    /// Route one relay signal. Offers create responder sessions (unless one
    /// exists — competing offers are ignored); answers and candidates for
    /// unknown peers are logged and dropped.
    pub fn handle_relay_signal(&self, signal: PeerSignal) {
        let PeerSignal {
            target: peer_id,
            details,
        } = signal;

        match details {
            SignalDetail::Offer { .. } => {
                let mut inner = self.inner.lock().unwrap();
                if inner.sessions.contains_key(&peer_id) {
                    debug!(event = "competing_offer_ignored", peer = %peer_id, "Session already exists, dropping offer");
                    return;
                }
                info!(event = "peer_answering", peer = %peer_id, "Creating responder session");
                let handle = self.spawn_session(&peer_id, SessionRole::Responder);
                handle.send(SessionCommand::Signal(details));
                inner.sessions.insert(peer_id, handle);
            }
            SignalDetail::Answer { .. } | SignalDetail::Candidate(_) => {
                let inner = self.inner.lock().unwrap();
                match inner.sessions.get(&peer_id) {
                    Some(handle) => handle.send(SessionCommand::Signal(details)),
                    None => {
                        let e = ProtocolError::UnknownPeer(peer_id);
                        warn!(event = "signal_for_unknown_peer", %e, "Dropping signal");
                    }
                }
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn issue_query(
        &self,
        peer_id: &str,
        class: QueryClass,
        build: impl FnOnce(Uuid) -> SessionCommand,
    ) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap();
        let Some(handle) = inner.sessions.get(peer_id) else {
            debug!(event = "query_for_unknown_peer", peer = %peer_id, ?class, "Dropping query: no session");
            return None;
        };
        let handle = handle.clone();
        let request_id = inner.staleness.issue(class);
        handle.send(build(request_id));
        Some(request_id)
    }

    /// Ask a peer for its shared roots. Supersedes any in-flight
    /// directory-list query.
    pub fn request_directories(&self, peer_id: &str) -> Option<Uuid> {
        self.issue_query(peer_id, QueryClass::DirectoryList, |request_id| {
            SessionCommand::RequestDirectories { request_id }
        })
    }

    /// Ask a peer for one subdirectory. Supersedes any in-flight
    /// directory-get query.
    pub fn request_directory(&self, peer_id: &str, path: Vec<String>) -> Option<Uuid> {
        self.issue_query(peer_id, QueryClass::DirectoryGet, |request_id| {
            SessionCommand::RequestDirectory { request_id, path }
        })
    }

    /// Ask a peer for a file. Supersedes any in-flight file-get query; the
    /// transfer starts when the (still live) response arrives.
    pub fn request_file(&self, peer_id: &str, path: Vec<String>) -> Option<Uuid> {
        self.issue_query(peer_id, QueryClass::FileGet, |request_id| {
            SessionCommand::RequestFile { request_id, path }
        })
    }

    // ── Pump ─────────────────────────────────────────────────────────────

    async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            tokio::select! {
                _ = self.sos.wait() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_session_event(event).await;
                }
            }
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Signal { peer_id, detail } => {
                let message = RelayMessage::PeerConnection(PeerSignal {
                    target: peer_id.clone(),
                    details: detail,
                });
                if let Err(e) = self.relay.send(message).await {
                    warn!(event = "relay_send_failure", peer = %peer_id, %e, "Could not relay signal");
                }
            }

            SessionEvent::Connected { peer_id, initiated } => {
                let _ = self.app_events.send(EngineEvent::PeerConnected {
                    peer_id: peer_id.clone(),
                    initiated,
                });
                // Only the initiator opens the conversation, so mutual
                // connects do not double-query.
                if initiated {
                    self.request_directories(&peer_id);
                }
            }

            SessionEvent::Closed { peer_id } => {
                self.inner.lock().unwrap().sessions.remove(&peer_id);
                let _ = self
                    .app_events
                    .send(EngineEvent::PeerDisconnected { peer_id });
            }

            SessionEvent::DirectoryList {
                peer_id,
                request_id,
                directories,
            } => {
                if let Err(e) = self.check_live(QueryClass::DirectoryList, &request_id) {
                    debug!(event = "stale_directory_list", peer = %peer_id, %e, "Discarding superseded response");
                    return;
                }
                let _ = self.app_events.send(EngineEvent::DirectoryList {
                    peer_id,
                    request_id,
                    directories,
                });
            }

            SessionEvent::DirectoryContent {
                peer_id,
                request_id,
                directory,
            } => {
                if let Err(e) = self.check_live(QueryClass::DirectoryGet, &request_id) {
                    debug!(event = "stale_directory_content", peer = %peer_id, %e, "Discarding superseded response");
                    return;
                }
                let _ = self.app_events.send(EngineEvent::DirectoryContent {
                    peer_id,
                    request_id,
                    directory,
                });
            }

            SessionEvent::FileOffer {
                peer_id,
                request_id,
                name,
                size,
                chunk_size,
            } => {
                if let Err(e) = self.check_live(QueryClass::FileGet, &request_id) {
                    debug!(event = "stale_file_offer", peer = %peer_id, %e, "Discarding superseded response");
                    return;
                }
                let handle = {
                    let inner = self.inner.lock().unwrap();
                    inner.sessions.get(&peer_id).cloned()
                };
                match handle {
                    Some(handle) => handle.send(SessionCommand::BeginIncoming {
                        request_id,
                        name,
                        size,
                        chunk_size,
                    }),
                    None => {
                        warn!(event = "offer_for_unknown_peer", peer = %peer_id, "Dropping file offer: no session")
                    }
                }
            }

            SessionEvent::App(event) => {
                let _ = self.app_events.send(event);
            }
        }
    }

    fn check_live(&self, class: QueryClass, request_id: &Uuid) -> Result<(), ProtocolError> {
        self.inner.lock().unwrap().staleness.check(class, request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::TransferDirection;
    use crate::core::config::{DEFAULT_CHUNK_SIZE, HEADER_BYTE_LENGTH};
    use crate::core::protocol::IceCandidate;
    use crate::core::provider::memory::MemoryProvider;
    use crate::core::rtc::memory::MemoryHub;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    // ── Staleness filter unit tests ──────────────────────────────────────

    #[test]
    fn newest_request_wins_regardless_of_arrival_order() {
        let mut filter = StalenessFilter::default();
        let r1 = filter.issue(QueryClass::DirectoryList);
        let r2 = filter.issue(QueryClass::DirectoryList);

        // r1's response arrives after r2 was issued: discarded.
        assert!(matches!(
            filter.check(QueryClass::DirectoryList, &r1),
            Err(ProtocolError::StaleResponse(id)) if id == r1
        ));
        // r2 is accepted whether it arrives before or after r1's response.
        assert!(filter.check(QueryClass::DirectoryList, &r2).is_ok());
        assert!(filter.check(QueryClass::DirectoryList, &r1).is_err());
    }

    #[test]
    fn query_classes_are_independent() {
        let mut filter = StalenessFilter::default();
        let list = filter.issue(QueryClass::DirectoryList);
        let get = filter.issue(QueryClass::DirectoryGet);
        let file = filter.issue(QueryClass::FileGet);

        assert!(filter.check(QueryClass::DirectoryList, &list).is_ok());
        assert!(filter.check(QueryClass::DirectoryGet, &get).is_ok());
        assert!(filter.check(QueryClass::FileGet, &file).is_ok());
        // Cross-class ids never match.
        assert!(filter.check(QueryClass::FileGet, &list).is_err());
    }

    // ── Loopback relay ───────────────────────────────────────────────────

    /// Routes peerconnection envelopes between in-process registries,
    /// rewriting `target` to the sender's id the way the relay does.
    #[derive(Clone, Default)]
    struct RelayHub {
        routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PeerSignal>>>>,
    }

    impl RelayHub {
        fn endpoint(&self, local: &str) -> (Arc<LoopbackRelay>, mpsc::UnboundedReceiver<PeerSignal>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.routes.lock().unwrap().insert(local.to_string(), tx);
            (
                Arc::new(LoopbackRelay {
                    routes: self.routes.clone(),
                    local: local.to_string(),
                }),
                rx,
            )
        }
    }

    struct LoopbackRelay {
        routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PeerSignal>>>>,
        local: String,
    }

    #[async_trait]
    impl SignalingTransport for LoopbackRelay {
        async fn send(&self, message: RelayMessage) -> Result<()> {
            if let RelayMessage::PeerConnection(PeerSignal { target, details }) = message {
                let routes = self.routes.lock().unwrap();
                if let Some(tx) = routes.get(&target) {
                    let _ = tx.send(PeerSignal {
                        target: self.local.clone(),
                        details,
                    });
                }
            }
            Ok(())
        }
    }

    // ── Harness ──────────────────────────────────────────────────────────

    struct Node {
        registry: PeerRegistry,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        provider: Arc<MemoryProvider>,
    }

    fn node(id: &str, rtc: &MemoryHub, relay_hub: &RelayHub, provider: MemoryProvider) -> Node {
        let provider = Arc::new(provider);
        let (relay, mut inbound) = relay_hub.endpoint(id);
        let (registry, events) = PeerRegistry::new(
            provider.clone(),
            Arc::new(rtc.endpoint(id)),
            relay,
            EngineConfig::default(),
        );

        let router = registry.clone();
        tokio::spawn(async move {
            while let Some(signal) = inbound.recv().await {
                router.handle_relay_signal(signal);
            }
        });

        Node {
            registry,
            events,
            provider,
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<EngineEvent>,
        what: &str,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    // ── Scenarios ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connection_scenario_initiator_queries_first() {
        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let mut a = node("a", &rtc, &relay, MemoryProvider::new());
        let mut b = node(
            "b",
            &rtc,
            &relay,
            MemoryProvider::new().with_file(&["shared", "notes.txt"], &b"hi"[..]),
        );

        a.registry.connect("b");

        let connected = wait_for(&mut a.events, "a connected", |e| {
            matches!(e, EngineEvent::PeerConnected { .. })
        })
        .await;
        let EngineEvent::PeerConnected { peer_id, initiated } = connected else {
            unreachable!()
        };
        assert_eq!(peer_id, "b");
        assert!(initiated, "dialling side must report initiated");

        let connected = wait_for(&mut b.events, "b connected", |e| {
            matches!(e, EngineEvent::PeerConnected { .. })
        })
        .await;
        let EngineEvent::PeerConnected { peer_id, initiated } = connected else {
            unreachable!()
        };
        assert_eq!(peer_id, "a");
        assert!(!initiated, "answering side must not report initiated");

        // Only the initiator issues the first directory query.
        let listing = wait_for(&mut a.events, "directory list", |e| {
            matches!(e, EngineEvent::DirectoryList { .. })
        })
        .await;
        let EngineEvent::DirectoryList { directories, .. } = listing else {
            unreachable!()
        };
        assert_eq!(directories.len(), 1);
        assert_eq!(directories[0].name, "shared");

        // The responder never queried, so it must not receive a listing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = b.events.try_recv() {
            assert!(
                !matches!(event, EngineEvent::DirectoryList { .. }),
                "responder must not issue the first directory query"
            );
        }
    }

    #[tokio::test]
    async fn transfer_scenario_one_mebibyte() {
        let size = 1_048_576usize;
        let file: Vec<u8> = (0..size).map(|i| (i * 31 % 256) as u8).collect();

        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let mut a = node("a", &rtc, &relay, MemoryProvider::new());
        let mut b = node(
            "b",
            &rtc,
            &relay,
            MemoryProvider::new().with_file(&["shared", "blob.bin"], file.clone()),
        );

        a.registry.connect("b");
        wait_for(&mut a.events, "connected", |e| {
            matches!(e, EngineEvent::PeerConnected { .. })
        })
        .await;

        let request_id = a
            .registry
            .request_file("b", vec!["shared".into(), "blob.bin".into()])
            .expect("session exists");

        let ready = wait_for(&mut a.events, "incoming ready", |e| {
            matches!(e, EngineEvent::IncomingFileReady { .. })
        })
        .await;
        let EngineEvent::IncomingFileReady {
            request_id: rid,
            name,
            size: declared,
            ..
        } = ready
        else {
            unreachable!()
        };
        assert_eq!(rid, request_id);
        assert_eq!(name, "blob.bin");
        assert_eq!(declared, size as u64);

        // Count incoming progress updates until the completion handshake.
        let mut chunks = 0usize;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), a.events.recv())
                .await
                .expect("transfer stalled")
                .expect("event channel closed");
            match event {
                EngineEvent::TransferProgress {
                    direction: TransferDirection::Incoming,
                    ..
                } => chunks += 1,
                EngineEvent::IncomingFileComplete {
                    request_id: rid, ..
                } => {
                    assert_eq!(rid, request_id);
                    break;
                }
                _ => {}
            }
        }

        let expected = size.div_ceil(DEFAULT_CHUNK_SIZE - HEADER_BYTE_LENGTH);
        assert_eq!(chunks, expected);

        {
            let received = a.provider.received();
            let files = received.lock().unwrap();
            let incoming = &files["blob.bin"];
            assert_eq!(incoming.bytes, file);
            assert!(incoming.closed, "write target closes only after the handshake");
        }

        // The sender observed its own completion.
        wait_for(&mut b.events, "outgoing complete", |e| {
            matches!(e, EngineEvent::OutgoingFileComplete { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn connect_is_deduplicated() {
        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let a = node("a", &rtc, &relay, MemoryProvider::new());

        a.registry.connect("b");
        a.registry.connect("b");
        assert_eq!(a.registry.session_count(), 1);

        let snapshot = a.registry.snapshot();
        assert_eq!(snapshot.peers, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn competing_offer_is_ignored() {
        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let a = node("a", &rtc, &relay, MemoryProvider::new());

        a.registry.connect("b");
        a.registry.handle_relay_signal(PeerSignal {
            target: "b".into(),
            details: SignalDetail::Offer { sdp: "late".into() },
        });
        assert_eq!(a.registry.session_count(), 1);
        assert!(a.registry.has_session("b"));
    }

    #[tokio::test]
    async fn signals_for_unknown_peers_are_dropped() {
        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let a = node("a", &rtc, &relay, MemoryProvider::new());

        a.registry.handle_relay_signal(PeerSignal {
            target: "ghost".into(),
            details: SignalDetail::Answer { sdp: "x".into() },
        });
        a.registry.handle_relay_signal(PeerSignal {
            target: "ghost".into(),
            details: SignalDetail::Candidate(IceCandidate {
                candidate: "candidate:0".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            }),
        });
        assert_eq!(a.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn queries_for_unknown_peers_return_none() {
        let rtc = MemoryHub::new();
        let relay = RelayHub::default();
        let a = node("a", &rtc, &relay, MemoryProvider::new());

        assert!(a.registry.request_directories("ghost").is_none());
        assert!(a.registry.request_file("ghost", vec!["x".into()]).is_none());
    }
}
