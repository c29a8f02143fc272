//! Credit-based file transfer flow.
//!
//! Transfers are pull-based with exactly one chunk of credit outstanding per
//! request id. The requester opens with `file.get.request`; the responder
//! negotiates the chunk size down (never up), registers its outgoing
//! bookkeeping and answers `file.get.response`; every
//! `file.transfer.proceed{recv_bytes}` then buys exactly one binary frame of
//! at most `chunk_size` bytes, until the sender runs dry and closes with
//! `file.transfer.complete`. Multiple transfers — same peer or not —
//! interleave freely because every record is keyed by its request id.
//!
//! The flow is a per-peer state machine: it owns the transfer records and
//! the open write targets, performs provider I/O, and returns the frames to
//! transmit as declarative replies. It never touches the channel itself.

use crate::core::config::HEADER_BYTE_LENGTH;
use crate::core::error::ProtocolError;
use crate::core::events::{EngineEvent, TransferDirection};
use crate::core::protocol::ControlMessage;
use crate::core::provider::{FileProvider, WriteSink};
use crate::core::channel;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

// ── Progress metering ────────────────────────────────────────────────────────

/// One progress reading, computed from the local byte counter only — the
/// two sides never reconcile their counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred_bytes: u64,
    /// Whole percent, floored.
    pub percent: u8,
    /// Smoothed transfer rate in bytes per second.
    pub rate_bytes_per_sec: f64,
    /// Estimated seconds remaining at the smoothed rate; 0 when unknown.
    pub remaining_seconds: u64,
}

/// Byte-counter meter reproducing the protocol's rate formula:
///
/// ```text
/// historic  = transferred / elapsed          (0 when elapsed == 0)
/// delta     = (new - prev) / delta_t         (0 when delta_t == 0)
/// smoothed  = w * historic + (1 - w) * delta
/// percent   = floor(transferred / size * 100)
/// remaining = smoothed > 0 ? floor((size - transferred) / smoothed) : 0
/// ```
///
/// `start` and `last` are set on first update, then refreshed every call.
#[derive(Debug)]
pub struct ProgressMeter {
    size: u64,
    weight: f64,
    transferred: u64,
    start: Option<Instant>,
    last: Option<Instant>,
}

impl ProgressMeter {
    pub fn new(size: u64, weight: f64) -> Self {
        Self {
            size,
            weight,
            transferred: 0,
            start: None,
            last: None,
        }
    }

    pub fn update(&mut self, new_bytes: u64, now: Instant) -> ProgressSnapshot {
        let prev = self.transferred;
        self.transferred = new_bytes;

        let start = *self.start.get_or_insert(now);
        let last = *self.last.get_or_insert(now);
        self.last = Some(now);

        let elapsed = now.saturating_duration_since(start).as_secs_f64();
        let delta_t = now.saturating_duration_since(last).as_secs_f64();

        let historic = if elapsed > 0.0 {
            new_bytes as f64 / elapsed
        } else {
            0.0
        };
        let delta = if delta_t > 0.0 {
            (new_bytes as f64 - prev as f64) / delta_t
        } else {
            0.0
        };
        let smoothed = self.weight * historic + (1.0 - self.weight) * delta;

        let percent = if self.size > 0 {
            ((new_bytes as f64 / self.size as f64) * 100.0).floor() as u8
        } else {
            0
        };
        let remaining_seconds = if smoothed > 0.0 {
            ((self.size.saturating_sub(new_bytes)) as f64 / smoothed).floor() as u64
        } else {
            0
        };

        ProgressSnapshot {
            transferred_bytes: new_bytes,
            percent,
            rate_bytes_per_sec: smoothed,
            remaining_seconds,
        }
    }
}

// ── Flow outcome ─────────────────────────────────────────────────────────────

/// A frame the session must transmit on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowReply {
    Control(ControlMessage),
    /// Framed binary chunk (header already prepended).
    Chunk(Bytes),
}

/// Declarative result of one flow step: frames to send, events to emit.
#[derive(Debug, Default)]
pub struct FlowOutcome {
    pub replies: Vec<FlowReply>,
    pub events: Vec<EngineEvent>,
}

impl FlowOutcome {
    fn reply(reply: FlowReply) -> Self {
        Self {
            replies: vec![reply],
            events: Vec::new(),
        }
    }
}

// ── Transfer records ─────────────────────────────────────────────────────────

struct OutgoingTransfer {
    path: Vec<String>,
    name: String,
    size: u64,
    chunk_size: usize,
    /// High-water mark of acknowledged bytes. A `proceed` below this mark is
    /// a duplicate or reordered frame and is ignored, so progress never
    /// regresses.
    acked_bytes: u64,
    meter: ProgressMeter,
}

enum IncomingState {
    /// `file.get.request` sent; the response will activate the record.
    Requested,
    Active(IncomingTransfer),
}

struct IncomingTransfer {
    name: String,
    size: u64,
    recv_bytes: u64,
    sink: Box<dyn WriteSink>,
    meter: ProgressMeter,
}

// ── TransferFlow ─────────────────────────────────────────────────────────────

/// Per-peer transfer state machine. Exactly one record exists per request id
/// at a time; records are created at negotiation and destroyed on
/// completion.
pub struct TransferFlow {
    peer_id: String,
    provider: Arc<dyn FileProvider>,
    /// Local chunk-size cap: proposed when requesting, enforced as
    /// `min(requested, cap)` when serving.
    max_chunk_size: usize,
    rate_weight: f64,
    outgoing: HashMap<Uuid, OutgoingTransfer>,
    incoming: HashMap<Uuid, IncomingState>,
}

impl TransferFlow {
    pub fn new(
        peer_id: &str,
        provider: Arc<dyn FileProvider>,
        max_chunk_size: usize,
        rate_weight: f64,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            provider,
            max_chunk_size,
            rate_weight,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    /// Whether a binary frame with this request id has somewhere to go.
    pub fn is_receiving(&self, request_id: &Uuid) -> bool {
        matches!(self.incoming.get(request_id), Some(IncomingState::Active(_)))
    }

    // ── Requester side ───────────────────────────────────────────────────

    /// Open a transfer: register the pending slot and build the request.
    /// Only responses to registered ids are ever accepted.
    pub fn request_file(&mut self, request_id: Uuid, path: Vec<String>) -> ControlMessage {
        self.incoming.insert(request_id, IncomingState::Requested);
        ControlMessage::FileGetRequest {
            request_id,
            path,
            requested_chunk_size: self.max_chunk_size,
        }
    }

    /// `file.get.response`: open the pre-truncated write target and grant
    /// the first chunk of credit.
    pub async fn handle_file_response(
        &mut self,
        request_id: Uuid,
        name: String,
        size: u64,
        chunk_size: usize,
    ) -> Result<Option<FlowOutcome>> {
        match self.incoming.get(&request_id) {
            Some(IncomingState::Requested) => {}
            Some(IncomingState::Active(_)) => {
                debug!(event = "duplicate_file_response", peer = %self.peer_id, request_id = %request_id, "Transfer already active, ignoring");
                return Ok(None);
            }
            None => {
                debug!(event = "unsolicited_file_response", peer = %self.peer_id, request_id = %request_id, "No pending request, dropping");
                return Ok(None);
            }
        }

        let sink = self.provider.open_write_target(&name, size).await?;
        self.incoming.insert(
            request_id,
            IncomingState::Active(IncomingTransfer {
                name: name.clone(),
                size,
                recv_bytes: 0,
                sink,
                meter: ProgressMeter::new(size, self.rate_weight),
            }),
        );

        info!(event = "incoming_transfer_prepared", peer = %self.peer_id, request_id = %request_id, name = %name, size, chunk_size, "Incoming transfer prepared");

        Ok(Some(FlowOutcome {
            replies: vec![FlowReply::Control(ControlMessage::TransferProceed {
                request_id,
                recv_bytes: 0,
            })],
            events: vec![EngineEvent::IncomingFileReady {
                peer_id: self.peer_id.clone(),
                request_id,
                name,
                size,
            }],
        }))
    }

    /// One received chunk: persist it, advance the counter, and immediately
    /// grant the next chunk of credit — the protocol's only backpressure.
    pub async fn handle_chunk(
        &mut self,
        request_id: Uuid,
        payload: Bytes,
    ) -> Result<Option<FlowOutcome>> {
        let Some(IncomingState::Active(transfer)) = self.incoming.get_mut(&request_id) else {
            let e = ProtocolError::UnknownCorrelation(request_id);
            debug!(event = "unknown_incoming_transfer", peer = %self.peer_id, %e, "Dropping chunk");
            return Ok(None);
        };

        transfer.sink.write(&payload).await?;
        transfer.recv_bytes += payload.len() as u64;
        let snapshot = transfer.meter.update(transfer.recv_bytes, Instant::now());

        Ok(Some(FlowOutcome {
            replies: vec![FlowReply::Control(ControlMessage::TransferProceed {
                request_id,
                recv_bytes: transfer.recv_bytes,
            })],
            events: vec![EngineEvent::TransferProgress {
                peer_id: self.peer_id.clone(),
                request_id,
                direction: TransferDirection::Incoming,
                snapshot,
            }],
        }))
    }

    /// `file.transfer.complete`: close the write target. The stream is
    /// closed here and nowhere else.
    pub async fn handle_complete(&mut self, request_id: Uuid) -> Result<Option<FlowOutcome>> {
        let Some(IncomingState::Active(transfer)) = self.incoming.remove(&request_id) else {
            debug!(event = "unknown_transfer_completion", peer = %self.peer_id, request_id = %request_id, "Completion for unknown request id, dropping");
            return Ok(None);
        };

        let IncomingTransfer { name, sink, .. } = transfer;
        sink.close().await?;
        info!(event = "incoming_transfer_complete", peer = %self.peer_id, request_id = %request_id, name = %name, "Incoming transfer finalized");

        Ok(Some(FlowOutcome {
            replies: Vec::new(),
            events: vec![EngineEvent::IncomingFileComplete {
                peer_id: self.peer_id.clone(),
                request_id,
                name,
            }],
        }))
    }

    // ── Responder side ───────────────────────────────────────────────────

    /// `file.get.request`: resolve the path, negotiate the chunk size down,
    /// register the outgoing record and answer with the file's metadata.
    /// An unresolvable path drops the request silently.
    pub async fn handle_file_request(
        &mut self,
        request_id: Uuid,
        path: Vec<String>,
        requested_chunk_size: usize,
    ) -> Result<Option<FlowOutcome>> {
        if self.outgoing.contains_key(&request_id) {
            debug!(event = "duplicate_file_request", peer = %self.peer_id, request_id = %request_id, "Outgoing transfer already registered, ignoring");
            return Ok(None);
        }

        let Some(meta) = self.provider.resolve(&path).await? else {
            debug!(event = "file_request_unresolved", peer = %self.peer_id, request_id = %request_id, ?path, "No file at requested path, dropping request");
            return Ok(None);
        };

        // The responder may shrink the proposal, never grow it.
        let chunk_size = requested_chunk_size.min(self.max_chunk_size);

        self.outgoing.insert(
            request_id,
            OutgoingTransfer {
                path,
                name: meta.name.clone(),
                size: meta.size,
                chunk_size,
                acked_bytes: 0,
                meter: ProgressMeter::new(meta.size, self.rate_weight),
            },
        );

        info!(event = "outgoing_transfer_prepared", peer = %self.peer_id, request_id = %request_id, name = %meta.name, size = meta.size, chunk_size, "Outgoing transfer prepared");

        Ok(Some(FlowOutcome::reply(FlowReply::Control(
            ControlMessage::FileGetResponse {
                request_id,
                name: meta.name,
                size: meta.size,
                chunk_size,
            },
        ))))
    }

    /// One chunk of credit. Reads exactly
    /// `min(size - recv_bytes, chunk_size - header_len)` bytes at
    /// `recv_bytes` and frames them; at zero remaining, completes the
    /// transfer instead.
    pub async fn handle_proceed(
        &mut self,
        request_id: Uuid,
        recv_bytes: u64,
    ) -> Result<Option<FlowOutcome>> {
        let Some(transfer) = self.outgoing.get_mut(&request_id) else {
            let e = ProtocolError::UnknownCorrelation(request_id);
            debug!(event = "unknown_outgoing_transfer", peer = %self.peer_id, %e, "Dropping credit grant");
            return Ok(None);
        };

        // Duplicate or reordered credit: progress never goes backwards.
        if recv_bytes < transfer.acked_bytes {
            debug!(
                event = "stale_proceed_ignored",
                peer = %self.peer_id,
                request_id = %request_id,
                recv_bytes,
                acked = transfer.acked_bytes,
                "Proceed below high-water mark, ignoring"
            );
            return Ok(None);
        }
        transfer.acked_bytes = recv_bytes;

        let remaining = transfer.size as i64 - recv_bytes as i64;
        let budget = transfer.chunk_size as i64 - HEADER_BYTE_LENGTH as i64;
        let true_chunk_size = remaining.min(budget);

        if true_chunk_size <= 0 {
            let transfer = self.outgoing.remove(&request_id).expect("checked above");
            info!(event = "outgoing_transfer_complete", peer = %self.peer_id, request_id = %request_id, name = %transfer.name, "Outgoing transfer complete");
            return Ok(Some(FlowOutcome {
                replies: vec![FlowReply::Control(ControlMessage::TransferComplete {
                    request_id,
                })],
                events: vec![EngineEvent::OutgoingFileComplete {
                    peer_id: self.peer_id.clone(),
                    request_id,
                    name: transfer.name,
                }],
            }));
        }

        let payload = self
            .provider
            .read_range(&transfer.path, recv_bytes, true_chunk_size as usize)
            .await?;
        let frame = channel::encode_chunk(&request_id, &payload);
        let snapshot = transfer
            .meter
            .update(recv_bytes + payload.len() as u64, Instant::now());

        Ok(Some(FlowOutcome {
            replies: vec![FlowReply::Chunk(frame)],
            events: vec![EngineEvent::TransferProgress {
                peer_id: self.peer_id.clone(),
                request_id,
                direction: TransferDirection::Outgoing,
                snapshot,
            }],
        }))
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Drop every record. Open write targets are closed (their files stay
    /// incomplete — there is no resume across reconnects).
    pub async fn abort_all(&mut self) {
        let incoming = std::mem::take(&mut self.incoming);
        let outgoing = std::mem::take(&mut self.outgoing);

        let aborted = incoming.len() + outgoing.len();
        for (request_id, state) in incoming {
            if let IncomingState::Active(transfer) = state {
                debug!(event = "incoming_transfer_aborted", peer = %self.peer_id, request_id = %request_id, "Closing write target of aborted transfer");
                let _ = transfer.sink.close().await;
            }
        }
        if aborted > 0 {
            info!(event = "transfers_aborted", peer = %self.peer_id, count = aborted, "Dropped transfer records on teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::InboundMessage;
    use crate::core::config::DEFAULT_CHUNK_SIZE;
    use crate::core::provider::memory::MemoryProvider;
    use crate::core::rtc::ChannelFrame;
    use std::time::Duration;

    fn meter_at(size: u64, weight: f64) -> (ProgressMeter, Instant) {
        (ProgressMeter::new(size, weight), Instant::now())
    }

    #[test]
    fn meter_first_update_has_no_rate() {
        let (mut meter, t0) = meter_at(1000, 1.0);
        let snap = meter.update(100, t0);
        // elapsed == 0 on the very first update.
        assert_eq!(snap.rate_bytes_per_sec, 0.0);
        assert_eq!(snap.percent, 10);
        assert_eq!(snap.remaining_seconds, 0);
    }

    #[test]
    fn meter_historic_rate_with_full_weight() {
        let (mut meter, t0) = meter_at(1000, 1.0);
        meter.update(0, t0);
        let snap = meter.update(500, t0 + Duration::from_secs(2));
        // 500 bytes over 2 seconds of history.
        assert_eq!(snap.rate_bytes_per_sec, 250.0);
        assert_eq!(snap.percent, 50);
        assert_eq!(snap.remaining_seconds, 2);
    }

    #[test]
    fn meter_blends_with_partial_weight() {
        let (mut meter, t0) = meter_at(4000, 0.5);
        meter.update(0, t0);
        meter.update(1000, t0 + Duration::from_secs(1));
        let snap = meter.update(2000, t0 + Duration::from_secs(2));
        // historic = 2000/2 = 1000; delta = 1000/1 = 1000 → blend = 1000.
        assert_eq!(snap.rate_bytes_per_sec, 1000.0);

        // A stall in the last interval halves the blend.
        let snap = meter.update(2000, t0 + Duration::from_secs(4));
        // historic = 2000/4 = 500; delta = 0 → 0.5*500 = 250.
        assert_eq!(snap.rate_bytes_per_sec, 250.0);
    }

    #[test]
    fn meter_percent_floors() {
        let (mut meter, t0) = meter_at(3, 1.0);
        assert_eq!(meter.update(1, t0).percent, 33);
        assert_eq!(meter.update(2, t0 + Duration::from_millis(1)).percent, 66);
        assert_eq!(meter.update(3, t0 + Duration::from_millis(2)).percent, 100);
    }

    fn flows(file: &[u8], requester_max: usize, responder_max: usize) -> (TransferFlow, TransferFlow, Arc<MemoryProvider>) {
        let responder_provider =
            Arc::new(MemoryProvider::new().with_file(&["shared", "blob.bin"], file.to_vec()));
        let requester_provider = Arc::new(MemoryProvider::new());
        let requester = TransferFlow::new("peer-b", requester_provider.clone(), requester_max, 1.0);
        let responder = TransferFlow::new("peer-a", responder_provider, responder_max, 1.0);
        (requester, responder, requester_provider)
    }

    fn path() -> Vec<String> {
        vec!["shared".into(), "blob.bin".into()]
    }

    /// Drive a complete transfer between two flows, returning the number of
    /// binary chunks sent.
    async fn run_transfer(
        requester: &mut TransferFlow,
        responder: &mut TransferFlow,
        request_id: Uuid,
    ) -> usize {
        let request = requester.request_file(request_id, path());
        let ControlMessage::FileGetRequest {
            requested_chunk_size,
            ..
        } = request
        else {
            panic!("expected file.get.request");
        };

        let response = responder
            .handle_file_request(request_id, path(), requested_chunk_size)
            .await
            .unwrap()
            .expect("responder must answer");
        let FlowReply::Control(ControlMessage::FileGetResponse {
            name,
            size,
            chunk_size,
            ..
        }) = response.replies[0].clone()
        else {
            panic!("expected file.get.response");
        };

        let mut outcome = requester
            .handle_file_response(request_id, name, size, chunk_size)
            .await
            .unwrap()
            .expect("requester must grant credit");

        let mut chunks = 0usize;
        loop {
            let FlowReply::Control(ControlMessage::TransferProceed { recv_bytes, .. }) =
                outcome.replies[0].clone()
            else {
                panic!("expected proceed");
            };

            let step = responder
                .handle_proceed(request_id, recv_bytes)
                .await
                .unwrap()
                .expect("proceed always answers");
            match step.replies[0].clone() {
                FlowReply::Chunk(frame) => {
                    chunks += 1;
                    // Route the frame the way the multiplexer would.
                    let InboundMessage::Chunk { request_id: rid, payload } =
                        channel::decode(ChannelFrame::Binary(frame)).unwrap()
                    else {
                        panic!("expected chunk frame");
                    };
                    outcome = requester
                        .handle_chunk(rid, payload)
                        .await
                        .unwrap()
                        .expect("chunk must be accepted");
                }
                FlowReply::Control(ControlMessage::TransferComplete { .. }) => {
                    requester.handle_complete(request_id).await.unwrap().unwrap();
                    break;
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        chunks
    }

    #[tokio::test]
    async fn transfer_chunk_accounting_is_exact() {
        let size = 1_048_576usize;
        let file: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let (mut requester, mut responder, requester_provider) =
            flows(&file, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE);

        let request_id = Uuid::new_v4();
        let chunks = run_transfer(&mut requester, &mut responder, request_id).await;

        let expected = size.div_ceil(DEFAULT_CHUNK_SIZE - HEADER_BYTE_LENGTH);
        assert_eq!(chunks, expected);

        let received = requester_provider.received();
        let files = received.lock().unwrap();
        let incoming = &files["blob.bin"];
        assert_eq!(incoming.bytes.len(), size);
        assert_eq!(incoming.bytes, file);
        // Closed only after the completion handshake.
        assert!(incoming.closed);
    }

    #[tokio::test]
    async fn final_chunk_is_shorter() {
        let payload_budget = DEFAULT_CHUNK_SIZE - HEADER_BYTE_LENGTH;
        let size = payload_budget + 100;
        let file = vec![0x42u8; size];
        let (mut requester, mut responder, provider) =
            flows(&file, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE);

        let chunks = run_transfer(&mut requester, &mut responder, Uuid::new_v4()).await;
        assert_eq!(chunks, 2);
        assert_eq!(
            provider.received().lock().unwrap()["blob.bin"].bytes.len(),
            size
        );
    }

    #[tokio::test]
    async fn responder_only_shrinks_the_chunk_size() {
        let (mut requester, mut responder, _) = flows(&[1u8; 64], 131_072, 65_536);

        let request_id = Uuid::new_v4();
        requester.request_file(request_id, path());
        let outcome = responder
            .handle_file_request(request_id, path(), 131_072)
            .await
            .unwrap()
            .unwrap();
        let FlowReply::Control(ControlMessage::FileGetResponse { chunk_size, .. }) =
            outcome.replies[0].clone()
        else {
            panic!("expected response");
        };
        assert_eq!(chunk_size, 65_536);
    }

    #[tokio::test]
    async fn proposal_below_the_cap_is_kept() {
        let (mut requester, mut responder, _) = flows(&[1u8; 64], 4096, 65_536);
        let request_id = Uuid::new_v4();
        requester.request_file(request_id, path());
        let outcome = responder
            .handle_file_request(request_id, path(), 4096)
            .await
            .unwrap()
            .unwrap();
        let FlowReply::Control(ControlMessage::FileGetResponse { chunk_size, .. }) =
            outcome.replies[0].clone()
        else {
            panic!("expected response");
        };
        assert_eq!(chunk_size, 4096);
    }

    #[tokio::test]
    async fn missing_file_drops_the_request_silently() {
        let (_, mut responder, _) = flows(&[1u8; 8], 4096, 4096);
        let outcome = responder
            .handle_file_request(Uuid::new_v4(), vec!["nope".into()], 4096)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn stale_proceed_does_not_regress_progress() {
        let file = vec![9u8; 10_000];
        let (mut requester, mut responder, _) = flows(&file, 4096, 4096);

        let request_id = Uuid::new_v4();
        requester.request_file(request_id, path());
        responder
            .handle_file_request(request_id, path(), 4096)
            .await
            .unwrap()
            .unwrap();

        // Grant at 8000, then replay an older credit at 4000.
        let fresh = responder.handle_proceed(request_id, 8000).await.unwrap();
        assert!(fresh.is_some());
        let stale = responder.handle_proceed(request_id, 4000).await.unwrap();
        assert!(stale.is_none(), "regressing proceed must be ignored");

        // Equal-to-mark credit still answers (retransmit of the same grant).
        let repeat = responder.handle_proceed(request_id, 8000).await.unwrap();
        assert!(repeat.is_some());
    }

    #[tokio::test]
    async fn percent_is_monotonic_across_proceed_cycles() {
        let file: Vec<u8> = (0..50_000).map(|i| (i % 13) as u8) .collect();
        let (mut requester, mut responder, _) = flows(&file, 4096, 4096);

        let request_id = Uuid::new_v4();
        let request = requester.request_file(request_id, path());
        let ControlMessage::FileGetRequest { requested_chunk_size, .. } = request else {
            panic!()
        };
        let response = responder
            .handle_file_request(request_id, path(), requested_chunk_size)
            .await
            .unwrap()
            .unwrap();
        let FlowReply::Control(ControlMessage::FileGetResponse { name, size, chunk_size, .. }) =
            response.replies[0].clone()
        else {
            panic!()
        };
        let mut outcome = requester
            .handle_file_response(request_id, name, size, chunk_size)
            .await
            .unwrap()
            .unwrap();

        let mut last_percent = 0u8;
        loop {
            let FlowReply::Control(ControlMessage::TransferProceed { recv_bytes, .. }) =
                outcome.replies[0].clone()
            else {
                panic!()
            };
            let step = responder
                .handle_proceed(request_id, recv_bytes)
                .await
                .unwrap()
                .unwrap();
            match step.replies[0].clone() {
                FlowReply::Chunk(frame) => {
                    let InboundMessage::Chunk { payload, .. } =
                        channel::decode(ChannelFrame::Binary(frame)).unwrap()
                    else {
                        panic!()
                    };
                    outcome = requester.handle_chunk(request_id, payload).await.unwrap().unwrap();
                    let EngineEvent::TransferProgress { snapshot, .. } = outcome.events[0].clone()
                    else {
                        panic!()
                    };
                    assert!(snapshot.percent >= last_percent, "percent regressed");
                    last_percent = snapshot.percent;
                }
                FlowReply::Control(ControlMessage::TransferComplete { .. }) => break,
                other => panic!("unexpected reply {other:?}"),
            }
        }
        assert_eq!(last_percent, 100);
    }

    #[tokio::test]
    async fn unknown_correlations_are_dropped() {
        let (mut requester, mut responder, _) = flows(&[1u8; 8], 4096, 4096);
        let ghost = Uuid::new_v4();

        assert!(requester
            .handle_chunk(ghost, Bytes::from_static(b"x"))
            .await
            .unwrap()
            .is_none());
        assert!(requester.handle_complete(ghost).await.unwrap().is_none());
        assert!(responder.handle_proceed(ghost, 0).await.unwrap().is_none());
        assert!(requester
            .handle_file_response(ghost, "a".into(), 1, 4096)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_transfers_do_not_interfere() {
        let file_a: Vec<u8> = vec![1u8; 9000];
        let provider = Arc::new(
            MemoryProvider::new()
                .with_file(&["shared", "blob.bin"], file_a.clone())
                .with_file(&["shared", "other.bin"], vec![2u8; 5000]),
        );
        let receiver_provider = Arc::new(MemoryProvider::new());
        let mut requester = TransferFlow::new("peer-b", receiver_provider.clone(), 2048, 1.0);
        let mut responder = TransferFlow::new("peer-a", provider, 2048, 1.0);

        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        requester.request_file(id_a, path());
        requester.request_file(id_b, vec!["shared".into(), "other.bin".into()]);

        responder.handle_file_request(id_a, path(), 2048).await.unwrap().unwrap();
        responder
            .handle_file_request(id_b, vec!["shared".into(), "other.bin".into()], 2048)
            .await
            .unwrap()
            .unwrap();

        requester.handle_file_response(id_a, "blob.bin".into(), 9000, 2048).await.unwrap().unwrap();
        requester.handle_file_response(id_b, "other.bin".into(), 5000, 2048).await.unwrap().unwrap();

        // Interleave credits; counters must stay independent.
        let a1 = responder.handle_proceed(id_a, 0).await.unwrap().unwrap();
        let b1 = responder.handle_proceed(id_b, 0).await.unwrap().unwrap();
        let FlowReply::Chunk(frame_a) = a1.replies[0].clone() else { panic!() };
        let FlowReply::Chunk(frame_b) = b1.replies[0].clone() else { panic!() };

        let InboundMessage::Chunk { request_id, payload } =
            channel::decode(ChannelFrame::Binary(frame_a)).unwrap()
        else {
            panic!()
        };
        assert_eq!(request_id, id_a);
        assert!(payload.iter().all(|&b| b == 1));

        let InboundMessage::Chunk { request_id, payload } =
            channel::decode(ChannelFrame::Binary(frame_b)).unwrap()
        else {
            panic!()
        };
        assert_eq!(request_id, id_b);
        assert!(payload.iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn abort_closes_open_write_targets() {
        let (mut requester, mut responder, provider) = flows(&[3u8; 4096], 1024, 1024);
        let request_id = Uuid::new_v4();
        requester.request_file(request_id, path());
        responder.handle_file_request(request_id, path(), 1024).await.unwrap().unwrap();
        requester
            .handle_file_response(request_id, "blob.bin".into(), 4096, 1024)
            .await
            .unwrap()
            .unwrap();

        requester.abort_all().await;
        assert!(provider.received().lock().unwrap()["blob.bin"].closed);
        assert!(!requester.is_receiving(&request_id));
    }
}
