//! Centralized configuration for roomdrop.
//!
//! Wire-format constants live here so both peers agree on them by
//! construction. Runtime tunables a host application may override are
//! collected in [`EngineConfig`].

// ── Wire format ──────────────────────────────────────────────────────────────

/// Width of the chunk header prepended to every binary frame, in bytes.
///
/// A hyphenated UUID is 36 characters; the header stores it as UTF-16LE code
/// units (2 bytes each), null-padded. Both peers must share this constant —
/// it is part of the wire format, never negotiated.
pub const HEADER_BYTE_LENGTH: usize = 72;

/// Label of the single data channel created by the connection initiator.
pub const CHANNEL_LABEL: &str = "channel";

/// Liveness probe sent by both sides when the channel opens.
///
/// Deliberately not a JSON envelope: the receiving multiplexer swallows it
/// on the parse-failure path, so the probe is exchanged without any handler
/// firing.
pub const LIVENESS_PROBE: &str = "ping";

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size proposed by a requester and cap applied by a
/// responder (64 KiB). A responder may shrink a proposal, never grow it.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default weight of the historic rate in the smoothed transfer-rate blend.
///
/// `smoothed = w * historic + (1 - w) * delta`. The observed production
/// configuration pins this to 1.0 (pure historic rate); the blend path is
/// kept live and covered by tests.
pub const DEFAULT_RATE_WEIGHT: f64 = 1.0;

// ── Connection ───────────────────────────────────────────────────────────────

/// Default STUN servers used when the host application supplies none.
pub const DEFAULT_STUN_SERVERS: [&str; 2] =
    ["stun:stun.sipgate.net:3478", "stun:stun.sip.us:3478"];

// ── Runtime tunables ─────────────────────────────────────────────────────────

/// Engine tunables a host application sets once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local chunk-size cap. Proposed to peers when requesting files and
    /// applied as `min(requested, max_chunk_size)` when serving them.
    pub max_chunk_size: usize,
    /// Historic-rate weight `w` in `[0, 1]` for progress smoothing.
    pub rate_weight: f64,
    /// ICE server URLs handed to the RTC backend.
    pub ice_servers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            rate_weight: DEFAULT_RATE_WEIGHT,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
