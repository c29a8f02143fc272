//! roomdrop — peer-to-peer file sharing engine.
//!
//! Peers meet through a signaling relay, establish direct WebRTC data
//! channels, and exchange directory listings and file content peer-to-peer.
//! This crate is the transfer engine only: the per-peer signaling state
//! machine, the framing that multiplexes control JSON and binary chunks over
//! one channel, the credit-based flow control that paces chunked transfers,
//! and the request-correlation logic that keeps concurrent peer queries
//! consistent. Rendering, storage and the relay server are the host
//! application's business, reached through the `FileProvider`,
//! `SignalingTransport` and `ConnectorFactory` traits.

pub mod core;
pub mod utils;

pub use crate::core::config::EngineConfig;
pub use crate::core::events::EngineEvent;
pub use crate::core::provider::fs::DiskProvider;
pub use crate::core::provider::FileProvider;
pub use crate::core::registry::PeerRegistry;
pub use crate::core::relay::{SignalingTransport, WsRelay};
pub use crate::core::rtc::webrtc::WebRtcFactory;
pub use crate::core::rtc::ConnectorFactory;
