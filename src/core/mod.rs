//! Engine core: signaling, framing, flow control, correlation.

pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod transfer;
