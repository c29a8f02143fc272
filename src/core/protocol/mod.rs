//! Wire protocol: control envelopes, chunk headers, relay signals.
//!
//! Two disjoint message classes share the data channel, distinguished by
//! native frame type. Text frames are `{event, payload}` JSON envelopes
//! ([`envelope::ControlMessage`]); binary frames are a fixed-width request-id
//! header ([`header`]) followed by raw chunk bytes. The relay speaks the same
//! envelope shape with its own vocabulary ([`signal`]).

pub mod envelope;
pub mod header;
pub mod signal;

pub use envelope::ControlMessage;
pub use signal::{IceCandidate, PeerSignal, RelayCommand, RelayMessage, SdpKind, SessionDescription, SignalDetail};
