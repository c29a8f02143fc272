//! Data-channel multiplexer.
//!
//! Two disjoint message classes share one channel, distinguished by native
//! frame type. Text frames carry `{event, payload}` control envelopes;
//! binary frames carry `[72-byte header][chunk payload]`. Inbound decoding
//! is deliberately forgiving: a text frame that is not a control envelope is
//! dropped without any event firing (this is also how the `ping` liveness
//! probe disappears), and a binary frame whose header is unreadable is
//! dropped with a debug diagnostic.

use crate::core::config::HEADER_BYTE_LENGTH;
use crate::core::error::ProtocolError;
use crate::core::protocol::{header, ControlMessage};
use crate::core::rtc::ChannelFrame;
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// One successfully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Control(ControlMessage),
    Chunk { request_id: Uuid, payload: Bytes },
}

/// Decode one inbound frame.
///
/// Errors classify why a frame was undecodable; the caller drops the frame
/// either way — nothing is surfaced to the peer or the host.
pub fn decode(frame: ChannelFrame) -> Result<InboundMessage, ProtocolError> {
    match frame {
        ChannelFrame::Text(text) => {
            // Not an envelope (liveness probe, garbage): swallowed upstream.
            let msg = serde_json::from_str::<ControlMessage>(&text)?;
            Ok(InboundMessage::Control(msg))
        }
        ChannelFrame::Binary(data) => {
            if data.len() < HEADER_BYTE_LENGTH {
                return Err(ProtocolError::Header(data.len()));
            }
            let request_id = header::decode_request_id(&data)
                .ok_or(ProtocolError::Header(data.len()))?;
            Ok(InboundMessage::Chunk {
                request_id,
                payload: data.slice(HEADER_BYTE_LENGTH..),
            })
        }
    }
}

/// Serialize a control message for a text frame.
pub fn encode_control(msg: &ControlMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

/// Frame one chunk: header plus payload in a single binary frame.
///
/// The caller sizes `payload` so the whole frame never exceeds the
/// negotiated chunk size.
pub fn encode_chunk(request_id: &Uuid, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_BYTE_LENGTH + payload.len());
    buf.put_slice(&header::encode_request_id(request_id));
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::error::ProtocolError;

    #[test]
    fn control_round_trips_through_a_text_frame() {
        let msg = ControlMessage::TransferComplete {
            request_id: Uuid::new_v4(),
        };
        let text = encode_control(&msg).unwrap();
        let decoded = decode(ChannelFrame::Text(text)).unwrap();
        assert_eq!(decoded, InboundMessage::Control(msg));
    }

    #[test]
    fn non_envelope_text_is_a_parse_error() {
        for text in ["ping", "{\"event\":12}", ""] {
            match decode(ChannelFrame::Text(text.into())) {
                Err(ProtocolError::Parse(_)) => {}
                other => panic!("expected parse error, got {other:?}"),
            }
        }
    }

    #[test]
    fn chunk_round_trips_through_a_binary_frame() {
        let id = Uuid::new_v4();
        let payload = vec![0x5Au8; 1000];
        let frame = encode_chunk(&id, &payload);
        assert_eq!(frame.len(), HEADER_BYTE_LENGTH + payload.len());

        match decode(ChannelFrame::Binary(frame)).unwrap() {
            InboundMessage::Chunk {
                request_id,
                payload: body,
            } => {
                assert_eq!(request_id, id);
                assert_eq!(&body[..], &payload[..]);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_chunks_are_valid() {
        let id = Uuid::new_v4();
        let frame = encode_chunk(&id, &[]);
        match decode(ChannelFrame::Binary(frame)).unwrap() {
            InboundMessage::Chunk { payload, .. } => assert!(payload.is_empty()),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn undersized_or_garbled_binary_frames_are_header_errors() {
        match decode(ChannelFrame::Binary(Bytes::from_static(&[1, 2, 3]))) {
            Err(ProtocolError::Header(3)) => {}
            other => panic!("expected header error, got {other:?}"),
        }

        // Header-sized but not a UUID.
        let garbage = Bytes::from(vec![0xFFu8; HEADER_BYTE_LENGTH + 4]);
        assert!(matches!(
            decode(ChannelFrame::Binary(garbage)),
            Err(ProtocolError::Header(_))
        ));
    }
}
