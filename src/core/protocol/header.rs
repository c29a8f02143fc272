//! Chunk header encoding.
//!
//! Every binary frame starts with a fixed-width header carrying the transfer's
//! request id, so the receiver can route the payload without any framing
//! negotiation:
//!
//!   [72 bytes: request id as UTF-16LE code units, null-padded][payload]
//!
//! The width fits a 36-character hyphenated UUID exactly. Tokens shorter than
//! the capacity are left-justified and padded with null code units; decoding
//! strips the padding.

use crate::core::config::HEADER_BYTE_LENGTH;
use uuid::Uuid;

/// Maximum token length the header can carry (code units, i.e. characters
/// for the ASCII tokens this protocol uses).
pub const HEADER_CAPACITY: usize = HEADER_BYTE_LENGTH / 2;

/// Encode `token` into a fixed-width header.
///
/// Returns `None` when the token does not fit. Tokens are expected to be
/// ASCII (hyphenated UUIDs); non-BMP characters would not survive the
/// two-byte encoding and are rejected.
pub fn encode_token(token: &str) -> Option<[u8; HEADER_BYTE_LENGTH]> {
    let mut buf = [0u8; HEADER_BYTE_LENGTH];
    let mut units = 0usize;

    for unit in token.encode_utf16() {
        if units == HEADER_CAPACITY || unit == 0 {
            return None;
        }
        buf[units * 2..units * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        units += 1;
    }

    Some(buf)
}

/// Decode the token from a header region, stripping null padding.
///
/// Returns `None` when `bytes` is shorter than the header width or the
/// content is not valid UTF-16.
pub fn decode_token(bytes: &[u8]) -> Option<String> {
    if bytes.len() < HEADER_BYTE_LENGTH {
        return None;
    }

    let units: Vec<u16> = bytes[..HEADER_BYTE_LENGTH]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&u| u != 0)
        .collect();

    String::from_utf16(&units).ok()
}

/// Encode a request id into a header. Hyphenated UUIDs always fit.
pub fn encode_request_id(request_id: &Uuid) -> [u8; HEADER_BYTE_LENGTH] {
    let mut text = Uuid::encode_buffer();
    let text = request_id.hyphenated().encode_lower(&mut text);
    encode_token(text).expect("hyphenated uuid fits the header")
}

/// Decode a request id from the header region of a binary frame.
pub fn decode_request_id(bytes: &[u8]) -> Option<Uuid> {
    decode_token(bytes).and_then(|s| Uuid::parse_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_any_ascii_token_within_capacity() {
        for token in ["a", "transfer-7", &"x".repeat(HEADER_CAPACITY)] {
            let header = encode_token(token).unwrap();
            assert_eq!(header.len(), HEADER_BYTE_LENGTH);
            assert_eq!(decode_token(&header).unwrap(), *token);
        }
    }

    #[test]
    fn round_trips_request_ids() {
        for _ in 0..32 {
            let id = Uuid::new_v4();
            let header = encode_request_id(&id);
            assert_eq!(decode_request_id(&header), Some(id));
        }
    }

    #[test]
    fn rejects_oversized_tokens() {
        let too_long = "y".repeat(HEADER_CAPACITY + 1);
        assert!(encode_token(&too_long).is_none());
    }

    #[test]
    fn short_buffers_do_not_decode() {
        assert!(decode_token(&[0u8; HEADER_BYTE_LENGTH - 1]).is_none());
        assert!(decode_request_id(&[]).is_none());
    }

    #[test]
    fn decode_ignores_payload_after_header() {
        let id = Uuid::new_v4();
        let mut frame = encode_request_id(&id).to_vec();
        frame.extend_from_slice(b"payload bytes that are not UTF-16");
        assert_eq!(decode_request_id(&frame), Some(id));
    }

    #[test]
    fn garbage_header_is_not_a_request_id() {
        // Valid UTF-16 text but not a UUID.
        let header = encode_token("not-a-uuid").unwrap();
        assert!(decode_request_id(&header).is_none());
    }
}
