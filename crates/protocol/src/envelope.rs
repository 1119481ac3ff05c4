//! Binary framing for the `frames` data channel.
//!
//! ```text
//! [utf8 json header][0x00][binary payload]
//! ```
//!
//! The header is `{"width":W,"height":H,"format":"image/png"}`. The delimiter
//! is exactly one zero byte; since JSON text never contains a NUL, the first
//! zero byte in the message is always the delimiter and the payload may carry
//! arbitrary bytes after it.

use serde::{Deserialize, Serialize};

/// Header describing the payload that follows the delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

impl FrameHeader {
    pub fn png(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: "image/png".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing header delimiter")]
    MissingDelimiter,
    #[error("empty payload")]
    EmptyPayload,
    #[error("invalid header: {0}")]
    InvalidHeader(#[from] serde_json::Error),
}

/// Serialize header + payload into a single buffer for the frames channel.
pub fn encode_envelope(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let json = serde_json::to_vec(header).expect("frame header serializes");
    let mut buf = Vec::with_capacity(json.len() + 1 + payload.len());
    buf.extend_from_slice(&json);
    buf.push(0);
    buf.extend_from_slice(payload);
    buf
}

/// Split an envelope back into header and payload. The payload slice borrows
/// from the input buffer.
pub fn parse_envelope(buf: &[u8]) -> Result<(FrameHeader, &[u8]), EnvelopeError> {
    let delim = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(EnvelopeError::MissingDelimiter)?;
    let payload = &buf[delim + 1..];
    if payload.is_empty() {
        return Err(EnvelopeError::EmptyPayload);
    }
    let header: FrameHeader = serde_json::from_slice(&buf[..delim])?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let header = FrameHeader::png(1920, 1080);
        let payload = vec![0x89, 0x50, 0x4E, 0x47, 0x00, 0x01, 0x02];
        let buf = encode_envelope(&header, &payload);
        let (parsed, body) = parse_envelope(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, &payload[..]);
    }

    #[test]
    fn payload_with_leading_zero_bytes_survives() {
        // The first zero byte in the buffer must be the delimiter, so a
        // payload starting with zeros parses back intact.
        let header = FrameHeader::png(4, 4);
        let payload = vec![0x00, 0x00, 0xFF];
        let buf = encode_envelope(&header, &payload);
        let (_, body) = parse_envelope(&buf).unwrap();
        assert_eq!(body, &payload[..]);
    }

    #[test]
    fn header_is_plain_json() {
        let buf = encode_envelope(&FrameHeader::png(640, 480), &[1]);
        let delim = buf.iter().position(|&b| b == 0).unwrap();
        let json = std::str::from_utf8(&buf[..delim]).unwrap();
        assert!(json.contains(r#""width":640"#));
        assert!(json.contains(r#""height":480"#));
        assert!(json.contains(r#""format":"image/png""#));
    }

    #[test]
    fn missing_delimiter_rejected() {
        let err = parse_envelope(br#"{"width":1,"height":1,"format":"image/png"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingDelimiter));
    }

    #[test]
    fn empty_payload_rejected() {
        let mut buf = serde_json::to_vec(&FrameHeader::png(1, 1)).unwrap();
        buf.push(0);
        let err = parse_envelope(&buf).unwrap_err();
        assert!(matches!(err, EnvelopeError::EmptyPayload));
    }

    #[test]
    fn garbage_header_rejected() {
        let buf = [b'{', b'o', b'o', 0, 1, 2, 3];
        let err = parse_envelope(&buf).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidHeader(_)));
    }

    #[test]
    fn many_payload_shapes_roundtrip() {
        let header = FrameHeader::png(2, 2);
        for len in [1usize, 2, 63, 64, 65, 4096] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let buf = encode_envelope(&header, &payload);
            let (h, body) = parse_envelope(&buf).unwrap();
            assert_eq!(h, header);
            assert_eq!(body, &payload[..]);
        }
    }
}
