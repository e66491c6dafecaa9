//! # Wire Codec Module
//!
//! Incremental framing of the intercepted message stream. Each
//! application message on the wire is a 4-byte big-endian unsigned length
//! followed by exactly that many payload bytes. TCP hands the proxy
//! arbitrary chunk boundaries, so the [`FrameDecoder`] accumulates bytes
//! and emits zero or more complete messages per chunk appended, keeping
//! the leftover tail for the next call.
//!
//! Payloads are classified for rule matching:
//! - serialized-object blobs (see [`pickle`]) become a mapping when their
//!   top-level object is a dict of string keys,
//! - valid UTF-8 becomes text (handshake markers like `#CHALLENGE#` show
//!   up here),
//! - everything else stays an opaque blob.
//!
//! Classification never alters the bytes: `raw` always carries the exact
//! consumed range, prefix included, and is what gets relayed.

pub mod pickle;

use crate::error::ProxyError;
use pickle::Value;

/// Size of the length prefix on every framed message.
pub const FRAME_HEADER_LEN: usize = 4;

/// One complete message detached from the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The exact bytes consumed, 4-byte length prefix included.
    pub raw: Vec<u8>,
    /// Declared payload length; `raw.len() == payload_len as usize + 4`.
    pub payload_len: u32,
    /// Classified payload used for rule matching.
    pub decoded: Decoded,
}

impl Frame {
    /// Payload bytes without the length prefix.
    pub fn payload(&self) -> &[u8] {
        &self.raw[FRAME_HEADER_LEN..]
    }
}

/// Classified payload content.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// Serialized-object blob whose top level is a dict of string keys.
    Mapping(Value),
    /// Valid UTF-8 payload.
    Text(String),
    /// Anything else; only the length is retained here.
    Opaque(usize),
}

impl Decoded {
    /// The rule-match key: the string at `"action"` in a mapping payload.
    pub fn action(&self) -> Option<&str> {
        match self {
            Decoded::Mapping(value) => value.get("action").and_then(Value::as_str),
            _ => None,
        }
    }

    /// The payload as text, when it decoded as such.
    pub fn text(&self) -> Option<&str> {
        match self {
            Decoded::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Stateful byte accumulator for one direction of one flow.
///
/// Invariant: after [`append`](FrameDecoder::append) returns, the internal
/// buffer never holds a complete prefix+payload; every complete message
/// has been emitted. The buffer dies with the connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    ceiling: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_ceiling(crate::defaults::MAX_FRAME_LEN)
    }

    /// A decoder with a custom frame-length ceiling.
    pub fn with_ceiling(ceiling: u32) -> Self {
        Self {
            buf: Vec::new(),
            ceiling,
        }
    }

    /// Append a chunk and detach every message completed by it, in order.
    ///
    /// A declared length above the ceiling is a protocol desync; the
    /// caller drops the connection.
    pub fn append(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProxyError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                break;
            }
            let declared =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if declared > self.ceiling {
                return Err(ProxyError::FrameTooLarge {
                    declared,
                    ceiling: self.ceiling,
                });
            }
            let total = FRAME_HEADER_LEN + declared as usize;
            if self.buf.len() < total {
                break;
            }

            let rest = self.buf.split_off(total);
            let raw = std::mem::replace(&mut self.buf, rest);
            let decoded = decode_payload(&raw[FRAME_HEADER_LEN..]);
            frames.push(Frame {
                raw,
                payload_len: declared,
                decoded,
            });
        }

        Ok(frames)
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Declared length of the pending frame, once the prefix is in.
    /// Diagnostic only, for partial-frame trace lines.
    pub fn pending_len(&self) -> Option<u32> {
        if self.buf.len() >= FRAME_HEADER_LEN {
            Some(u32::from_be_bytes([
                self.buf[0],
                self.buf[1],
                self.buf[2],
                self.buf[3],
            ]))
        } else {
            None
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a payload. Never fails: a blob that does not parse, or parses
/// to something other than a string-keyed dict, degrades to opaque with
/// the raw bytes left intact upstream.
fn decode_payload(payload: &[u8]) -> Decoded {
    if payload.starts_with(&pickle::PICKLE_SIGNATURE) {
        match pickle::parse(payload) {
            Ok(value) if is_string_keyed_dict(&value) => return Decoded::Mapping(value),
            Ok(_) => return Decoded::Opaque(payload.len()),
            Err(err) => {
                tracing::trace!("serialized-object parse failed: {err}");
                return Decoded::Opaque(payload.len());
            }
        }
    }
    match std::str::from_utf8(payload) {
        Ok(text) => Decoded::Text(text.to_owned()),
        Err(_) => Decoded::Opaque(payload.len()),
    }
}

fn is_string_keyed_dict(value: &Value) -> bool {
    match value {
        Value::Dict(pairs) => pairs.iter().all(|(k, _)| matches!(k, Value::Str(_))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_text_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.append(&framed(b"hello")).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload_len, 5);
        assert_eq!(frames[0].raw, framed(b"hello"));
        assert_eq!(frames[0].decoded.text(), Some("hello"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_one_shot() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&framed(b"#CHALLENGE#abc"));
        stream.extend_from_slice(&framed(&[0u8, 159, 146, 150])); // not utf-8
        stream.extend_from_slice(&framed(b""));

        let mut one_shot = FrameDecoder::new();
        let expected: Vec<Vec<u8>> = one_shot
            .append(&stream)
            .unwrap()
            .into_iter()
            .map(|f| f.raw)
            .collect();
        assert_eq!(expected.len(), 3);

        let mut trickle = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in &stream {
            got.extend(
                trickle
                    .append(std::slice::from_ref(byte))
                    .unwrap()
                    .into_iter()
                    .map(|f| f.raw),
            );
        }
        assert_eq!(got, expected);
        assert_eq!(trickle.buffered(), 0);
    }

    #[test]
    fn concatenated_output_equals_input() {
        let mut stream = Vec::new();
        for payload in [&b"one"[..], &b"two"[..], &[1, 2, 3, 255][..]] {
            stream.extend_from_slice(&framed(payload));
        }
        let mut decoder = FrameDecoder::new();
        let mut rejoined = Vec::new();
        for chunk in stream.chunks(7) {
            for frame in decoder.append(chunk).unwrap() {
                rejoined.extend_from_slice(&frame.raw);
            }
        }
        assert_eq!(rejoined, stream);
    }

    #[test]
    fn zero_length_frame_is_emitted() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.append(&framed(b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload_len, 0);
        assert_eq!(frames[0].raw, vec![0, 0, 0, 0]);
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut decoder = FrameDecoder::new();
        let bytes = framed(b"partial");
        assert!(decoder.append(&bytes[..6]).unwrap().is_empty());
        assert_eq!(decoder.buffered(), 6);
        assert_eq!(decoder.pending_len(), Some(7));
        let frames = decoder.append(&bytes[6..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].raw, bytes);
    }

    #[test]
    fn oversized_length_is_a_protocol_error() {
        let mut decoder = FrameDecoder::with_ceiling(1024);
        let mut bytes = 2048u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let err = decoder.append(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::FrameTooLarge {
                declared: 2048,
                ceiling: 1024
            }
        ));
    }

    #[test]
    fn mapping_payload_exposes_action() {
        let blob = pickle::dict_blob(&[("action", "update_tt_remote")]);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.append(&framed(&blob)).unwrap();
        assert_eq!(frames[0].decoded.action(), Some("update_tt_remote"));
    }

    #[test]
    fn corrupt_blob_degrades_to_opaque_with_raw_intact() {
        let mut blob = pickle::PICKLE_SIGNATURE.to_vec();
        blob.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let bytes = framed(&blob);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.append(&bytes).unwrap();
        assert!(matches!(frames[0].decoded, Decoded::Opaque(_)));
        assert_eq!(frames[0].raw, bytes);
        assert_eq!(frames[0].decoded.action(), None);
    }

    #[test]
    fn non_dict_blob_is_opaque() {
        // A bare LONG1 integer parses fine but is not a mapping.
        let body = vec![0x8a, 0x01, 0x2a, b'.'];
        let mut blob = vec![0x80, 0x04, 0x95];
        blob.extend_from_slice(&(body.len() as u64).to_le_bytes());
        blob.extend_from_slice(&body);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.append(&framed(&blob)).unwrap();
        assert!(matches!(frames[0].decoded, Decoded::Opaque(_)));
    }
}
