//! Frame codec for the raw-stream transport.
//!
//! Wire layout, ASCII header followed by a binary payload:
//!
//! ```text
//! <kind>\n
//! length:<decimal>\n
//! encrypt:<0|1>\n
//! id:<decimal>\n
//! \r\n
//! <payload of exactly `length` bytes>
//! ```
//!
//! The decoder is incremental: partial frames survive arbitrary chunk
//! boundaries, and residual bytes after a parsed frame stay buffered for the
//! next decode. Heartbeat literals ([`crate::PING`] / [`crate::PONG`]) are
//! not frames and must be filtered out before bytes reach the decoder.

use crate::{ProtocolError, UtKind};

/// Default payload cap, matching the server's `data_maxsize` default.
pub const DEFAULT_MAX_SIZE: usize = 102_400;

/// One decoded envelope. `payload` is the serialized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: UtKind,
    pub id: u64,
    /// Reserved; carried through verbatim, no transform is applied.
    pub encrypt: bool,
    pub payload: Vec<u8>,
}

/// Encode one frame. The `length` field is the byte length of `body`.
pub fn encode_frame(kind: UtKind, id: u64, encrypt: bool, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 48);
    out.extend_from_slice(kind.as_str().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(format!("length:{}\n", body.len()).as_bytes());
    out.extend_from_slice(format!("encrypt:{}\n", u8::from(encrypt)).as_bytes());
    out.extend_from_slice(format!("id:{id}\n").as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Incremental frame decoder with an internal retained buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_MAX_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_size: usize) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            max_size,
        }
    }

    /// Append freshly read bytes to the retained buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to consume one complete frame from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame. Errors
    /// are fatal for the connection; the buffer contents are unspecified
    /// afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some((kind_line, after_kind)) = read_line(&self.buf, 0) else {
            return Ok(None);
        };
        let kind_str = std::str::from_utf8(kind_line)
            .map_err(|_| ProtocolError::BadHeader("kind line is not ASCII".to_owned()))?;
        let kind = UtKind::parse(kind_str)?;

        let Some((length_line, after_length)) = read_line(&self.buf, after_kind) else {
            return Ok(None);
        };
        let length = parse_field(length_line, "length:")?;
        let length = usize::try_from(length)
            .map_err(|_| ProtocolError::BadHeader("length value out of range".to_owned()))?;
        if length > self.max_size {
            return Err(ProtocolError::Oversize {
                got: length,
                limit: self.max_size,
            });
        }

        let Some((encrypt_line, after_encrypt)) = read_line(&self.buf, after_length) else {
            return Ok(None);
        };
        let encrypt = match parse_field(encrypt_line, "encrypt:")? {
            0 => false,
            1 => true,
            other => {
                return Err(ProtocolError::BadHeader(format!(
                    "encrypt value must be 0 or 1, got {other}"
                )));
            }
        };

        let Some((id_line, after_id)) = read_line(&self.buf, after_encrypt) else {
            return Ok(None);
        };
        let id = parse_field(id_line, "id:")?;

        // Blank separator line between header and payload.
        if self.buf.len() < after_id + 2 {
            return Ok(None);
        }
        if &self.buf[after_id..after_id + 2] != b"\r\n" {
            return Err(ProtocolError::BadHeader(
                "missing blank line after header".to_owned(),
            ));
        }

        let payload_start = after_id + 2;
        let payload_end = payload_start + length;
        if self.buf.len() < payload_end {
            return Ok(None);
        }

        let payload = self.buf[payload_start..payload_end].to_vec();
        self.buf.drain(..payload_end);
        Ok(Some(Frame {
            kind,
            id,
            encrypt,
            payload,
        }))
    }
}

/// Return the line starting at `from` (without its trailing `\n`) and the
/// offset just past the newline, or `None` when no newline is buffered yet.
fn read_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rel = buf.get(from..)?.iter().position(|&b| b == b'\n')?;
    Some((&buf[from..from + rel], from + rel + 1))
}

/// Parse a `name:<decimal>` header line.
fn parse_field(line: &[u8], prefix: &str) -> Result<u64, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::BadHeader(format!("{prefix} line is not ASCII")))?;
    let value = text.strip_prefix(prefix).ok_or_else(|| {
        ProtocolError::BadHeader(format!("expected \"{prefix}\" line, got {text:?}"))
    })?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::BadHeader(format!("bad {prefix} value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_produces_exact_layout() {
        let bytes = encode_frame(UtKind::Rpc, 7, false, b"{\"id\":7}");
        assert_eq!(
            bytes,
            b"rpc\nlength:8\nencrypt:0\nid:7\n\r\n{\"id\":7}".to_vec()
        );
    }

    #[test]
    fn roundtrip_single_frame() {
        let body = br#"{"id":3,"requestType":"subscribe","topics":["orders"]}"#;
        let mut decoder = FrameDecoder::default();
        decoder.push(&encode_frame(UtKind::Subscribe, 3, true, body));
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, UtKind::Subscribe);
        assert_eq!(frames[0].id, 3);
        assert!(frames[0].encrypt);
        assert_eq!(frames[0].payload, body.to_vec());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn partial_frames_survive_any_chunk_boundary() {
        let body = br#"{"id":1,"requestType":"rpc","methodName":"add"}"#;
        let bytes = encode_frame(UtKind::Rpc, 1, false, body);
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::default();
            decoder.push(&bytes[..split]);
            if split < bytes.len() {
                assert!(
                    decoder.next_frame().expect("no error on partial").is_none(),
                    "split {split} must be incomplete"
                );
            }
            decoder.push(&bytes[split..]);
            let frames = decode_all(&mut decoder);
            assert_eq!(frames.len(), 1, "split {split}");
            assert_eq!(frames[0].payload, body.to_vec());
        }
    }

    #[test]
    fn residual_bytes_stay_for_the_next_decode() {
        let first = encode_frame(UtKind::Rpc, 1, false, b"{}");
        let second = encode_frame(UtKind::Publish, 2, false, b"{\"msg\":1}");
        let mut joined = first;
        joined.extend_from_slice(&second);

        let mut decoder = FrameDecoder::default();
        // Feed everything plus a torn prefix of a third frame.
        decoder.push(&joined);
        decoder.push(b"rpc\nlength:");
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, 1);
        assert_eq!(frames[1].id, 2);
        assert_eq!(decoder.buffered(), "rpc\nlength:".len());
    }

    #[test]
    fn unknown_kind_fails() {
        let mut decoder = FrameDecoder::default();
        decoder.push(b"get\nlength:2\nencrypt:0\nid:1\n\r\n{}");
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::UnknownKind(k)) if k == "get"
        ));
    }

    #[test]
    fn oversize_payload_fails_before_payload_arrives() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(b"rpc\nlength:17\n");
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::Oversize { got: 17, limit: 16 })
        ));
    }

    #[test]
    fn malformed_header_lines_fail() {
        for header in [
            b"rpc\nlen:2\nencrypt:0\nid:1\n\r\n{}".as_slice(),
            b"rpc\nlength:2\nencrypt:9\nid:1\n\r\n{}".as_slice(),
            b"rpc\nlength:2\nencrypt:0\nid:x\n\r\n{}".as_slice(),
            b"rpc\nlength:2\nencrypt:0\nid:1\nXX{}".as_slice(),
        ] {
            let mut decoder = FrameDecoder::default();
            decoder.push(header);
            assert!(
                matches!(decoder.next_frame(), Err(ProtocolError::BadHeader(_))),
                "header {:?} must fail",
                String::from_utf8_lossy(header)
            );
        }
    }

    #[test]
    fn empty_payload_frame_decodes() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&encode_frame(UtKind::Unsubscribe, 9, false, b""));
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }
}
