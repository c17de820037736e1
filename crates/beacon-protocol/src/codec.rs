//! Codec for encoding and decoding Beacon frames.
//!
//! Frames are text-framed: the head is UTF-8, the body is raw bytes
//! terminated by NUL. A `content-length` header bounds the body so it
//! may itself contain NUL octets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{headers, Command, Frame, Headers};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const NUL: u8 = 0;
const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// Command line is not a known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Header line could not be parsed.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Destination is outside every known prefix.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// A `content-length` header is written for every non-empty body; any
/// caller-supplied value is replaced.
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`].
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let Some(command) = frame.command else {
        buf.put_u8(LF);
        return Ok(());
    };

    if frame.body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame.body.len(), MAX_FRAME_SIZE));
    }

    let escape = command.escapes_headers();
    let start = buf.len();

    buf.extend_from_slice(command.as_str().as_bytes());
    buf.put_u8(LF);
    for (key, value) in frame.headers.iter() {
        if key == headers::CONTENT_LENGTH {
            continue;
        }
        write_header_text(buf, key, escape);
        buf.put_u8(b':');
        write_header_text(buf, value, escape);
        buf.put_u8(LF);
    }
    if !frame.body.is_empty() {
        buf.extend_from_slice(headers::CONTENT_LENGTH.as_bytes());
        buf.put_u8(b':');
        buf.extend_from_slice(frame.body.len().to_string().as_bytes());
        buf.put_u8(LF);
    }
    buf.put_u8(LF);
    buf.extend_from_slice(&frame.body);
    buf.put_u8(NUL);

    let size = buf.len() - start;
    if size > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(size, MAX_FRAME_SIZE));
    }

    Ok(())
}

/// Decode a single frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let mut buf = BytesMut::from(data);
    decode_from(&mut buf)?.ok_or(ProtocolError::Incomplete)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame (or heartbeat) was
/// decoded, `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    decode_with_limit(buf, MAX_FRAME_SIZE)
}

fn decode_with_limit(buf: &mut BytesMut, limit: usize) -> Result<Option<Frame>, ProtocolError> {
    if buf.first() == Some(&LF) {
        buf.advance(1);
        return Ok(Some(Frame::heartbeat()));
    }
    if buf.starts_with(&[CR, LF]) {
        buf.advance(2);
        return Ok(Some(Frame::heartbeat()));
    }
    if buf.is_empty() || buf[..] == [CR] {
        return Ok(None);
    }

    let Some(head) = parse_head(buf)? else {
        return pending(buf, limit);
    };

    let body_start = head.body_start;
    let body_end = match head.content_length {
        Some(length) => {
            let body_end = match body_start.checked_add(length) {
                Some(end) if end < limit => end,
                _ => {
                    let size = body_start.saturating_add(length).saturating_add(1);
                    return Err(ProtocolError::FrameTooLarge(size, limit));
                }
            };
            if buf.len() <= body_end {
                return Ok(None);
            }
            if buf[body_end] != NUL {
                return Err(ProtocolError::Invalid(
                    "body is not terminated by NUL after content-length bytes".into(),
                ));
            }
            body_end
        }
        None => match buf[body_start..].iter().position(|&b| b == NUL) {
            Some(offset) => body_start + offset,
            None => return pending(buf, limit),
        },
    };

    if body_end + 1 > limit {
        return Err(ProtocolError::FrameTooLarge(body_end + 1, limit));
    }

    let mut data = buf.split_to(body_end + 1);
    data.truncate(body_end);
    let body = data.split_off(body_start).freeze();

    Ok(Some(Frame {
        command: Some(head.command),
        headers: head.headers,
        body,
    }))
}

fn pending(buf: &BytesMut, limit: usize) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() > limit {
        return Err(ProtocolError::FrameTooLarge(buf.len(), limit));
    }
    Ok(None)
}

/// Parsed command line and headers.
struct Head {
    command: Command,
    headers: Headers,
    body_start: usize,
    content_length: Option<usize>,
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, ProtocolError> {
    let mut lines: Vec<&[u8]> = Vec::new();
    let mut pos = 0;

    loop {
        let Some(offset) = buf[pos..].iter().position(|&b| b == LF || b == NUL) else {
            return Ok(None);
        };
        let end = pos + offset;
        if buf[end] == NUL {
            return Err(ProtocolError::Invalid("NUL octet inside frame head".into()));
        }

        let mut line = &buf[pos..end];
        if line.last() == Some(&CR) {
            line = &line[..line.len() - 1];
        }
        pos = end + 1;

        if line.is_empty() {
            break;
        }
        lines.push(line);
    }

    let (command_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| ProtocolError::Invalid("missing command line".into()))?;

    let command_text = std::str::from_utf8(command_line)
        .map_err(|_| ProtocolError::Invalid("command line is not UTF-8".into()))?;
    let command: Command = command_text
        .parse()
        .map_err(|_| ProtocolError::UnknownCommand(command_text.to_string()))?;

    let escaped = command.escapes_headers();
    let mut headers = Headers::new();
    let mut content_length = None;

    for raw in header_lines {
        let line = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::MalformedHeader("header is not UTF-8".into()))?;
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;

        let (key, value) = if escaped {
            (unescape(key)?, unescape(value)?)
        } else {
            (key.to_string(), value.to_string())
        };

        if key == headers::CONTENT_LENGTH {
            if content_length.is_none() {
                let length = value.trim().parse::<usize>().map_err(|_| {
                    ProtocolError::MalformedHeader(format!("content-length: {value}"))
                })?;
                content_length = Some(length);
            }
            continue;
        }
        headers.append(key, value);
    }

    Ok(Some(Head {
        command,
        headers,
        body_start: pos,
        content_length,
    }))
}

fn write_header_text(buf: &mut BytesMut, text: &str, escape: bool) {
    if !escape {
        buf.extend_from_slice(text.as_bytes());
        return;
    }
    for c in text.chars() {
        match c {
            '\\' => buf.extend_from_slice(b"\\\\"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            ':' => buf.extend_from_slice(b"\\c"),
            _ => {
                let mut utf8 = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, ProtocolError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                return Err(ProtocolError::MalformedHeader(format!(
                    "invalid escape sequence \\{other}"
                )))
            }
            None => {
                return Err(ProtocolError::MalformedHeader(
                    "trailing backslash in header".into(),
                ))
            }
        }
    }
    Ok(out)
}

/// Codec for streaming frame decoding with a configurable size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that rejects frames larger than `max_frame_size`.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        encode(frame)
    }

    /// Try to decode a frame from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid or exceeds the limit.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        decode_with_limit(buf, self.max_frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::send("/topic/news", "hi");
        let encoded = encode(&frame).unwrap();
        assert_eq!(
            &encoded[..],
            b"SEND\ndestination:/topic/news\ncontent-length:2\n\nhi\0"
        );
    }

    #[test]
    fn test_decode_client_frame() {
        let raw = b"SUBSCRIBE\r\nid:sub-0\r\ndestination:/user/queue/notifications\r\n\r\n\0";
        let frame = decode(raw).unwrap();
        assert_eq!(frame.command, Some(Command::Subscribe));
        assert_eq!(frame.header("id"), Some("sub-0"));
        assert_eq!(
            frame.header("destination"),
            Some("/user/queue/notifications")
        );
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_body_with_nul_uses_content_length() {
        let frame = Frame::send("/topic/bin", Bytes::from_static(b"a\0b"));
        let encoded = encode(&frame).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.body[..], b"a\0b");
    }

    #[test]
    fn test_header_escaping() {
        let frame = Frame::message("/topic/a", "sub:1", "m\n1", "x");
        let encoded = encode(&frame).unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("subscription:sub\\c1\n"));
        assert!(text.contains("message-id:m\\n1\n"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.header("subscription"), Some("sub:1"));
        assert_eq!(decoded.header("message-id"), Some("m\n1"));
    }

    #[test]
    fn test_connect_headers_not_unescaped() {
        let raw = b"CONNECT\nAuthorization:Bearer a\\cb\n\n\0";
        let frame = decode(raw).unwrap();
        assert_eq!(frame.header("Authorization"), Some("Bearer a\\cb"));
    }

    #[test]
    fn test_invalid_escape_rejected() {
        let raw = b"SEND\ndestination:/topic/\\x\n\n\0";
        assert!(matches!(
            decode(raw),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_heartbeats() {
        let mut buf = BytesMut::from(&b"\n\r\nDISCONNECT\n\n\0"[..]);
        assert!(decode_from(&mut buf).unwrap().unwrap().is_heartbeat());
        assert!(decode_from(&mut buf).unwrap().unwrap().is_heartbeat());
        let frame = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Some(Command::Disconnect));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Frame::subscribe("1", "/topic/test")).unwrap();
        let partial = &encoded[..encoded.len() - 1];
        assert!(matches!(decode(partial), Err(ProtocolError::Incomplete)));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            decode(b"PUBLISH\n\n\0"),
            Err(ProtocolError::UnknownCommand(c)) if c == "PUBLISH"
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::send("/topic/test", vec![0u8; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            encode(&frame),
            Err(ProtocolError::FrameTooLarge(..))
        ));

        let codec = FrameCodec::with_max_frame_size(64);
        let encoded = encode(&Frame::send("/topic/test", vec![b'x'; 128])).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, 64))
        ));
    }

    #[test]
    fn test_huge_content_length_rejected() {
        let mut buf = BytesMut::from(
            &b"SEND\ndestination:/topic/a\ncontent-length:18446744073709551615\n\nx\0"[..],
        );
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, MAX_FRAME_SIZE))
        ));

        let codec = FrameCodec::with_max_frame_size(64);
        let mut buf = BytesMut::from(&b"SEND\ndestination:/topic/a\ncontent-length:70000\n\nx"[..]);
        assert!(matches!(
            codec.decode_from(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, 64))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::subscribe("1", "/topic/test1");
        let frame2 = Frame::send("/app/presence/heartbeat", "{}");

        let mut stream = BytesMut::new();
        encode_into(&frame1, &mut stream).unwrap();
        encode_into(&frame2, &mut stream).unwrap();

        // Feed the bytes in two uneven pieces.
        let mut buf = stream.split_to(7);
        assert!(decode_from(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&stream);

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(buf.is_empty());
    }
}
