use crate::frame::{header, Command, Frame};
use crate::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

/// Maximum frame size (10MB for safety)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default maximum frame size for most deployments (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// What travels on a STOMP byte stream: frames, and bare EOLs used as
/// heartbeats between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Heartbeat,
    Frame(Frame),
}

/// Codec for use with tokio_util::codec::Framed
pub struct StompCodec {
    max_frame_size: usize,
}

impl StompCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            warn!("Received oversized frame: {} bytes (max: {})", size, self.max_frame_size);
            return Err(ProtocolError::FrameTooLarge(size, self.max_frame_size));
        }
        Ok(())
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match src.first() {
            None => return Ok(None),
            Some(b'\n') => {
                src.advance(1);
                trace!("Decoded heartbeat");
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(b'\r') => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] != b'\n' {
                    return Err(ProtocolError::MalformedFrame("stray carriage return".to_string()));
                }
                src.advance(2);
                trace!("Decoded heartbeat");
                return Ok(Some(StompItem::Heartbeat));
            }
            Some(_) => {}
        }

        let Some((head_len, body_start)) = find_head_end(src) else {
            self.check_size(src.len())?;
            return Ok(None);
        };

        let head = std::str::from_utf8(&src[..head_len])
            .map_err(|_| ProtocolError::MalformedFrame("frame head is not UTF-8".to_string()))?;
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let command: Command = lines.next().unwrap_or_default().parse()?;
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::MalformedFrame(format!("header without colon: {:?}", line))
            })?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == header::CONTENT_LENGTH)
            .map(|(_, value)| {
                value.trim().parse::<usize>().map_err(|_| {
                    ProtocolError::MalformedFrame(format!("bad content-length: {:?}", value))
                })
            })
            .transpose()?;

        let (body_len, frame_len) = match content_length {
            Some(len) => {
                let frame_len = body_start
                    .checked_add(len)
                    .and_then(|n| n.checked_add(1))
                    .ok_or(ProtocolError::FrameTooLarge(usize::MAX, self.max_frame_size))?;
                self.check_size(frame_len)?;
                if src.len() < frame_len {
                    // Not enough data yet, reserve space
                    src.reserve(frame_len - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(ProtocolError::MalformedFrame(
                        "body is not terminated by NUL".to_string(),
                    ));
                }
                (len, frame_len)
            }
            None => match src[body_start..].iter().position(|b| *b == 0) {
                Some(len) => {
                    self.check_size(body_start + len + 1)?;
                    (len, body_start + len + 1)
                }
                None => {
                    self.check_size(src.len())?;
                    return Ok(None);
                }
            },
        };

        // We have a complete frame, consume it
        let mut raw = src.split_to(frame_len);
        raw.advance(body_start);
        raw.truncate(body_len);

        let frame = Frame {
            command,
            headers,
            body: raw.freeze(),
        };
        debug!("Decoded {} frame ({} byte body)", frame.command, frame.body.len());

        Ok(Some(StompItem::Frame(frame)))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<()> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        let start = dst.len();
        let escapes = frame.command.escapes_headers();

        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        for (name, value) in &frame.headers {
            put_header_part(dst, name, escapes);
            dst.put_u8(b':');
            put_header_part(dst, value, escapes);
            dst.put_u8(b'\n');
        }

        if !frame.body.is_empty() && frame.header(header::CONTENT_LENGTH).is_none() {
            dst.put_slice(format!("{}:{}\n", header::CONTENT_LENGTH, frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);

        let size = dst.len() - start;
        if size > self.max_frame_size {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge(size, self.max_frame_size));
        }

        debug!("Encoded {} frame of {} bytes", frame.command, size);
        Ok(())
    }
}

/// Finds the blank line that ends the frame head. Returns the head length
/// and the offset where the body starts.
fn find_head_end(src: &[u8]) -> Option<(usize, usize)> {
    for (i, _) in src.iter().enumerate().filter(|(_, b)| **b == b'\n') {
        match src.get(i + 1) {
            Some(b'\n') => return Some((i, i + 2)),
            Some(b'\r') if src.get(i + 2) == Some(&b'\n') => return Some((i, i + 3)),
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "invalid escape sequence: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }

    Ok(out)
}

fn put_header_part(dst: &mut BytesMut, raw: &str, escape: bool) {
    if !escape {
        dst.put_slice(raw.as_bytes());
        return;
    }
    for c in raw.chars() {
        match c {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' => dst.put_slice(b"\\c"),
            c => {
                let mut buf = [0u8; 4];
                dst.put_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<StompItem> {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(input);
        let mut items = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_decode_frame_without_content_length() {
        let items = decode_all(b"MESSAGE\nsubscription:0\nmessage-id:1\ndestination:/queue/test\n\nhello\0");

        assert_eq!(items.len(), 1);
        let StompItem::Frame(frame) = &items[0] else {
            panic!("expected a frame");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.header("destination"), Some("/queue/test"));
        assert_eq!(&frame.body[..], b"hello");
    }

    #[test]
    fn test_content_length_allows_nul_in_body() {
        let items = decode_all(b"SEND\ndestination:/q\ncontent-length:3\n\na\0b\0");

        let StompItem::Frame(frame) = &items[0] else {
            panic!("expected a frame");
        };
        assert_eq!(&frame.body[..], b"a\0b");
    }

    #[test]
    fn test_heartbeats_between_frames() {
        let items = decode_all(b"\n\r\nRECEIPT\r\nreceipt-id:7\r\n\r\n\0\n");

        assert_eq!(items.len(), 4);
        assert_eq!(items[0], StompItem::Heartbeat);
        assert_eq!(items[1], StompItem::Heartbeat);
        assert!(matches!(&items[2], StompItem::Frame(f) if f.header("receipt-id") == Some("7")));
        assert_eq!(items[3], StompItem::Heartbeat);
    }

    #[test]
    fn test_decode_incomplete() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nsubscription:0\n\nhel"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 27); // nothing consumed

        buf.extend_from_slice(b"lo\0");
        let item = codec.decode(&mut buf).unwrap();
        assert!(matches!(item, Some(StompItem::Frame(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_unescaping() {
        let items = decode_all(b"MESSAGE\nkey\\cname:a\\nb\\\\c\n\n\0");

        let StompItem::Frame(frame) = &items[0] else {
            panic!("expected a frame");
        };
        assert_eq!(frame.header("key:name"), Some("a\nb\\c"));
    }

    #[test]
    fn test_connected_headers_are_verbatim() {
        let items = decode_all(b"CONNECTED\nserver:a\\cb\n\n\0");

        let StompItem::Frame(frame) = &items[0] else {
            panic!("expected a frame");
        };
        assert_eq!(frame.header("server"), Some("a\\cb"));
    }

    #[test]
    fn test_invalid_escape_rejected() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"MESSAGE\nkey:a\\tb\n\n\0"[..]);

        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::from(&b"PUBLISH\n\n\0"[..]);

        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = StompCodec::new(16);
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:100\n\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, 16))
        ));
    }

    #[test]
    fn test_huge_content_length_is_rejected() {
        let mut codec = StompCodec::default();

        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:18446744073709551615\n\nx\0"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, _))
        ));

        // Just past the limit, without wrapping.
        let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:1048576\n\nx\0"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, DEFAULT_MAX_FRAME_SIZE))
        ));
    }

    #[test]
    fn test_encode_adds_content_length_and_escapes() {
        let mut codec = StompCodec::default();
        let mut dst = BytesMut::new();
        let frame = Frame::send("/queue/a:b", "hi");

        codec.encode(StompItem::Frame(frame), &mut dst).unwrap();
        assert_eq!(&dst[..], b"SEND\ndestination:/queue/a\\cb\ncontent-length:2\n\nhi\0");

        dst.clear();
        codec.encode(StompItem::Heartbeat, &mut dst).unwrap();
        assert_eq!(&dst[..], b"\n");
    }

    #[test]
    fn test_encode_then_decode_connect() {
        let mut codec = StompCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::connect("/", crate::HeartBeat::symmetric(std::time::Duration::from_secs(10)));

        codec.encode(StompItem::Frame(frame.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap();

        assert_eq!(decoded, Some(StompItem::Frame(frame)));
    }
}
