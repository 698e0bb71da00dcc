//! RESP2 frame codec.
//!
//! Parsing is incremental: `parse` either returns a complete frame with the
//! number of bytes it used, asks for more input, or reports a protocol
//! error. Besides the typed frames, plain-text inline commands
//! (`PING\r\n`) are accepted, as sent by telnet-style clients.

use bytes::{Bytes, BytesMut};

/// Largest bulk string a client may send
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest number of elements in one array
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Elements reserved up front when an array header arrives
const INITIAL_ARRAY_CAPACITY: i64 = 1024;

/// Longest inline command line
const MAX_INLINE_LEN: usize = 64 * 1024;

/// RESP frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n or $-1\r\n (null)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n... or *-1\r\n (null)
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Encode a frame to bytes
    #[cfg(test)]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => line(buf, b'-', s.as_bytes()),
            Frame::Integer(n) => line(buf, b':', n.to_string().as_bytes()),
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                line(buf, b'$', data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(frames)) => {
                line(buf, b'*', frames.len().to_string().as_bytes());
                for frame in frames {
                    frame.encode_into(buf);
                }
            }
        }
    }

    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    /// Error reply; `s` carries the `ERR`/`NOAUTH` prefix itself
    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    /// Null bulk string (`$-1`), the "no such key" reply
    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(Some(frames))
    }
}

fn line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.extend_from_slice(&[prefix]);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

/// Outcome of one [`parse`] call
#[derive(Debug)]
pub enum ParseResult {
    /// A whole frame and the number of bytes it occupied
    Complete(Frame, usize),
    /// The buffer ends mid-frame
    Incomplete,
    /// Malformed input; the text follows `ERR Protocol error: `
    Error(String),
}

/// Decode the first frame in `buffer`. Anything that does not start with a
/// RESP type byte is read as an inline command.
pub fn parse(buffer: &[u8]) -> ParseResult {
    match buffer.first() {
        None => ParseResult::Incomplete,
        Some(b'+') => parse_line(buffer, |s| Ok(Frame::Simple(s.to_string()))),
        Some(b'-') => parse_line(buffer, |s| Ok(Frame::Error(s.to_string()))),
        Some(b':') => parse_line(buffer, |s| {
            s.parse()
                .map(Frame::Integer)
                .map_err(|_| format!("invalid integer: {s}"))
        }),
        Some(b'$') => parse_bulk(buffer),
        Some(b'*') => parse_array(buffer),
        Some(_) => parse_inline(buffer),
    }
}

/// Offset of the first CRLF
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Header line after the type byte, and the offset just past its CRLF
fn header(buffer: &[u8]) -> Option<Result<(&str, usize), String>> {
    let end = find_crlf(buffer)?;
    Some(
        std::str::from_utf8(&buffer[1..end])
            .map(|s| (s, end + 2))
            .map_err(|_| "invalid UTF-8 in frame header".to_string()),
    )
}

/// Header parsed as a length or integer
fn numeric_header(buffer: &[u8], what: &str) -> Option<Result<(i64, usize), String>> {
    Some(header(buffer)?.and_then(|(s, next)| {
        s.parse::<i64>()
            .map(|n| (n, next))
            .map_err(|_| format!("invalid {what}: {s}"))
    }))
}

/// Single-line frames (`+`, `-`, `:`), built from the header text
fn parse_line(buffer: &[u8], build: impl FnOnce(&str) -> Result<Frame, String>) -> ParseResult {
    match header(buffer) {
        None => ParseResult::Incomplete,
        Some(Ok((s, next))) => match build(s) {
            Ok(frame) => ParseResult::Complete(frame, next),
            Err(e) => ParseResult::Error(e),
        },
        Some(Err(e)) => ParseResult::Error(e),
    }
}

/// `$<len>\r\n<data>\r\n`, or `$-1\r\n` for null
fn parse_bulk(buffer: &[u8]) -> ParseResult {
    let (len, start) = match numeric_header(buffer, "bulk length") {
        None => return ParseResult::Incomplete,
        Some(Ok(header)) => header,
        Some(Err(e)) => return ParseResult::Error(e),
    };

    if len < 0 {
        return ParseResult::Complete(Frame::Bulk(None), start);
    }
    if len > MAX_BULK_LEN {
        return ParseResult::Error("invalid bulk length".to_string());
    }

    let end = start + len as usize;
    match buffer.get(end..end + 2) {
        None => ParseResult::Incomplete,
        Some(b"\r\n") => ParseResult::Complete(
            Frame::Bulk(Some(Bytes::copy_from_slice(&buffer[start..end]))),
            end + 2,
        ),
        Some(_) => ParseResult::Error("bulk string missing trailing CRLF".to_string()),
    }
}

/// `*<n>\r\n` followed by n bulk strings, or `*-1\r\n` for null.
/// Requests never nest, so any other element type is a protocol error.
fn parse_array(buffer: &[u8]) -> ParseResult {
    let (len, mut offset) = match numeric_header(buffer, "multibulk length") {
        None => return ParseResult::Incomplete,
        Some(Ok(header)) => header,
        Some(Err(e)) => return ParseResult::Error(e),
    };

    if len < 0 {
        return ParseResult::Complete(Frame::Array(None), offset);
    }
    if len > MAX_ARRAY_LEN {
        return ParseResult::Error("invalid multibulk length".to_string());
    }

    // The header alone must not reserve the whole array
    let mut frames = Vec::with_capacity(len.min(INITIAL_ARRAY_CAPACITY) as usize);
    for _ in 0..len {
        let element = &buffer[offset..];
        let parsed = match element.first() {
            None => return ParseResult::Incomplete,
            Some(b'$') => parse_bulk(element),
            Some(&other) => {
                return ParseResult::Error(format!("expected '$', got '{}'", other as char))
            }
        };
        match parsed {
            ParseResult::Complete(frame, consumed) => {
                frames.push(frame);
                offset += consumed;
            }
            other => return other,
        }
    }

    ParseResult::Complete(Frame::Array(Some(frames)), offset)
}

/// Parse an inline command: words separated by spaces, ended by a newline.
/// Produces the same array of bulk strings a RESP client would send.
fn parse_inline(buffer: &[u8]) -> ParseResult {
    let Some(newline) = buffer.iter().position(|b| *b == b'\n') else {
        return if buffer.len() > MAX_INLINE_LEN {
            ParseResult::Error("too big inline request".to_string())
        } else {
            ParseResult::Incomplete
        };
    };

    let text = buffer[..newline].strip_suffix(b"\r").unwrap_or(&buffer[..newline]);
    let words = text
        .split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| Frame::bulk(Bytes::copy_from_slice(w)))
        .collect();

    ParseResult::Complete(Frame::Array(Some(words)), newline + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buffer: &[u8]) -> (Frame, usize) {
        match parse(buffer) {
            ParseResult::Complete(frame, consumed) => (frame, consumed),
            other => panic!("expected a complete frame, got {other:?}"),
        }
    }

    fn bulk(s: &str) -> Frame {
        Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(complete(b"+OK\r\n"), (Frame::simple("OK"), 5));
        assert_eq!(
            complete(b"-ERR unknown command\r\n"),
            (Frame::error("ERR unknown command"), 22)
        );
        assert_eq!(complete(b":-42\r\n"), (Frame::integer(-42), 6));
    }

    #[test]
    fn test_parse_bulk_strings() {
        assert_eq!(complete(b"$5\r\nhello\r\n"), (bulk("hello"), 11));
        assert_eq!(complete(b"$0\r\n\r\n"), (bulk(""), 6));
        assert_eq!(complete(b"$-1\r\n"), (Frame::null(), 5));
        // Binary-safe: CRLF inside the payload is data
        assert_eq!(complete(b"$4\r\na\r\nb\r\n"), (bulk("a\r\nb"), 10));
    }

    #[test]
    fn test_parse_command_array() {
        let (frame, consumed) = complete(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(frame, Frame::array(vec![bulk("GET"), bulk("foo")]));
        assert_eq!(consumed, 22);
        assert_eq!(complete(b"*-1\r\n"), (Frame::Array(None), 5));
        assert_eq!(complete(b"*0\r\n"), (Frame::array(vec![]), 4));
    }

    #[test]
    fn test_parse_pipelined_frames() {
        let buffer = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let (_, first) = complete(buffer);
        assert_eq!(first, 14);
        let (frame, second) = complete(&buffer[first..]);
        assert_eq!(frame, Frame::array(vec![bulk("PING")]));
        assert_eq!(first + second, buffer.len());
    }

    #[test]
    fn test_parse_incomplete() {
        for partial in [&b"+OK"[..], b"$5\r\nhel", b"*2\r\n$3\r\nfoo\r\n", b"*2\r\n", b"PING"] {
            assert!(
                matches!(parse(partial), ParseResult::Incomplete),
                "{partial:?} should be incomplete"
            );
        }
    }

    #[test]
    fn test_parse_inline_command() {
        let (frame, consumed) = complete(b"SET  key value\r\nGET key\r\n");
        assert_eq!(frame, Frame::array(vec![bulk("SET"), bulk("key"), bulk("value")]));
        assert_eq!(consumed, 16);

        let (frame, _) = complete(b"PING\n");
        assert_eq!(frame, Frame::array(vec![bulk("PING")]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(b"$abc\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b":12x\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"$3\r\nfooXY"), ParseResult::Error(_)));
        assert!(matches!(parse(b"$999999999999\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(b"*99999999\r\n"), ParseResult::Error(_)));
        assert!(matches!(parse(&[b'x'; MAX_INLINE_LEN + 1]), ParseResult::Error(_)));
    }

    #[test]
    fn test_request_arrays_hold_only_bulk_strings() {
        for nested in [&b"*1\r\n*1\r\n$1\r\nx\r\n"[..], b"*1\r\n:1\r\n", b"*2\r\n$1\r\nx\r\n+OK\r\n"] {
            assert!(matches!(parse(nested), ParseResult::Error(_)), "{nested:?}");
        }

        // Deep nesting fails at the first nested header
        let deep = b"*1\r\n".repeat(100_000);
        match parse(&deep) {
            ParseResult::Error(e) => assert_eq!(e, "expected '$', got '*'"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_large_array_header_waits_for_elements() {
        let header = format!("*{MAX_ARRAY_LEN}\r\n$1\r\nx\r\n");
        assert!(matches!(parse(header.as_bytes()), ParseResult::Incomplete));
    }

    #[test]
    fn test_encode() {
        assert_eq!(&Frame::simple("OK").encode()[..], b"+OK\r\n");
        assert_eq!(&Frame::error("ERR unknown").encode()[..], b"-ERR unknown\r\n");
        assert_eq!(&Frame::integer(-2).encode()[..], b":-2\r\n");
        assert_eq!(&Frame::null().encode()[..], b"$-1\r\n");
        assert_eq!(
            &Frame::array(vec![bulk("0"), Frame::array(vec![bulk("k")])]).encode()[..],
            b"*2\r\n$1\r\n0\r\n*1\r\n$1\r\nk\r\n"
        );
    }
}
