//! RESP (Redis Serialization Protocol) parser.
//!
//! Parses RESP2 frames and the RESP3 additions a store sends after
//! `HELLO 3`. RESP is a binary-safe protocol that uses length-prefixed
//! strings.

use bytes::{Bytes, BytesMut};

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
    /// RESP3 null: _\r\n
    Null,
    /// RESP3 boolean: #t\r\n
    Boolean(bool),
    /// RESP3 double: ,3.14\r\n
    Double(f64),
    /// RESP3 big number: (3492890328409238509324850943850943825024385\r\n
    BigNumber(String),
    /// RESP3 blob error: !21\r\nSYNTAX invalid syntax\r\n
    BlobError(Bytes),
    /// RESP3 verbatim string: =15\r\ntxt:Some string\r\n
    Verbatim { format: String, data: Bytes },
    /// RESP3 map: %2\r\n<key><value><key><value>
    Map(Vec<(Frame, Frame)>),
    /// RESP3 set: ~2\r\n<elem><elem>
    Set(Vec<Frame>),
    /// RESP3 out-of-band push: >2\r\n<elem><elem>
    Push(Vec<Frame>),
}

impl Frame {
    /// Encode a frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => put_line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => put_line(buf, b'-', s.as_bytes()),
            Frame::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => put_blob(buf, b'$', data),
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(frames)) => put_aggregate(buf, b'*', frames),
            Frame::Null => buf.extend_from_slice(b"_\r\n"),
            Frame::Boolean(b) => put_line(buf, b'#', if *b { b"t" } else { b"f" }),
            Frame::Double(d) => put_line(buf, b',', format_double(*d).as_bytes()),
            Frame::BigNumber(n) => put_line(buf, b'(', n.as_bytes()),
            Frame::BlobError(data) => put_blob(buf, b'!', data),
            Frame::Verbatim { format, data } => {
                let mut body = BytesMut::with_capacity(format.len() + 1 + data.len());
                body.extend_from_slice(format.as_bytes());
                body.extend_from_slice(b":");
                body.extend_from_slice(data);
                put_blob(buf, b'=', &body);
            }
            Frame::Map(pairs) => {
                put_line(buf, b'%', pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.encode_into(buf);
                    value.encode_into(buf);
                }
            }
            Frame::Set(frames) => put_aggregate(buf, b'~', frames),
            Frame::Push(frames) => put_aggregate(buf, b'>', frames),
        }
    }

    /// Create a simple string response
    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    /// Create an error response
    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    /// Create a null bulk string response
    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    /// Create a bulk string response
    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    /// Create an integer response
    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    /// Create an array response
    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(Some(frames))
    }

    /// Error text if this frame is a simple or blob error.
    pub fn as_error(&self) -> Option<String> {
        match self {
            Frame::Error(msg) => Some(msg.clone()),
            Frame::BlobError(data) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

fn put_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.extend_from_slice(&[prefix]);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

fn put_blob(buf: &mut BytesMut, prefix: u8, data: &[u8]) {
    put_line(buf, prefix, data.len().to_string().as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

fn put_aggregate(buf: &mut BytesMut, prefix: u8, frames: &[Frame]) {
    put_line(buf, prefix, frames.len().to_string().as_bytes());
    for frame in frames {
        frame.encode_into(buf);
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        let sign = if d > 0.0 { "" } else { "-" };
        format!("{sign}inf")
    } else {
        d.to_string()
    }
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(String),
}

/// Deepest aggregate nesting accepted from the store
const MAX_DEPTH: usize = 128;

/// Parse a RESP frame from a buffer
pub fn parse(buffer: &[u8]) -> ParseResult {
    parse_frame(buffer, 0)
}

fn parse_frame(buffer: &[u8], depth: usize) -> ParseResult {
    if buffer.is_empty() {
        return ParseResult::Incomplete;
    }
    if depth > MAX_DEPTH {
        return ParseResult::Error(format!("Frame nested deeper than {MAX_DEPTH}"));
    }

    match buffer[0] {
        b'+' => parse_simple_string(buffer),
        b'-' => parse_error(buffer),
        b':' => parse_integer(buffer),
        b'$' => parse_bulk_string(buffer),
        b'*' => parse_array(buffer, depth),
        b'_' => parse_null(buffer),
        b'#' => parse_boolean(buffer),
        b',' => parse_double(buffer),
        b'(' => parse_big_number(buffer),
        b'!' => parse_blob_error(buffer),
        b'=' => parse_verbatim(buffer),
        b'%' => parse_map(buffer, depth),
        b'~' => parse_elements(buffer, depth).map(Frame::Set),
        b'>' => parse_elements(buffer, depth).map(Frame::Push),
        b'|' => parse_attribute(buffer, depth),
        _ => ParseResult::Error(format!("Unknown frame type: {}", buffer[0] as char)),
    }
}

impl ParseResult {
    fn map(self, f: impl FnOnce(Vec<Frame>) -> Frame) -> ParseResult {
        match self {
            ParseResult::Complete(Frame::Array(Some(frames)), consumed) => {
                ParseResult::Complete(f(frames), consumed)
            }
            ParseResult::Complete(other, _) => {
                ParseResult::Error(format!("Unexpected aggregate: {other:?}"))
            }
            other => other,
        }
    }
}

/// Find CRLF in buffer, return position of \r
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

/// Read the header line after the type byte, returning it with the offset
/// of the first byte past its CRLF.
fn header_line<'a>(buffer: &'a [u8], what: &str) -> Result<Option<(&'a str, usize)>, String> {
    match find_crlf(buffer) {
        Some(end) => std::str::from_utf8(&buffer[1..end])
            .map(|s| Some((s, end + 2)))
            .map_err(|_| format!("Invalid UTF-8 in {what}")),
        None => Ok(None),
    }
}

/// Parse a simple string: +OK\r\n
fn parse_simple_string(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "simple string") {
        Ok(Some((s, consumed))) => ParseResult::Complete(Frame::Simple(s.to_string()), consumed),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse an error: -ERR message\r\n
fn parse_error(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "error") {
        Ok(Some((s, consumed))) => ParseResult::Complete(Frame::Error(s.to_string()), consumed),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse an integer: :1000\r\n
fn parse_integer(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "integer") {
        Ok(Some((s, consumed))) => match s.parse::<i64>() {
            Ok(n) => ParseResult::Complete(Frame::Integer(n), consumed),
            Err(_) => ParseResult::Error(format!("Invalid integer: {s}")),
        },
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 null: _\r\n
fn parse_null(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "null") {
        Ok(Some(("", consumed))) => ParseResult::Complete(Frame::Null, consumed),
        Ok(Some((s, _))) => ParseResult::Error(format!("Invalid null: {s}")),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 boolean: #t\r\n or #f\r\n
fn parse_boolean(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "boolean") {
        Ok(Some(("t", consumed))) => ParseResult::Complete(Frame::Boolean(true), consumed),
        Ok(Some(("f", consumed))) => ParseResult::Complete(Frame::Boolean(false), consumed),
        Ok(Some((s, _))) => ParseResult::Error(format!("Invalid boolean: {s}")),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 double: ,1.23\r\n, ,inf\r\n, ,-inf\r\n or ,nan\r\n
fn parse_double(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "double") {
        Ok(Some((s, consumed))) => match s.parse::<f64>() {
            Ok(d) => ParseResult::Complete(Frame::Double(d), consumed),
            Err(_) => ParseResult::Error(format!("Invalid double: {s}")),
        },
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 big number: (12345678901234567890\r\n
fn parse_big_number(buffer: &[u8]) -> ParseResult {
    match header_line(buffer, "big number") {
        Ok(Some((s, consumed))) => {
            let digits = s.strip_prefix('-').unwrap_or(s);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return ParseResult::Error(format!("Invalid big number: {s}"));
            }
            ParseResult::Complete(Frame::BigNumber(s.to_string()), consumed)
        }
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Length-prefixed payload shared by bulk strings, blob errors and
/// verbatim strings.
enum Blob {
    Data(Bytes, usize),
    Null(usize),
}

fn parse_blob(buffer: &[u8], what: &str) -> Result<Option<Blob>, String> {
    let (len_str, data_start) = match header_line(buffer, what)? {
        Some(line) => line,
        None => return Ok(None),
    };

    let len: i64 = len_str
        .parse()
        .map_err(|_| format!("Invalid {what} length: {len_str}"))?;

    if len < 0 {
        return Ok(Some(Blob::Null(data_start)));
    }

    let data_end = data_start + len as usize;
    let total_len = data_end + 2; // +2 for trailing \r\n

    if buffer.len() < total_len {
        return Ok(None);
    }

    // Verify trailing CRLF
    if buffer[data_end] != b'\r' || buffer[data_end + 1] != b'\n' {
        return Err(format!("{what} missing trailing CRLF"));
    }

    let data = Bytes::copy_from_slice(&buffer[data_start..data_end]);
    Ok(Some(Blob::Data(data, total_len)))
}

/// Parse a bulk string: $5\r\nhello\r\n or $-1\r\n
fn parse_bulk_string(buffer: &[u8]) -> ParseResult {
    match parse_blob(buffer, "bulk string") {
        Ok(Some(Blob::Data(data, consumed))) => {
            ParseResult::Complete(Frame::Bulk(Some(data)), consumed)
        }
        Ok(Some(Blob::Null(consumed))) => ParseResult::Complete(Frame::Bulk(None), consumed),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 blob error: !10\r\nERR reason\r\n
fn parse_blob_error(buffer: &[u8]) -> ParseResult {
    match parse_blob(buffer, "blob error") {
        Ok(Some(Blob::Data(data, consumed))) => {
            ParseResult::Complete(Frame::BlobError(data), consumed)
        }
        Ok(Some(Blob::Null(_))) => ParseResult::Error("Negative blob error length".to_string()),
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 verbatim string: =9\r\ntxt:hello\r\n
fn parse_verbatim(buffer: &[u8]) -> ParseResult {
    match parse_blob(buffer, "verbatim string") {
        Ok(Some(Blob::Data(data, consumed))) => {
            if data.len() < 4 || data[3] != b':' {
                return ParseResult::Error("Verbatim string missing format prefix".to_string());
            }
            let format = String::from_utf8_lossy(&data[..3]).into_owned();
            let data = data.slice(4..);
            ParseResult::Complete(Frame::Verbatim { format, data }, consumed)
        }
        Ok(Some(Blob::Null(_))) => {
            ParseResult::Error("Negative verbatim string length".to_string())
        }
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse `count` consecutive frames starting at `offset`.
fn parse_sequence(
    buffer: &[u8],
    mut offset: usize,
    count: usize,
    depth: usize,
) -> Result<Option<(Vec<Frame>, usize)>, String> {
    let mut frames = Vec::with_capacity(count.min(1024));

    for _ in 0..count {
        if offset >= buffer.len() {
            return Ok(None);
        }

        match parse_frame(&buffer[offset..], depth + 1) {
            ParseResult::Complete(frame, consumed) => {
                frames.push(frame);
                offset += consumed;
            }
            ParseResult::Incomplete => return Ok(None),
            ParseResult::Error(e) => return Err(e),
        }
    }

    Ok(Some((frames, offset)))
}

/// Read an aggregate header, `Ok(None)` meaning incomplete and a negative
/// count meaning null.
fn aggregate_len(buffer: &[u8], what: &str) -> Result<Option<(i64, usize)>, String> {
    match header_line(buffer, what)? {
        Some((len_str, offset)) => len_str
            .parse::<i64>()
            .map(|n| Some((n, offset)))
            .map_err(|_| format!("Invalid {what} length: {len_str}")),
        None => Ok(None),
    }
}

/// Parse an array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n or *-1\r\n
fn parse_array(buffer: &[u8], depth: usize) -> ParseResult {
    let (len, offset) = match aggregate_len(buffer, "array") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    // Null array
    if len < 0 {
        return ParseResult::Complete(Frame::Array(None), offset);
    }

    match parse_sequence(buffer, offset, len as usize, depth) {
        Ok(Some((frames, consumed))) => {
            ParseResult::Complete(Frame::Array(Some(frames)), consumed)
        }
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a set or push body as an array; the caller rewraps it.
fn parse_elements(buffer: &[u8], depth: usize) -> ParseResult {
    let (len, offset) = match aggregate_len(buffer, "aggregate") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if len < 0 {
        return ParseResult::Error(format!("Negative aggregate length: {len}"));
    }

    match parse_sequence(buffer, offset, len as usize, depth) {
        Ok(Some((frames, consumed))) => {
            ParseResult::Complete(Frame::Array(Some(frames)), consumed)
        }
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse a RESP3 map: %1\r\n+key\r\n:1\r\n
fn parse_map(buffer: &[u8], depth: usize) -> ParseResult {
    let (len, offset) = match aggregate_len(buffer, "map") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if len < 0 {
        return ParseResult::Error(format!("Negative map length: {len}"));
    }

    match parse_sequence(buffer, offset, len as usize * 2, depth) {
        Ok(Some((frames, consumed))) => {
            let mut pairs = Vec::with_capacity(frames.len() / 2);
            let mut iter = frames.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                pairs.push((key, value));
            }
            ParseResult::Complete(Frame::Map(pairs), consumed)
        }
        Ok(None) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

/// Attributes annotate the frame that follows them; they are dropped and
/// the annotated frame is returned in their place.
fn parse_attribute(buffer: &[u8], depth: usize) -> ParseResult {
    let (len, offset) = match aggregate_len(buffer, "attribute") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if len < 0 {
        return ParseResult::Error(format!("Negative attribute length: {len}"));
    }

    let offset = match parse_sequence(buffer, offset, len as usize * 2, depth) {
        Ok(Some((_, consumed))) => consumed,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    match parse_frame(&buffer[offset..], depth + 1) {
        ParseResult::Complete(frame, consumed) => ParseResult::Complete(frame, offset + consumed),
        other => other,
    }
}
