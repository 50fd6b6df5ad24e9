//! Request-line parsing.
//!
//! The parser works on the raw accumulation buffer and never touches the
//! filesystem. Until the `\r\n\r\n` terminator is present it reports
//! `Incomplete` and the caller keeps reading. Only `GET` is accepted.

/// Longest request path accepted, in bytes.
pub const MAX_PATH_LEN: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// No `\r\n\r\n` yet; keep reading.
    Incomplete,
    /// The request line is not a well-formed `GET <path> ...` line.
    Malformed,
}

/// A parsed request. The method is always `GET`; anything else fails
/// parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Normalized path: `/` is rewritten to `/index.html`.
    pub path: String,
}

/// Parses the request accumulated in `buf`.
///
/// Fails with `Malformed` when the method is not GET, the terminator
/// arrives before a well-formed request line, or the path token is empty,
/// not valid UTF-8, or longer than [`MAX_PATH_LEN`].
pub fn parse_request(buf: &[u8]) -> Result<Request, ParseError> {
    let header_end = find_terminator(buf).ok_or(ParseError::Incomplete)?;

    // Shortest valid request line: "GET / HTTP/1.1".
    if header_end < 14 || !buf.starts_with(b"GET ") {
        return Err(ParseError::Malformed);
    }

    let line = &buf[4..header_end];
    let mut start = 0;
    while start < line.len() && line[start] == b' ' {
        start += 1;
    }

    let token = &line[start..];
    let path_len = token
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::Malformed)?;
    let token = &token[..path_len];

    if token.is_empty() || token.len() > MAX_PATH_LEN {
        return Err(ParseError::Malformed);
    }
    // The path must not run past the request line itself.
    if token.contains(&b'\r') || token.contains(&b'\n') {
        return Err(ParseError::Malformed);
    }

    let path = std::str::from_utf8(token).map_err(|_| ParseError::Malformed)?;
    let path = if path == "/" { "/index.html" } else { path };

    Ok(Request {
        path: path.to_string(),
    })
}

/// Whether the raw request signals persistent-connection semantics:
/// an explicit `Connection: keep-alive` header or an `HTTP/1.1` request
/// line, whose default is persistent.
pub fn keep_alive_requested(buf: &[u8]) -> bool {
    contains(buf, b"Connection: keep-alive") || contains(buf, b"HTTP/1.1")
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
