//! Response construction.
//!
//! Responses are built as complete byte strings (status line, headers,
//! blank line, body for errors) and copied into the owning connection's
//! reusable buffer; file bodies are streamed separately in chunks.

use std::fmt::Write;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 404 Not Found
    NotFound,
    /// 413 Request Entity Too Large
    PayloadTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::PayloadTooLarge => "Request Entity Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }

    /// Canned plain-text body for error responses.
    pub fn error_body(&self) -> &'static str {
        match self {
            StatusCode::Ok => "",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::PayloadTooLarge => "Request Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// Builds the header block for a 200 file response. The body follows as
/// streamed file chunks.
pub fn file_header(content_len: u64, content_type: &str, keep_alive: bool) -> String {
    let mut out = String::with_capacity(160);
    let _ = write!(
        out,
        "{} 200 OK\r\n\
         Content-Length: {}\r\n\
         Content-Type: {}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: {}\r\n\r\n",
        HTTP_VERSION,
        content_len,
        content_type,
        connection_token(keep_alive),
    );
    out
}

/// Builds a complete error response, headers and body.
///
/// Error responses close the connection; only 404 may offer keep-alive,
/// and only the worker backend asks for it.
pub fn error_response(status: StatusCode, keep_alive: bool) -> String {
    let keep_alive = keep_alive && status == StatusCode::NotFound;
    let body = status.error_body();

    let mut out = String::with_capacity(160 + body.len());
    let _ = write!(
        out,
        "{} {} {}\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: {}\r\n\r\n\
         {}",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase(),
        body.len(),
        connection_token(keep_alive),
        body,
    );
    out
}

fn connection_token(keep_alive: bool) -> &'static str {
    if keep_alive { "keep-alive" } else { "close" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_carries_length_and_type() {
        let header = file_header(10, "text/html", false);

        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Length: 10\r\n"));
        assert!(header.contains("Content-Type: text/html\r\n"));
        assert!(header.contains("Connection: close\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_responses_always_close_except_404() {
        let bad = error_response(StatusCode::BadRequest, true);
        assert!(bad.contains("Connection: close"));

        let missing = error_response(StatusCode::NotFound, true);
        assert!(missing.contains("Connection: keep-alive"));
    }

    #[test]
    fn error_body_length_matches_header() {
        let resp = error_response(StatusCode::PayloadTooLarge, false);
        let body = StatusCode::PayloadTooLarge.error_body();

        assert!(resp.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(resp.ends_with(body));
    }
}
