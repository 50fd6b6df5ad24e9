//! Connection lifecycle state machine.
//!
//! One [`Connection`] per pool slot. The reactors drive it through
//! `on_readable` / `on_writable`; each call performs at most one bounded
//! unit of socket I/O and records its progress in the slot's counters, so
//! a transfer interrupted by a short read or write resumes exactly where
//! it stopped on the next readiness notification.
//!
//! Request resolution (canonicalize, open, metadata) runs synchronously on
//! the calling thread. In the reactors that thread is the event loop: a
//! slow filesystem stalls every connection until the call returns.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::files::{self, FileError};
use crate::http::mime;
use crate::http::parser::{self, ParseError};
use crate::http::response::{self, StatusCode};
use crate::server::ServeContext;

/// Protocol progress of a slot. Active connections advance strictly
/// forward: ReadingRequest → SendingHeader → SendingFile → Closing.
/// Error paths skip from ReadingRequest to SendingHeader with an error
/// body staged, then close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Slot is on the free list; no socket attached.
    Free,
    ReadingRequest,
    SendingHeader,
    SendingFile,
    Closing,
}

/// What the backend should do after an advance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the connection armed as-is.
    Continue,
    /// A response was staged; arm write interest.
    RespondReady,
    /// The connection is finished; release the slot.
    Done,
}

/// Per-slot connection state: socket, protocol state, fixed-capacity
/// request buffer, reusable response/chunk buffer, and transfer counters.
pub struct Connection {
    stream: Option<TcpStream>,
    state: ConnState,

    request_buf: Box<[u8]>,
    request_len: usize,

    response_buf: Box<[u8]>,
    response_len: usize,
    response_sent: usize,

    file: Option<File>,
    file_offset: u64,
    file_size: u64,

    /// Index of the next free slot while this one sits on the free list.
    pub(crate) next_free: i32,
}

impl Connection {
    /// A fresh, unused slot. Buffers are allocated separately so the pool
    /// can choose its allocation policy.
    pub(crate) fn new_slot() -> Self {
        Self {
            stream: None,
            state: ConnState::Free,
            request_buf: Box::default(),
            request_len: 0,
            response_buf: Box::default(),
            response_len: 0,
            response_sent: 0,
            file: None,
            file_offset: 0,
            file_size: 0,
            next_free: -1,
        }
    }

    /// Allocates the slot's buffers if they do not exist yet. Buffers are
    /// retained across client lifetimes once allocated.
    pub(crate) fn ensure_buffers(&mut self, request_buf_size: usize, chunk_size: usize) {
        if self.request_buf.is_empty() {
            self.request_buf = vec![0u8; request_buf_size].into_boxed_slice();
        }
        if self.response_buf.is_empty() {
            self.response_buf = vec![0u8; chunk_size].into_boxed_slice();
        }
    }

    /// Attaches an accepted socket and enters the lifecycle.
    pub(crate) fn open(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
        self.state = ConnState::ReadingRequest;
    }

    /// Detaches the socket and any open file and returns the slot to its
    /// initial state. Buffers stay allocated.
    pub(crate) fn reset(&mut self) {
        self.stream = None;
        self.file = None;
        self.state = ConnState::Free;
        self.request_len = 0;
        self.response_len = 0;
        self.response_sent = 0;
        self.file_offset = 0;
        self.file_size = 0;
    }

    pub fn is_free(&self) -> bool {
        self.state == ConnState::Free
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn wants_read(&self) -> bool {
        self.state == ConnState::ReadingRequest
    }

    pub fn wants_write(&self) -> bool {
        matches!(self.state, ConnState::SendingHeader | ConnState::SendingFile)
    }

    /// Raw descriptor for readiness registration. Only valid while active.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Advances on a read-readiness notification: one non-blocking receive,
    /// then a parse attempt if the terminator may now be present.
    pub fn on_readable(&mut self, ctx: &ServeContext) -> io::Result<Flow> {
        if self.state != ConnState::ReadingRequest {
            return Ok(Flow::Continue);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Flow::Done);
        };

        match stream.read(&mut self.request_buf[self.request_len..]) {
            Ok(0) => Ok(Flow::Done),
            Ok(n) => {
                self.request_len += n;
                Ok(self.try_process(ctx))
            }
            Err(e) if is_transient(&e) => Ok(Flow::Continue),
            Err(e) => Err(e),
        }
    }

    /// Advances on a write-readiness notification: one non-blocking send
    /// of staged response bytes, or one file chunk.
    pub fn on_writable(&mut self, ctx: &ServeContext) -> io::Result<Flow> {
        match self.state {
            ConnState::SendingHeader => self.send_header(ctx),
            ConnState::SendingFile => self.send_file_chunk(ctx),
            _ => Ok(Flow::Continue),
        }
    }

    /// Parses whatever has accumulated and stages a response when a verdict
    /// is in. A buffer filled to capacity without a terminator is rejected
    /// as oversized.
    fn try_process(&mut self, ctx: &ServeContext) -> Flow {
        match parser::parse_request(&self.request_buf[..self.request_len]) {
            Ok(req) => {
                self.process_request(ctx, &req.path);
                ctx.stats.request_served();
                Flow::RespondReady
            }
            Err(ParseError::Incomplete) => {
                if self.request_len == self.request_buf.len() {
                    self.stage_error(StatusCode::PayloadTooLarge);
                    ctx.stats.request_served();
                    Flow::RespondReady
                } else {
                    Flow::Continue
                }
            }
            Err(ParseError::Malformed) => {
                self.stage_error(StatusCode::BadRequest);
                ctx.stats.request_served();
                Flow::RespondReady
            }
        }
    }

    fn process_request(&mut self, ctx: &ServeContext, path: &str) {
        let target = match files::resolve(&ctx.root, path) {
            Ok(p) => p,
            Err(e) => {
                debug!(path, error = ?e, "request path rejected");
                self.stage_error(StatusCode::NotFound);
                return;
            }
        };

        match files::open_serving_file(&target) {
            Ok((file, size)) => {
                let header =
                    response::file_header(size, mime::content_type_for(&target), false);
                self.stage_response(header.as_bytes());
                self.file = Some(file);
                self.file_offset = 0;
                self.file_size = size;
                debug!(path = %target.display(), size, "serving file");
            }
            Err(FileError::NotFound) => self.stage_error(StatusCode::NotFound),
            Err(FileError::Io(e)) => {
                debug!(path = %target.display(), error = %e, "open failed");
                self.stage_error(StatusCode::InternalServerError);
            }
        }
    }

    /// Copies a fully built response into the slot buffer and enters the
    /// header-sending state.
    fn stage_response(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.response_buf.len());
        self.response_buf[..bytes.len()].copy_from_slice(bytes);
        self.response_len = bytes.len();
        self.response_sent = 0;
        self.state = ConnState::SendingHeader;
    }

    fn stage_error(&mut self, status: StatusCode) {
        self.file = None;
        self.file_offset = 0;
        self.file_size = 0;
        let resp = response::error_response(status, false);
        self.stage_response(resp.as_bytes());
    }

    fn send_header(&mut self, ctx: &ServeContext) -> io::Result<Flow> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Flow::Done);
        };

        match stream.write(&self.response_buf[self.response_sent..self.response_len]) {
            Ok(0) => Ok(Flow::Done),
            Ok(n) => {
                self.response_sent += n;
                ctx.stats.add_bytes_sent(n as u64);
                if self.response_sent < self.response_len {
                    return Ok(Flow::Continue);
                }
                if self.file.is_some() {
                    self.state = ConnState::SendingFile;
                    Ok(Flow::Continue)
                } else {
                    // Error responses (including 413) terminate here.
                    self.state = ConnState::Closing;
                    Ok(Flow::Done)
                }
            }
            Err(e) if is_transient(&e) => Ok(Flow::Continue),
            Err(e) => Err(e),
        }
    }

    /// Reads one chunk at the current file offset and sends it. The offset
    /// only advances by what the socket actually took, so a short write
    /// re-reads from the right position next time.
    fn send_file_chunk(&mut self, ctx: &ServeContext) -> io::Result<Flow> {
        let (Some(stream), Some(file)) = (self.stream.as_mut(), self.file.as_ref()) else {
            return Ok(Flow::Done);
        };

        let remaining = self.file_size - self.file_offset;
        if remaining == 0 {
            self.state = ConnState::Closing;
            return Ok(Flow::Done);
        }

        let want = remaining.min(self.response_buf.len() as u64) as usize;
        let n = file.read_at(&mut self.response_buf[..want], self.file_offset)?;
        if n == 0 {
            // File shrank underneath us; nothing sane to send.
            return Ok(Flow::Done);
        }

        match stream.write(&self.response_buf[..n]) {
            Ok(0) => Ok(Flow::Done),
            Ok(sent) => {
                self.file_offset += sent as u64;
                ctx.stats.add_bytes_sent(sent as u64);
                if self.file_offset == self.file_size {
                    self.state = ConnState::Closing;
                    Ok(Flow::Done)
                } else {
                    Ok(Flow::Continue)
                }
            }
            Err(e) if is_transient(&e) => Ok(Flow::Continue),
            Err(e) => Err(e),
        }
    }
}

/// Would-block and interrupted are not errors: the handler returns and the
/// connection stays armed for the next notification.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use std::net::TcpListener;
    use std::time::Duration;

    fn test_ctx(root: &std::path::Path) -> ServeContext {
        ServeContext::new(root.to_path_buf(), Tuning::default())
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn active_connection(server: TcpStream) -> Connection {
        let mut conn = Connection::new_slot();
        conn.ensure_buffers(4096, 32_768);
        conn.open(server);
        conn
    }

    /// Calls `f` until it reports progress, tolerating not-yet-arrived data.
    fn drive<F: FnMut(&mut Connection) -> io::Result<Flow>>(
        conn: &mut Connection,
        mut f: F,
    ) -> Flow {
        for _ in 0..200 {
            match f(conn).unwrap() {
                Flow::Continue => std::thread::sleep(Duration::from_millis(5)),
                flow => return flow,
            }
        }
        panic!("connection made no progress");
    }

    #[test]
    fn lifecycle_states_advance_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "0123456789").unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = test_ctx(&root);

        let (mut client, server) = socket_pair();
        let mut conn = active_connection(server);
        assert_eq!(conn.state(), ConnState::ReadingRequest);

        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .unwrap();

        let flow = drive(&mut conn, |c| c.on_readable(&ctx));
        assert_eq!(flow, Flow::RespondReady);
        assert_eq!(conn.state(), ConnState::SendingHeader);

        let mut saw_sending_file = false;
        loop {
            match conn.on_writable(&ctx).unwrap() {
                Flow::Done => break,
                _ => {
                    if conn.state() == ConnState::SendingFile {
                        saw_sending_file = true;
                    }
                }
            }
        }
        assert!(saw_sending_file);

        drop(conn.stream.take());
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).unwrap();
        let text = String::from_utf8_lossy(&resp);

        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Length: 10"));
        assert!(text.ends_with("0123456789"));
    }

    #[test]
    fn malformed_request_stages_400_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = test_ctx(&root);

        let (mut client, server) = socket_pair();
        let mut conn = active_connection(server);

        client.write_all(b"BLAH /x\r\n\r\n").unwrap();

        let flow = drive(&mut conn, |c| c.on_readable(&ctx));
        assert_eq!(flow, Flow::RespondReady);

        let flow = drive(&mut conn, |c| c.on_writable(&ctx));
        assert_eq!(flow, Flow::Done);

        drop(conn.stream.take());
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).unwrap();
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn oversized_request_stages_413() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = test_ctx(&root);

        let (mut client, server) = socket_pair();
        let mut conn = Connection::new_slot();
        conn.ensure_buffers(256, 1024);
        conn.open(server);

        // Exactly fills the request buffer with no terminator.
        client.write_all(&[b'A'; 256]).unwrap();

        let flow = drive(&mut conn, |c| c.on_readable(&ctx));
        assert_eq!(flow, Flow::RespondReady);

        let flow = drive(&mut conn, |c| c.on_writable(&ctx));
        assert_eq!(flow, Flow::Done);

        drop(conn.stream.take());
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).unwrap();
        assert!(String::from_utf8_lossy(&resp).starts_with("HTTP/1.1 413"));
    }

    #[test]
    fn peer_close_before_request_terminates_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = test_ctx(&root);

        let (client, server) = socket_pair();
        let mut conn = active_connection(server);

        drop(client);

        let flow = drive(&mut conn, |c| c.on_readable(&ctx));
        assert_eq!(flow, Flow::Done);
        assert_eq!(conn.state(), ConnState::ReadingRequest);
    }
}
