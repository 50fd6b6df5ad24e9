//! Worker-thread pool backend.
//!
//! The accepting thread pushes each new socket onto a bounded queue and
//! wakes one worker; a full queue sheds the connection by closing it
//! immediately, so the acceptor never blocks. Workers own a connection
//! exclusively for its whole lifetime and serve it with blocking calls:
//! parse, resolve, stream the file in chunks, then either loop for the
//! next keep-alive request or close.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::{self, FileError};
use crate::http::mime;
use crate::http::parser::{self, ParseError};
use crate::http::response::{self, StatusCode};
use crate::server::{ServeContext, listener};

/// Worker stacks are small; the per-request state is a couple of buffers.
const WORKER_STACK_SIZE: usize = 128 * 1024;

/// Bounded queue of accepted sockets. Producer and consumers synchronize
/// through one mutex/condvar pair plus a shutdown flag.
pub struct ConnQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    capacity: usize,
}

struct QueueInner {
    items: VecDeque<TcpStream>,
    shutdown: bool,
}

impl ConnQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues a socket and wakes one waiting worker. A full (or shut
    /// down) queue returns the socket so the caller can shed it.
    pub fn push(&self, stream: TcpStream) -> Result<(), TcpStream> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown || inner.items.len() >= self.capacity {
            return Err(stream);
        }
        inner.items.push_back(stream);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item arrives or shutdown is flagged. Shutdown wins:
    /// once flagged, no further work is drained.
    pub fn pop(&self) -> Option<TcpStream> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return None;
            }
            if let Some(stream) = inner.items.pop_front() {
                return Some(stream);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Flags shutdown and wakes every waiting worker.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// N long-lived workers consuming from a shared [`ConnQueue`].
pub struct WorkerPool {
    queue: Arc<ConnQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<ServeContext>) -> anyhow::Result<Self> {
        let queue = Arc::new(ConnQueue::new(ctx.tuning.queue_capacity));

        let mut handles = Vec::with_capacity(ctx.tuning.workers);
        for i in 0..ctx.tuning.workers {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_loop(queue, ctx))?;
            handles.push(handle);
        }

        Ok(Self { queue, handles })
    }

    /// Hands a freshly accepted socket to the pool. A full queue sheds the
    /// connection: the socket is dropped, closing it with no response.
    pub fn dispatch(&self, stream: TcpStream) {
        if self.queue.push(stream).is_err() {
            debug!("queue full, shedding connection");
        }
    }

    /// Two-phase shutdown: flag + broadcast, then join every worker.
    pub fn shutdown(self) {
        self.queue.shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
        info!("worker pool stopped");
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

fn worker_loop(queue: Arc<ConnQueue>, ctx: Arc<ServeContext>) {
    while let Some(stream) = queue.pop() {
        ctx.stats.connection_opened();
        serve_connection(stream, &ctx);
        ctx.stats.connection_closed();
    }
}

/// Runs the accept loop on the configured address. Never returns under
/// normal operation.
pub fn run(cfg: &Config, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    let listener = listener::bind(&cfg.bind, cfg.port, ctx.tuning.listen_backlog)?;
    info!(
        addr = %listener.local_addr()?,
        workers = ctx.tuning.workers,
        "worker pool listening"
    );
    run_with_listener(listener, ctx)
}

/// Accept loop over an already-bound (blocking) listener.
pub fn run_with_listener(listener: TcpListener, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    let pool = WorkerPool::new(Arc::clone(&ctx))?;
    spawn_stats_reporter(Arc::clone(&ctx));

    while !ctx.shutdown_requested() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted");
                pool.dispatch(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Out of descriptors and friends: back off briefly and
                // keep accepting.
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    pool.shutdown();
    Ok(())
}

fn spawn_stats_reporter(ctx: Arc<ServeContext>) {
    let interval = Duration::from_secs(ctx.tuning.stats_interval_secs);
    let _ = thread::Builder::new()
        .name("stats-reporter".to_string())
        .spawn(move || {
            loop {
                thread::sleep(interval);
                if ctx.shutdown_requested() {
                    break;
                }
                ctx.stats.report();
            }
        });
}

/// Serves one client socket to completion: up to `keep_alive_max` requests
/// while the client keeps signalling persistence, then an unconditional
/// close.
fn serve_connection(mut stream: TcpStream, ctx: &ServeContext) {
    let _ = stream.set_nodelay(true);
    let io_timeout = Duration::from_secs(ctx.tuning.socket_timeout_secs);
    if stream.set_read_timeout(Some(io_timeout)).is_err()
        || stream.set_write_timeout(Some(io_timeout)).is_err()
    {
        return;
    }

    let keep_alive_timeout = Duration::from_secs(ctx.tuning.keep_alive_timeout_secs);
    let mut served = 0;

    while served < ctx.tuning.keep_alive_max {
        let keep_alive = match serve_one(&mut stream, ctx) {
            Ok(keep_alive) => keep_alive,
            // Timeout, peer reset or mid-response failure: no further
            // exchange is possible or wanted.
            Err(_) => break,
        };
        served += 1;

        if !keep_alive {
            break;
        }
        // Re-arm the receive timeout for the next request.
        if stream.set_read_timeout(Some(keep_alive_timeout)).is_err() {
            break;
        }
    }
    // Dropping the stream closes the socket unconditionally.
}

/// Reads, parses and answers a single request. Returns whether the
/// connection may carry another one.
fn serve_one(stream: &mut TcpStream, ctx: &ServeContext) -> io::Result<bool> {
    let mut buf = vec![0u8; ctx.tuning.request_buf_size];
    let mut len = 0;

    let verdict = loop {
        let n = stream.read(&mut buf[len..])?;
        if n == 0 {
            // Peer closed before completing a request; nothing to answer.
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        len += n;

        match parser::parse_request(&buf[..len]) {
            Ok(req) => break Ok(req),
            Err(ParseError::Incomplete) => {
                if len == buf.len() {
                    // No terminator within the buffer: malformed here,
                    // there is no oversized status in this backend.
                    break Err(StatusCode::BadRequest);
                }
            }
            Err(ParseError::Malformed) => break Err(StatusCode::BadRequest),
        }
    };

    let client_keep_alive = parser::keep_alive_requested(&buf[..len]);

    let request = match verdict {
        Ok(request) => request,
        Err(status) => {
            send_error(stream, ctx, status, false)?;
            return Ok(false);
        }
    };

    let target = match files::resolve(&ctx.root, &request.path) {
        Ok(path) => path,
        Err(e) => {
            debug!(path = %request.path, error = ?e, "request path rejected");
            send_error(stream, ctx, StatusCode::NotFound, client_keep_alive)?;
            return Ok(client_keep_alive);
        }
    };

    match files::open_serving_file(&target) {
        Ok((file, size)) => {
            send_file(stream, ctx, &file, size, &target, client_keep_alive)?;
            Ok(client_keep_alive)
        }
        Err(FileError::NotFound) => {
            send_error(stream, ctx, StatusCode::NotFound, client_keep_alive)?;
            Ok(client_keep_alive)
        }
        Err(FileError::Io(e)) => {
            debug!(path = %target.display(), error = %e, "open failed");
            send_error(stream, ctx, StatusCode::InternalServerError, false)?;
            Ok(false)
        }
    }
}

fn send_error(
    stream: &mut TcpStream,
    ctx: &ServeContext,
    status: StatusCode,
    keep_alive: bool,
) -> io::Result<()> {
    let resp = response::error_response(status, keep_alive);
    stream.write_all(resp.as_bytes())?;
    ctx.stats.add_bytes_sent(resp.len() as u64);
    ctx.stats.request_served();
    Ok(())
}

/// Streams a file with a blocking, short-write-tolerant send loop. Chunks
/// are read at explicit offsets so a retry can resume without reseeking.
fn send_file(
    stream: &mut TcpStream,
    ctx: &ServeContext,
    file: &File,
    size: u64,
    path: &Path,
    keep_alive: bool,
) -> io::Result<()> {
    let header = response::file_header(size, mime::content_type_for(path), keep_alive);
    stream.write_all(header.as_bytes())?;
    ctx.stats.add_bytes_sent(header.len() as u64);

    let mut chunk = vec![0u8; ctx.tuning.chunk_size];
    let mut offset = 0u64;
    while offset < size {
        let want = (size - offset).min(chunk.len() as u64) as usize;
        let n = file.read_at(&mut chunk[..want], offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        stream.write_all(&chunk[..n])?;
        offset += n as u64;
        ctx.stats.add_bytes_sent(n as u64);
    }

    ctx.stats.request_served();
    Ok(())
}
