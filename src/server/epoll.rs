//! Epoll reactor over a pre-allocated connection pool.
//!
//! Registrations are persistent and keyed by the connection's slot index,
//! so the readiness query costs nothing per registered descriptor. Write
//! interest is armed only once a response exists to send and the
//! registration is removed when the connection releases its slot.
//! Registrations are level-triggered, so performing one bounded unit of
//! I/O per notification never strands buffered data.
//!
//! Like the poll backend, there is no idle-connection timeout, and path
//! resolution runs synchronously on the loop thread.

use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::server::conn::Flow;
use crate::server::pool::{BufferPolicy, ConnectionPool};
use crate::server::{ServeContext, listener};

/// Events drained per readiness query.
const MAX_EVENTS: usize = 1024;

/// Wait timeout; bounds the latency of the stats/shutdown checks.
const WAIT_TIMEOUT_MS: i32 = 500;

/// Token reserved for the listening socket.
const LISTENER_TOKEN: u64 = u64::MAX;

pub fn run(cfg: &Config, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    let listener = listener::bind(&cfg.bind, cfg.port, ctx.tuning.listen_backlog)?;
    info!(addr = %listener.local_addr()?, "epoll reactor listening");
    run_with_listener(listener, ctx)
}

/// Runs the reactor on an already-bound listener until shutdown is
/// requested or the readiness call fails.
pub fn run_with_listener(listener: TcpListener, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listen_fd = listener.as_raw_fd();

    let epfd = epoll_create()?;
    epoll_add(epfd, listen_fd, libc::EPOLLIN as u32, LISTENER_TOKEN)?;

    let mut pool = ConnectionPool::new(
        ctx.tuning.max_connections,
        ctx.tuning.request_buf_size,
        ctx.tuning.chunk_size,
        BufferPolicy::Lazy,
    );

    let stats_interval = Duration::from_secs(ctx.tuning.stats_interval_secs);
    let mut last_stats = Instant::now();

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

    let result = loop {
        if ctx.shutdown_requested() {
            break Ok(());
        }

        let n = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), MAX_EVENTS as i32, WAIT_TIMEOUT_MS)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(err.into());
        }

        for ev in &events[..n as usize] {
            let token = ev.u64;
            let revents = ev.events;

            if token == LISTENER_TOKEN {
                accept_pending(&listener, epfd, &mut pool, &ctx);
                continue;
            }

            let idx = token as usize;
            if idx >= pool.capacity() || pool.get(idx).is_free() {
                // Released earlier in this batch.
                continue;
            }

            let broken = revents & libc::EPOLLERR as u32 != 0
                || (revents & libc::EPOLLHUP as u32 != 0
                    && revents & libc::EPOLLIN as u32 == 0);
            if broken {
                release(epfd, &mut pool, &ctx, idx);
                continue;
            }

            if revents & libc::EPOLLIN as u32 != 0 {
                handle_readable(epfd, &mut pool, &ctx, idx);
            }
            if !pool.get(idx).is_free() && revents & libc::EPOLLOUT as u32 != 0 {
                handle_writable(epfd, &mut pool, &ctx, idx);
            }
        }

        if last_stats.elapsed() >= stats_interval {
            ctx.stats.report();
            last_stats = Instant::now();
        }
    };

    unsafe { libc::close(epfd) };
    result
}

fn handle_readable(epfd: RawFd, pool: &mut ConnectionPool, ctx: &ServeContext, idx: usize) {
    let fd = pool.get(idx).raw_fd();
    match pool.get_mut(idx).on_readable(ctx) {
        Ok(Flow::RespondReady) => {
            // A response is staged; from here on this connection only
            // writes. Re-point the persistent registration.
            if let Err(e) = epoll_mod(epfd, fd, libc::EPOLLOUT as u32, idx as u64) {
                debug!(error = %e, "arming write interest failed");
                release(epfd, pool, ctx, idx);
            }
        }
        Ok(Flow::Continue) => {}
        Ok(Flow::Done) => release(epfd, pool, ctx, idx),
        Err(e) => {
            debug!(error = %e, "connection failed");
            release(epfd, pool, ctx, idx);
        }
    }
}

fn handle_writable(epfd: RawFd, pool: &mut ConnectionPool, ctx: &ServeContext, idx: usize) {
    match pool.get_mut(idx).on_writable(ctx) {
        Ok(Flow::Continue) | Ok(Flow::RespondReady) => {}
        Ok(Flow::Done) => release(epfd, pool, ctx, idx),
        Err(e) => {
            debug!(error = %e, "connection failed");
            release(epfd, pool, ctx, idx);
        }
    }
}

/// Removes the registration, returns the slot and closes the socket.
fn release(epfd: RawFd, pool: &mut ConnectionPool, ctx: &ServeContext, idx: usize) {
    let fd = pool.get(idx).raw_fd();
    if fd >= 0 {
        let _ = epoll_del(epfd, fd);
    }
    pool.release(idx);
    ctx.stats.connection_closed();
}

/// Drains every pending accept, registering admitted sockets for read
/// readiness under their slot token. Exhaustion is non-fatal.
fn accept_pending(
    listener: &TcpListener,
    epfd: RawFd,
    pool: &mut ConnectionPool,
    ctx: &ServeContext,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let fd = stream.as_raw_fd();

                let Some(idx) = pool.acquire(stream) else {
                    debug!(%peer, "pool exhausted, dropping connection");
                    continue;
                };

                if let Err(e) = epoll_add(epfd, fd, libc::EPOLLIN as u32, idx as u64) {
                    warn!(error = %e, "registering connection failed");
                    pool.release(idx);
                    continue;
                }

                ctx.stats.connection_opened();
                debug!(%peer, slot = idx, "accepted");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn epoll_create() -> io::Result<RawFd> {
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(epfd)
}

fn epoll_add(epfd: RawFd, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_mod(epfd: RawFd, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_del(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
