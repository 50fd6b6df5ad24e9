//! Level-triggered reactor over poll(2).
//!
//! One thread owns every socket. Each iteration rebuilds the complete
//! pollfd set from the connection states — the cost scales with the number
//! of registered descriptors, which is exactly the property this backend
//! exists to demonstrate — then blocks briefly and dispatches the reported
//! events in order. Handlers never block and perform at most one bounded
//! unit of data I/O per notification; the listening socket is the
//! exception and drains every pending accept.
//!
//! There is no idle-connection timeout: a silent client holds its slot
//! until it closes or fails.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::server::conn::{Connection, Flow};
use crate::server::pool::{BufferPolicy, ConnectionPool};
use crate::server::{ServeContext, listener};

/// Poll timeout; bounds the latency of the stats/shutdown checks.
const POLL_TIMEOUT_MS: i32 = 50;

/// Marker in the slot map for the listener entry.
const LISTENER_SLOT: usize = usize::MAX;

pub fn run(cfg: &Config, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    let listener = listener::bind(&cfg.bind, cfg.port, ctx.tuning.listen_backlog)?;
    info!(addr = %listener.local_addr()?, "poll reactor listening");
    run_with_listener(listener, ctx)
}

/// Runs the reactor on an already-bound listener until shutdown is
/// requested or the readiness call fails.
pub fn run_with_listener(listener: TcpListener, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listen_fd = listener.as_raw_fd();

    let mut pool = ConnectionPool::new(
        ctx.tuning.max_connections,
        ctx.tuning.request_buf_size,
        ctx.tuning.chunk_size,
        BufferPolicy::Eager,
    );

    let stats_interval = Duration::from_secs(ctx.tuning.stats_interval_secs);
    let mut last_stats = Instant::now();

    let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(pool.capacity() + 1);
    let mut slot_map: Vec<usize> = Vec::with_capacity(pool.capacity() + 1);

    while !ctx.shutdown_requested() {
        pfds.clear();
        slot_map.clear();

        pfds.push(libc::pollfd {
            fd: listen_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        slot_map.push(LISTENER_SLOT);

        for idx in 0..pool.capacity() {
            let conn = pool.get(idx);
            if conn.is_free() {
                continue;
            }
            let mut events: libc::c_short = 0;
            if conn.wants_read() {
                events |= libc::POLLIN;
            }
            if conn.wants_write() {
                events |= libc::POLLOUT;
            }
            if events == 0 {
                continue;
            }
            pfds.push(libc::pollfd {
                fd: conn.raw_fd(),
                events,
                revents: 0,
            });
            slot_map.push(idx);
        }

        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        for i in 0..pfds.len() {
            let revents = pfds[i].revents;
            if revents == 0 {
                continue;
            }

            if slot_map[i] == LISTENER_SLOT {
                accept_pending(&listener, &mut pool, &ctx);
                continue;
            }

            let idx = slot_map[i];
            if pool.get(idx).is_free() {
                // Released earlier in this batch.
                continue;
            }

            let broken = revents & (libc::POLLERR | libc::POLLNVAL) != 0
                || (revents & libc::POLLHUP != 0 && revents & libc::POLLIN == 0);
            if broken {
                release(&mut pool, &ctx, idx);
                continue;
            }

            if revents & libc::POLLIN != 0 {
                dispatch(&mut pool, &ctx, idx, |conn, ctx| conn.on_readable(ctx));
            }
            if !pool.get(idx).is_free() && revents & libc::POLLOUT != 0 {
                dispatch(&mut pool, &ctx, idx, |conn, ctx| conn.on_writable(ctx));
            }
        }

        if last_stats.elapsed() >= stats_interval {
            ctx.stats.report();
            last_stats = Instant::now();
        }
    }

    Ok(())
}

/// Runs one lifecycle advance and releases the slot when the connection
/// finishes or fails. Interest changes need no bookkeeping here: the next
/// iteration derives them from the connection state.
fn dispatch<F>(pool: &mut ConnectionPool, ctx: &ServeContext, idx: usize, advance: F)
where
    F: FnOnce(&mut Connection, &ServeContext) -> io::Result<Flow>,
{
    match advance(pool.get_mut(idx), ctx) {
        Ok(Flow::Done) => release(pool, ctx, idx),
        Ok(Flow::Continue) | Ok(Flow::RespondReady) => {}
        Err(e) => {
            debug!(error = %e, "connection failed");
            release(pool, ctx, idx);
        }
    }
}

fn release(pool: &mut ConnectionPool, ctx: &ServeContext, idx: usize) {
    pool.release(idx);
    ctx.stats.connection_closed();
}

/// Drains every pending accept. Admission failures are non-fatal: a full
/// pool or an out-of-descriptors accept closes or skips the connection and
/// the loop goes on.
fn accept_pending(listener: &TcpListener, pool: &mut ConnectionPool, ctx: &ServeContext) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);

                match pool.acquire(stream) {
                    Some(_) => {
                        ctx.stats.connection_opened();
                        debug!(%peer, "accepted");
                    }
                    None => {
                        // Hard admission limit: the socket just accepted is
                        // dropped, closing it with no response.
                        debug!(%peer, "pool exhausted, dropping connection");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}
