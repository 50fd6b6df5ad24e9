//! Listening socket construction.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Creates the listening socket with `SO_REUSEADDR` and the configured
/// backlog. The caller decides whether to switch it to non-blocking mode.
pub fn bind(host: &str, port: u16, backlog: i32) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving bind address {host}:{port}"))?
        .next()
        .with_context(|| format!("bind address {host}:{port} resolved to nothing"))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("creating listening socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding {addr}"))?;
    socket.listen(backlog).context("listening")?;

    Ok(socket.into())
}

/// Raises `RLIMIT_NOFILE` to its hard limit so the pooled backends can
/// actually hold their configured connection counts. Failure is logged
/// and ignored.
pub fn raise_fd_limit() {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        warn!("could not read the file descriptor limit");
        return;
    }

    rlim.rlim_cur = rlim.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        warn!("could not raise the file descriptor limit");
        return;
    }

    debug!(limit = rlim.rlim_cur, "file descriptor limit raised");
}
