//! Server backends.
//!
//! Three interchangeable implementations of the same serving contract:
//!
//! - **`poll`**: level-triggered poll(2) reactor; the interest set is
//!   rebuilt from connection states on every iteration
//! - **`epoll`**: epoll reactor over a pre-allocated connection pool;
//!   registrations persist and are keyed by slot index
//! - **`workers`**: bounded worker-thread pool consuming accepted sockets
//!   from a synchronized queue, blocking I/O with keep-alive
//!
//! Shared pieces: the connection lifecycle state machine (`conn`), the
//! slot arena (`pool`), and listener construction (`listener`). All state
//! a backend needs travels in an explicit [`ServeContext`] handle; nothing
//! is process-global.

pub mod conn;
pub mod epoll;
pub mod listener;
pub mod poll;
pub mod pool;
pub mod workers;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{BackendKind, Config, Tuning};
use crate::stats::Stats;

/// Everything a backend needs to serve requests: the canonical document
/// root, tuning knobs, aggregate counters and the shutdown flag.
#[derive(Debug)]
pub struct ServeContext {
    /// Canonical document root. Containment checks compare against it.
    pub root: PathBuf,
    pub tuning: Tuning,
    pub stats: Stats,
    shutdown: AtomicBool,
}

impl ServeContext {
    pub fn new(root: PathBuf, tuning: Tuning) -> Self {
        Self {
            root,
            tuning,
            stats: Stats::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Asks the reactors to exit their loops. The worker backend's
    /// acceptor observes the flag between accepts.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Runs the configured backend until shutdown or a fatal error.
pub fn run(cfg: &Config, ctx: Arc<ServeContext>) -> anyhow::Result<()> {
    listener::raise_fd_limit();

    match cfg.backend {
        BackendKind::Poll => poll::run(cfg, ctx),
        BackendKind::Epoll => epoll::run(cfg, ctx),
        BackendKind::Workers => workers::run(cfg, ctx),
    }
}
