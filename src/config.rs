//! Server configuration.
//!
//! Primary parameters (bind address, port, document root, backend) come from
//! the command line, with environment-variable fallbacks. Tuning knobs
//! (capacities, timeouts, buffer sizes) have built-in defaults, may be
//! supplied in a YAML file via `--config`, and individual CLI flags override
//! the file.

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Which concurrency backend drives the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Level-triggered poll(2) reactor, interest set rebuilt each iteration.
    Poll,
    /// Epoll reactor over a pre-allocated connection pool.
    Epoll,
    /// Bounded worker-thread pool with blocking I/O and keep-alive.
    Workers,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
            BackendKind::Workers => "workers",
        };
        f.write_str(name)
    }
}

/// Capacity, buffer and timeout knobs shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Connection slots per reactor pool.
    pub max_connections: usize,
    /// Fixed capacity of each slot's request buffer.
    pub request_buf_size: usize,
    /// File chunk / response staging buffer size per slot.
    pub chunk_size: usize,
    /// Worker threads in the thread-pool backend.
    pub workers: usize,
    /// Pending-connection queue capacity in the thread-pool backend.
    pub queue_capacity: usize,
    /// Maximum requests served over one keep-alive connection.
    pub keep_alive_max: usize,
    /// Receive timeout re-armed between keep-alive requests, seconds.
    pub keep_alive_timeout_secs: u64,
    /// Initial receive/send timeout on worker-backend sockets, seconds.
    pub socket_timeout_secs: u64,
    /// Interval between statistics log lines, seconds.
    pub stats_interval_secs: u64,
    /// Listen backlog.
    pub listen_backlog: i32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_connections: 10_240,
            request_buf_size: 4096,
            chunk_size: 32_768,
            workers: 64,
            queue_capacity: 4096,
            keep_alive_max: 100,
            keep_alive_timeout_secs: 5,
            socket_timeout_secs: 10,
            stats_interval_secs: 10,
            listen_backlog: 1024,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "shoal")]
#[command(about = "Static file server comparing three C10K concurrency strategies")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0", env = "SHOAL_BIND")]
    bind: String,

    /// Port to listen on.
    #[arg(short, long, default_value = "8080", env = "SHOAL_PORT")]
    port: u16,

    /// Document root; everything served is contained under it.
    #[arg(long, env = "SHOAL_ROOT")]
    root: PathBuf,

    /// Concurrency backend.
    #[arg(long, value_enum, default_value = "epoll", env = "SHOAL_BACKEND")]
    backend: BackendKind,

    /// Optional YAML tuning file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override: connection slots per reactor pool.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Override: worker threads in the thread-pool backend.
    #[arg(long)]
    workers: Option<usize>,

    /// Override: pending-connection queue capacity.
    #[arg(long)]
    queue_capacity: Option<usize>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub root: PathBuf,
    pub backend: BackendKind,
    pub tuning: Tuning,
}

impl Config {
    /// Parses the command line, loads the tuning file if given, and applies
    /// CLI overrides on top of it.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mut tuning = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading tuning file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing tuning file {}", path.display()))?
            }
            None => Tuning::default(),
        };

        if let Some(n) = cli.max_connections {
            tuning.max_connections = n;
        }
        if let Some(n) = cli.workers {
            tuning.workers = n;
        }
        if let Some(n) = cli.queue_capacity {
            tuning.queue_capacity = n;
        }

        Ok(Self {
            bind: cli.bind,
            port: cli.port,
            root: cli.root,
            backend: cli.backend,
            tuning,
        })
    }
}
