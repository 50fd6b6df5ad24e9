use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use shoal::config::Config;
use shoal::server::{self, ServeContext};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    // The document root is mandatory and must exist before we accept
    // anything; everything served is contained under its canonical form.
    let root = std::fs::canonicalize(&cfg.root)
        .with_context(|| format!("document root {} is not accessible", cfg.root.display()))?;

    info!(
        bind = %cfg.bind,
        port = cfg.port,
        backend = %cfg.backend,
        root = %root.display(),
        "starting server"
    );

    let ctx = Arc::new(ServeContext::new(root, cfg.tuning.clone()));
    server::run(&cfg, ctx)
}
