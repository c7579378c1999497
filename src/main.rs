//! ⚡ liveproxy — live-reload proxy for local development servers
//!
//! Usage:
//!   liveproxy                                   # proxy localhost:8000, watch static + templates
//!   liveproxy --proxy localhost:5000 --files "src/**/*.html" --open
//!   liveproxy --config dev/liveproxy.json --notify

use anyhow::{Context, Result};
use clap::Parser;
use liveproxy::{logger, server, Cli, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init_logger(cli.verbose, cli.quiet);

    // Install rustls crypto provider (ring) before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = Config::load(&cli).context("Failed to load configuration")?;
    server::run(config).await
}
