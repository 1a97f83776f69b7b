use std::net::SocketAddr;

use anyhow::Context;
use ringserve::signal::install_signal_handler;
use ringserve::{Echo, Server, ServerConfig, Strategy};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::default();
    let mut args = std::env::args().skip(1);
    if let Some(addr) = args.next() {
        config.listen_addr = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address {addr}"))?;
    }
    if let Some(workers) = args.next() {
        config.workers = workers
            .parse()
            .with_context(|| format!("invalid worker count {workers}"))?;
    }
    if let Some(strategy) = args.next() {
        config.strategy = strategy.parse::<Strategy>()?;
    }

    let shutdown = install_signal_handler().context("installing signal handler")?;
    let server = Server::start(config, |_| Echo).context("starting server")?;
    info!(addr = %server.local_addr(), "echo server listening");

    server.wait(&shutdown).context("shutting down")?;
    Ok(())
}
