use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use linkemu::clock::TscClock;
use linkemu::packet::PacketPool;
use linkemu::port::{AfPacketPort, Port, wait_for_link};
use linkemu::runtime::{self, Emulator};
use linkemu::stage::Shutdown;
use linkemu::{Cli, Pipeline};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Cli::parse()
        .into_config()
        .context("invalid configuration")?;
    runtime::check_cores(&config)?;

    runtime::install_signal_handlers();

    let pool = PacketPool::new(config.pool_size);
    info!(buffers = pool.capacity(), "packet pool ready");

    let mut ports: Vec<Arc<dyn Port>> = Vec::with_capacity(config.port_count());
    for name in config.port_names() {
        let port = AfPacketPort::open(&name, pool.clone())
            .with_context(|| format!("cannot bring up port {name}"))?;
        ports.push(Arc::new(port));
    }
    if !wait_for_link(&config.port_names(), config.link_wait, runtime::signalled) {
        warn!("not every link is up, starting anyway");
    }

    let clock = TscClock::new();
    let shutdown = Shutdown::new();
    let pipeline = Pipeline::build(&config, ports, clock, &shutdown)?;
    Emulator::new(&config, pipeline, shutdown)?.run()?;

    info!("bye");
    Ok(())
}
