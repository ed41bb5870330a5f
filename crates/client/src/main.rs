mod backoff;
mod config;
mod forwarder;
mod stats;

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use mimalloc::MiMalloc;
use tokio::sync::watch;

use config::{Cli, Config};
use stats::Stats;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    simple_logger::init_with_level(
        config
            .log_level
            .parse()
            .unwrap_or(log::Level::Info),
    )
    .ok();

    info!(
        "tunnel client starting: relay={}:{} local_port={}",
        config.relay_host, config.relay_port, config.local_port
    );

    let stats = Arc::new(Stats::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn({
        let stats = stats.clone();
        async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let snapshot = stats.snapshot();
                info!(
                    "stats: connected={} requests={} errors={} reconnects={}",
                    snapshot.connected, snapshot.requests, snapshot.errors, snapshot.reconnects
                );
            }
        }
    });

    let forwarder = tokio::spawn(forwarder::run(config, stats, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }

    info!("shutdown requested, draining control connection");
    let _ = shutdown_tx.send(true);
    let _ = forwarder.await;
}
