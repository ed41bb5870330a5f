pub mod alias;
pub mod config;
pub mod error;
pub mod identity;
#[cfg(feature = "prometheus")]
pub mod metrics;
pub mod ratelimit;
pub mod server;

use std::sync::Arc;

use config::Config;
use server::SharedState;
use tokio::net::TcpListener;

/// Binds both listeners and runs the relay until a ctrl-c shutdown signal.
/// Exposed as a function (rather than folded into `main`) so integration
/// tests can start the relay on ephemeral ports.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let state = Arc::new(SharedState::new(config.clone()));

    let control_listener = TcpListener::bind(config.control_addr).await?;
    let ingress_listener = TcpListener::bind(config.http_addr).await?;

    log::info!(
        "relay starting: run_id={} control={} http={}",
        state.run_id,
        config.control_addr,
        config.http_addr
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let control = tokio::spawn(server::control::run(
        control_listener,
        state.clone(),
        shutdown_rx.clone(),
    ));
    let ingress = tokio::spawn(server::ingress::run(
        ingress_listener,
        state.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutdown requested, draining in-flight requests");
    let _ = shutdown_tx.send(true);
    server::control::shutdown_registrations(&state);

    if let Err(e) = control.await {
        log::error!("control channel task panicked: {e}");
    }
    match ingress.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("ingress server exited: {e}"),
        Err(e) => log::error!("ingress task panicked: {e}"),
    }

    Ok(())
}
