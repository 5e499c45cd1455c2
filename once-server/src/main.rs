//! OnceServe binary: resolves configuration from the environment, installs
//! the payment handler, and serves until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use once_server::handler::PaymentHandler;
use once_server::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = once_common::ServerConfig::from_env();
    tracing::info!(?config, "starting");

    let server = Server::bind(config, Arc::new(PaymentHandler)).context("failed to start server")?;
    let signal = server.shutdown_signal();

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            return;
        }
        signal.request_shutdown();
    });

    server.serve().await.context("server failed")?;
    Ok(())
}
