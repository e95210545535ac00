mod config;
mod console;
mod error;
mod relay;
mod server;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use eagle_common::upstream::UpstreamClient;

use config::Config;
use console::Console;
use error::AppError;
use relay::Relay;
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting eagle-eye relay");

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        base_url = %config.upstream.base_url,
        model = %config.upstream.model,
        timeout_ms = config.upstream.timeout.as_millis(),
        "configuration loaded"
    );

    let upstream = UpstreamClient::new(config.upstream.clone())?;
    let relay = Arc::new(Relay::new(upstream));
    let console = Arc::new(Console::new().map_err(AppError::from)?);
    let app = server::router(AppState::new(relay, console));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "HTTP server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
