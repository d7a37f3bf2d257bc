use anyhow::Result;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod state;

use config::{GatewayConfig, LogFormat};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(config.log_format);

    info!("Starting ipam-gateway...");

    let state = Arc::new(AppState::from_config(&config).await?);
    info!(
        "Loaded {} IP ranges and {} routers",
        state.registry.pool_count().await,
        state.coordinator.controller().routers().await.len()
    );
    info!(
        "Router calls: timeout {:?}, {} retries",
        config.router.call_policy().timeout,
        config.router.max_retries
    );

    let listener = TcpListener::bind(&config.listen).await?;
    info!("HTTP server listening on {}", config.listen);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| api::handle_request(req, state.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}
