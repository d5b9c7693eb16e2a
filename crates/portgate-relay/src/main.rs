//! Portgate relay (proxy instance)
//!
//! Accepts tunnel clients' control WebSockets, binds public TCP/UDP ports
//! for them and serves HTTP ingress for HTTP tunnels.

use anyhow::{Context, Result};
use clap::Parser;
use portgate_control::TunnelRegistry;
use portgate_relay::{build_router, AppState, RelayArgs};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let args = RelayArgs::parse();
    init_logging(&args.log_level)?;

    info!("Starting portgate relay {} ({})", env!("GIT_TAG"), env!("GIT_HASH"));
    info!("HTTP endpoint: {}", args.http_addr);
    info!("Public host: {}", args.public_host);
    info!("Base domain: {}", args.base_domain);

    let registry = Arc::new(TunnelRegistry::new(args.registry_config()));
    let state = AppState::new(registry.clone()).with_custom_domains(&args.custom_domains);
    for mapping in &args.custom_domains {
        info!("Custom domain {} -> {}", mapping.domain, mapping.subdomain);
    }

    let listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.http_addr))?;
    info!("Relay listening on {}", listener.local_addr()?);

    let app = build_router(state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping relay..."),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }

    server_handle.abort();
    registry.shutdown().await;
    info!("Relay stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
