//! Portgate edge (public TLS front door)

use anyhow::{Context, Result};
use clap::Parser;
use portgate_cert::{CertificateResolver, HttpCertificateLookup, ResolverConfig, SniAcceptor};
use portgate_edge::{
    build_http_router, build_https_router, serve_https, EdgeArgs, EdgeState, RedirectState,
};
use portgate_router::{HttpOwnershipProbe, OwnershipRouter};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Install the rustls provider before any client or server config is built
    if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    let args = EdgeArgs::parse();
    init_logging(&args.log_level)?;

    info!("Starting portgate edge {} ({})", env!("GIT_TAG"), env!("GIT_HASH"));
    info!("HTTPS endpoint: {}", args.https_addr);
    info!("HTTP endpoint: {}", args.http_addr);
    info!("Base domain: {}", args.base_domain);
    info!("Certificate service: {}", args.ssl_service_url);
    if args.instances.is_empty() {
        warn!("No relay instances configured, every request will fail with 503");
    }
    for instance in &args.instances {
        match instance.public_host() {
            Some(public_host) => info!("Instance {} ({})", instance.id, public_host),
            None => info!("Instance {}", instance.id),
        }
    }

    let mut resolver_config = ResolverConfig::new(args.base_domain.clone());
    if let (Some(cert), Some(key)) = (&args.fallback_cert, &args.fallback_key) {
        resolver_config = resolver_config.with_fallback_pair(cert.clone(), key.clone());
    }
    let lookup = Arc::new(HttpCertificateLookup::new(args.ssl_service_url.clone()));
    let resolver = CertificateResolver::new(lookup, resolver_config)
        .context("Failed to build fallback certificate")?;
    let acceptor = SniAcceptor::new(Arc::new(resolver));

    let probe = Arc::new(HttpOwnershipProbe::new(args.probe_timeout()));
    let router = Arc::new(
        OwnershipRouter::new(probe, args.base_domain.clone())
            .with_probe_timeout(args.probe_timeout()),
    );
    let https_state = EdgeState::new(router, args.instances.clone());
    let http_state = RedirectState {
        forward: https_state.clone().with_scheme("http"),
        https_port: args.https_addr.port(),
    };

    let https_listener = TcpListener::bind(args.https_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.https_addr))?;
    let http_listener = TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.http_addr))?;

    let https_app = build_https_router(https_state);
    let https_handle = tokio::spawn(async move {
        if let Err(e) = serve_https(https_listener, acceptor, https_app).await {
            error!("HTTPS server error: {}", e);
        }
    });

    info!("HTTP redirect listening on {}", http_listener.local_addr()?);
    let http_app = build_http_router(http_state);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_app).await {
            error!("HTTP server error: {}", e);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping edge..."),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }

    https_handle.abort();
    http_handle.abort();
    info!("Edge stopped");

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
