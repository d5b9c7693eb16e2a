//! TLS accept loop serving an axum router over HTTP/1.1 and HTTP/2

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use portgate_cert::SniAcceptor;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Pause after a failed accept (e.g. out of file descriptors)
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept TCP connections, terminate TLS with the SNI-selected certificate
/// and serve `app` on each connection until the listener fails.
pub async fn serve_https(
    listener: TcpListener,
    acceptor: SniAcceptor,
    app: Router,
) -> std::io::Result<()> {
    info!("HTTPS edge listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(app);
            let server = auto::Builder::new(TokioExecutor::new());
            if let Err(e) = server.serve_connection_with_upgrades(io, service).await {
                debug!("Connection from {} ended with error: {}", peer_addr, e);
            }
        });
    }
}
