//! TLS acceptor that picks its certificate from the ClientHello SNI

use crate::resolver::CertificateResolver;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

#[derive(Clone)]
pub struct SniAcceptor {
    resolver: Arc<CertificateResolver>,
}

impl SniAcceptor {
    pub fn new(resolver: Arc<CertificateResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<CertificateResolver> {
        &self.resolver
    }

    /// Read the ClientHello, resolve a configuration for its server name
    /// and complete the handshake
    pub async fn accept<IO>(&self, stream: IO) -> io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
        let server_name = start.client_hello().server_name().map(str::to_string);
        debug!("TLS ClientHello for {:?}", server_name);

        let config = self.resolver.resolve(server_name.as_deref()).await;
        start.into_stream(config).await
    }
}
