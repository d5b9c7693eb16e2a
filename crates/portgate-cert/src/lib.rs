//! TLS certificate selection for the public edge
//!
//! Certificates are issued and stored by an external certificate service;
//! this crate asks it where the files for a domain live, builds a rustls
//! configuration from them and caches the result per SNI name. Anything
//! that goes wrong falls back to a default certificate so handshakes
//! always have something to present.

pub mod acceptor;
pub mod chain;
pub mod lookup;
pub mod resolver;
pub mod self_signed;

use thiserror::Error;

pub use acceptor::SniAcceptor;
pub use lookup::{CertificateLookup, CertificatePaths, HttpCertificateLookup, LookupOutcome};
pub use resolver::{CertificateResolver, ResolverConfig};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(String),
}
