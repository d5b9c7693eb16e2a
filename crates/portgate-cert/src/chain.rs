//! Building rustls configurations from PEM files

use crate::lookup::CertificatePaths;
use crate::CertError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

/// ALPN protocols offered by the edge
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

fn read(path: &Path) -> Result<Vec<u8>, CertError> {
    std::fs::read(path).map_err(|source| CertError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// PEM bytes of the certificate chain to present.
///
/// A full-chain file wins. Otherwise the leaf certificate is followed by
/// the intermediate chain when one is given.
pub fn chain_pem(paths: &CertificatePaths) -> Result<Vec<u8>, CertError> {
    if let Some(full_chain) = &paths.full_chain_path {
        return read(full_chain);
    }

    let mut pem = read(&paths.certificate_path)?;
    if let Some(chain) = &paths.chain_path {
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&read(chain)?);
    }
    Ok(pem)
}

pub fn parse_certs(pem: &[u8], source: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source_err| CertError::Io {
            path: source.to_string(),
            source: source_err,
        })?;
    if certs.is_empty() {
        return Err(CertError::NoCertificates(source.to_string()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8], source: &str) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source_err| CertError::Io {
            path: source.to_string(),
            source: source_err,
        })?
        .ok_or_else(|| CertError::NoPrivateKey(source.to_string()))
}

/// Server configuration for a certificate chain and key, offering h2 and HTTP/1.1
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, CertError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Load the files a lookup returned into a server configuration
pub fn load_server_config(paths: &CertificatePaths) -> Result<ServerConfig, CertError> {
    let chain = chain_pem(paths)?;
    let certs = parse_certs(&chain, &paths.domain)?;
    let key_pem = read(&paths.private_key_path)?;
    let key = parse_private_key(&key_pem, &paths.private_key_path.display().to_string())?;
    server_config(certs, key)
}

/// Load a certificate/key pair from two PEM files
pub fn load_pem_pair(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, CertError> {
    let certs = parse_certs(&read(cert_path)?, &cert_path.display().to_string())?;
    let key = parse_private_key(&read(key_path)?, &key_path.display().to_string())?;
    server_config(certs, key)
}
