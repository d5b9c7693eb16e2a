//! Certificate service client

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the PEM files for one domain live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub domain: String,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub chain_path: Option<PathBuf>,
    pub full_chain_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(CertificatePaths),
    NotFound,
    Error(String),
}

#[async_trait]
pub trait CertificateLookup: Send + Sync {
    /// Look up the certificate for a lookup domain (`*.example.com` or a host name)
    async fn lookup(&self, domain: &str) -> LookupOutcome;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateResponse {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    certificate_path: Option<String>,
    #[serde(default)]
    private_key_path: Option<String>,
    #[serde(default)]
    chain_path: Option<String>,
    #[serde(default)]
    full_chain_path: Option<String>,
}

impl CertificateResponse {
    fn into_paths(self, requested: &str) -> Option<CertificatePaths> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Some(CertificatePaths {
            domain: self.domain.unwrap_or_else(|| requested.to_string()),
            certificate_path: non_empty(self.certificate_path)?.into(),
            private_key_path: non_empty(self.private_key_path)?.into(),
            chain_path: non_empty(self.chain_path).map(PathBuf::from),
            full_chain_path: non_empty(self.full_chain_path).map(PathBuf::from),
        })
    }
}

/// `GET {service}/api/certificates/{domain}`
#[derive(Clone)]
pub struct HttpCertificateLookup {
    client: reqwest::Client,
    service_url: String,
}

impl HttpCertificateLookup {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self::with_timeout(service_url, DEFAULT_LOOKUP_TIMEOUT)
    }

    pub fn with_timeout(service_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            service_url: service_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn certificate_url(&self, domain: &str) -> String {
        format!("{}/api/certificates/{}", self.service_url, domain)
    }
}

#[async_trait]
impl CertificateLookup for HttpCertificateLookup {
    async fn lookup(&self, domain: &str) -> LookupOutcome {
        let url = self.certificate_url(domain);
        debug!("Looking up certificate for {} at {}", domain, url);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return LookupOutcome::Error(e.to_string()),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return LookupOutcome::NotFound,
            status => return LookupOutcome::Error(format!("certificate service returned {}", status)),
        }

        match response.json::<CertificateResponse>().await {
            Ok(body) => match body.into_paths(domain) {
                Some(paths) => LookupOutcome::Found(paths),
                None => LookupOutcome::NotFound,
            },
            Err(e) => LookupOutcome::Error(format!("invalid certificate response: {}", e)),
        }
    }
}
