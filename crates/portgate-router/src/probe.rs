//! Ownership probes
//!
//! An ownership probe asks one instance directly whether it currently
//! holds the tunnel a routing key names. Answers are hints: ownership can
//! move right after the probe returns.

use crate::routing_key::{RoutingKey, PUBLIC_HOST_METADATA};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// A relay instance the edge can forward to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    /// Base URL for direct instance-to-instance calls, e.g. `http://10.0.0.5:8080`
    pub base_url: String,
    pub metadata: HashMap<String, String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_public_host(self, public_host: impl Into<String>) -> Self {
        self.with_metadata(PUBLIC_HOST_METADATA, public_host)
    }

    pub fn public_host(&self) -> Option<&str> {
        self.metadata.get(PUBLIC_HOST_METADATA).map(String::as_str)
    }
}

/// Answers "does this instance own the tunnel for `key`?"
#[async_trait]
pub trait OwnershipProbe: Send + Sync {
    async fn owns(&self, instance: &Instance, key: &RoutingKey) -> bool;
}

/// Probe over the instance's HTTP API: `GET /resolve/{subdomain}` or
/// `GET /resolve-custom/{domain}`, where any 2xx means owned
#[derive(Clone)]
pub struct HttpOwnershipProbe {
    client: reqwest::Client,
}

impl HttpOwnershipProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// URL asked for `key`; public-host keys are never probed
    pub fn probe_url(instance: &Instance, key: &RoutingKey) -> Option<String> {
        match key {
            RoutingKey::Subdomain(subdomain) => {
                Some(format!("{}/resolve/{}", instance.base_url, subdomain))
            }
            RoutingKey::CustomDomain(domain) => {
                Some(format!("{}/resolve-custom/{}", instance.base_url, domain))
            }
            RoutingKey::PublicHost(_) => None,
        }
    }
}

#[async_trait]
impl OwnershipProbe for HttpOwnershipProbe {
    async fn owns(&self, instance: &Instance, key: &RoutingKey) -> bool {
        let Some(url) = Self::probe_url(instance, key) else {
            return false;
        };

        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Ownership probe {} failed: {}", url, e);
                false
            }
        }
    }
}
