//! Shared handler state

use crate::config::CustomDomain;
use portgate_control::TunnelRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self { registry }
    }

    /// Load configured custom domains into the registry
    pub fn with_custom_domains(self, domains: &[CustomDomain]) -> Self {
        for mapping in domains {
            self.registry
                .register_custom_domain(&mapping.domain, &mapping.subdomain);
        }
        self
    }

    pub fn base_domain(&self) -> &str {
        &self.registry.config().base_domain
    }
}
