//! Relay command-line configuration

use clap::Parser;
use portgate_control::RegistryConfig;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// A customer domain served by a tunnel subdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDomain {
    pub domain: String,
    pub subdomain: String,
}

/// Parse `domain=subdomain`
pub fn parse_custom_domain(value: &str) -> Result<CustomDomain, String> {
    let (domain, subdomain) = value
        .split_once('=')
        .ok_or_else(|| format!("expected domain=subdomain, got '{}'", value))?;
    let (domain, subdomain) = (domain.trim(), subdomain.trim());
    if domain.is_empty() || subdomain.is_empty() {
        return Err(format!("expected domain=subdomain, got '{}'", value));
    }
    Ok(CustomDomain {
        domain: domain.to_ascii_lowercase(),
        subdomain: subdomain.to_ascii_lowercase(),
    })
}

#[derive(Parser, Debug, Clone)]
#[command(name = "portgate-relay")]
#[command(about = "Run a tunnel relay instance", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
pub struct RelayArgs {
    /// HTTP bind address for control channels, the API and ingress
    #[arg(long, env = "PORTGATE_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Host advertised to clients for TCP/UDP tunnels
    #[arg(long, env = "PORTGATE_PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Base domain HTTP tunnels are served under ({subdomain}.{base_domain})
    #[arg(long, env = "PORTGATE_BASE_DOMAIN", default_value = "localhost")]
    pub base_domain: String,

    /// Address public TCP/UDP listeners bind on
    #[arg(long, env = "PORTGATE_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Custom domain mapping, repeatable (e.g., --custom-domain www.customer.io=shop)
    #[arg(long = "custom-domain", value_parser = parse_custom_domain)]
    pub custom_domains: Vec<CustomDomain>,

    /// Seconds an HTTP request waits for the tunnel client's response
    #[arg(long, env = "PORTGATE_FORWARD_TIMEOUT_SECS", default_value = "30")]
    pub forward_timeout_secs: u64,

    /// Seconds a UDP peer may stay silent before it is dropped
    #[arg(long, env = "PORTGATE_UDP_IDLE_SECS", default_value = "120")]
    pub udp_idle_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PORTGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl RelayArgs {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new()
            .with_listen_host(self.listen_host)
            .with_public_host(&self.public_host)
            .with_base_domain(self.base_domain.to_ascii_lowercase())
            .with_forward_timeout(Duration::from_secs(self.forward_timeout_secs))
            .with_udp_idle_timeout(Duration::from_secs(self.udp_idle_secs))
    }
}
