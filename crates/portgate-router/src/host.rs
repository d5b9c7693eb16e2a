//! Hostname helpers shared by routing and ingress

use std::net::IpAddr;

/// Lower-case a Host header value and strip its port and trailing dot.
///
/// Bracketed IPv6 literals keep their address: `[::1]:8080` becomes `::1`.
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    // X-Forwarded-Host may carry a list; the first entry is the client's
    let host = host.split(',').next().unwrap_or(host).trim();

    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// True when `host` is `base_domain` itself or any name below it
pub fn is_under_domain(host: &str, base_domain: &str) -> bool {
    let base_domain = base_domain.trim_end_matches('.');
    if base_domain.is_empty() {
        return false;
    }
    let (host, base) = (host.as_bytes(), base_domain.as_bytes());
    host.eq_ignore_ascii_case(base)
        || (host.len() > base.len()
            && host[host.len() - base.len() - 1] == b'.'
            && host[host.len() - base.len()..].eq_ignore_ascii_case(base))
}

/// First label of a host strictly below `base_domain`
pub fn subdomain_of(host: &str, base_domain: &str) -> Option<String> {
    if host.eq_ignore_ascii_case(base_domain.trim_end_matches('.'))
        || !is_under_domain(host, base_domain)
    {
        return None;
    }
    host.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(|label| label.to_ascii_lowercase())
}
