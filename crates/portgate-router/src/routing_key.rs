//! Routing keys derived from an edge request

use crate::host::{is_ip_literal, is_under_domain, normalize_host, subdomain_of};
use http::header::HOST;
use http::{HeaderMap, Uri};

/// Query parameter selecting an instance by its published public host
pub const PUBLIC_HOST_PARAM: &str = "public-host";

/// Instance metadata key matched against [`PUBLIC_HOST_PARAM`]
pub const PUBLIC_HOST_METADATA: &str = "public-host";

/// The parts of a request ownership routing looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub host: Option<String>,
    pub query: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Build from a request's URI and headers. The Host header wins over
    /// the URI authority.
    pub fn from_parts(uri: &Uri, headers: &HeaderMap) -> Self {
        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()));

        Self {
            host,
            query: uri.query().map(str::to_string),
        }
    }

    /// First value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// What an edge request is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingKey {
    /// Explicit instance selection by published public host
    PublicHost(String),
    /// Tenant subdomain under the platform base domain
    Subdomain(String),
    /// Customer-owned domain
    CustomDomain(String),
}

impl RoutingKey {
    /// Derive a key, or `None` when the request names no tunnel.
    ///
    /// A non-empty `public-host` query parameter wins. Otherwise the Host
    /// header is used: names below `base_domain` yield their first label,
    /// other names are custom domains. The bare base domain and IP
    /// literals yield no key.
    pub fn extract(ctx: &RequestContext, base_domain: &str) -> Option<Self> {
        if let Some(public_host) = ctx
            .query_param(PUBLIC_HOST_PARAM)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
        {
            return Some(RoutingKey::PublicHost(public_host));
        }

        let host = normalize_host(ctx.host.as_deref()?)?;
        if is_ip_literal(&host) {
            return None;
        }
        if is_under_domain(&host, base_domain) {
            return subdomain_of(&host, base_domain).map(RoutingKey::Subdomain);
        }
        Some(RoutingKey::CustomDomain(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const BASE: &str = "portgate.dev";

    fn key(host: &str) -> Option<RoutingKey> {
        RoutingKey::extract(&RequestContext::new().with_host(host), BASE)
    }

    #[test]
    fn test_subdomain_key() {
        assert_eq!(key("shop.portgate.dev"), Some(RoutingKey::Subdomain("shop".into())));
        assert_eq!(key("Shop.Portgate.Dev:443"), Some(RoutingKey::Subdomain("shop".into())));
    }

    #[test]
    fn test_custom_domain_key() {
        assert_eq!(
            key("www.customer.io:8080"),
            Some(RoutingKey::CustomDomain("www.customer.io".into()))
        );
        // suffix match is per label
        assert_eq!(
            key("evilportgate.dev"),
            Some(RoutingKey::CustomDomain("evilportgate.dev".into()))
        );
    }

    #[test]
    fn test_no_key() {
        assert_eq!(key("portgate.dev"), None);
        assert_eq!(key("127.0.0.1:8080"), None);
        assert_eq!(key(""), None);
        assert_eq!(RoutingKey::extract(&RequestContext::new(), BASE), None);
    }

    #[test]
    fn test_public_host_param_wins() {
        let ctx = RequestContext::new()
            .with_host("shop.portgate.dev")
            .with_query("a=1&public-host=net-eu.portgate.dev");
        assert_eq!(
            RoutingKey::extract(&ctx, BASE),
            Some(RoutingKey::PublicHost("net-eu.portgate.dev".into()))
        );

        let empty = RequestContext::new()
            .with_host("shop.portgate.dev")
            .with_query("public-host=");
        assert_eq!(
            RoutingKey::extract(&empty, BASE),
            Some(RoutingKey::Subdomain("shop".into()))
        );
    }

    #[test]
    fn test_query_param_decoding() {
        let ctx = RequestContext::new().with_query("public-host=net%2Deu.example.com&x");
        assert_eq!(ctx.query_param("public-host").as_deref(), Some("net-eu.example.com"));
        assert_eq!(ctx.query_param("missing"), None);
    }

    #[test]
    fn test_from_parts() {
        let uri: Uri = "http://fallback.portgate.dev/path?public-host=x".parse().unwrap();
        let mut headers = HeaderMap::new();
        let ctx = RequestContext::from_parts(&uri, &headers);
        assert_eq!(ctx.host.as_deref(), Some("fallback.portgate.dev"));
        assert_eq!(ctx.query.as_deref(), Some("public-host=x"));

        headers.insert(HOST, HeaderValue::from_static("api.portgate.dev"));
        let ctx = RequestContext::from_parts(&uri, &headers);
        assert_eq!(ctx.host.as_deref(), Some("api.portgate.dev"));
    }
}
