//! SNI certificate resolver
//!
//! Maps a TLS server name to a rustls configuration. Names under the base
//! domain share the wildcard certificate. Successful loads are cached for
//! an hour in a bounded LRU; concurrent handshakes for the same name wait
//! on one lookup.

use crate::chain::{load_pem_pair, load_server_config, server_config};
use crate::lookup::{CertificateLookup, LookupOutcome};
use crate::self_signed::{fallback_names, generate_self_signed_cert};
use crate::CertError;
use lru::LruCache;
use rustls::ServerConfig;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub base_domain: String,
    pub fallback_cert: Option<PathBuf>,
    pub fallback_key: Option<PathBuf>,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl ResolverConfig {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            fallback_cert: None,
            fallback_key: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_fallback_pair(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.fallback_cert = Some(cert.into());
        self.fallback_key = Some(key.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

#[derive(Clone)]
struct Resolved {
    config: Arc<ServerConfig>,
    cacheable: bool,
}

struct CacheEntry {
    cell: Arc<OnceCell<Resolved>>,
    created: Instant,
}

pub struct CertificateResolver {
    lookup: Arc<dyn CertificateLookup>,
    base_domain: String,
    cache_ttl: Duration,
    cache: Mutex<LruCache<String, CacheEntry>>,
    fallback: Arc<ServerConfig>,
}

impl CertificateResolver {
    /// Create a resolver, building the fallback configuration up front.
    ///
    /// A configured fallback pair that fails to load is replaced by a
    /// self-signed certificate; only a failure of that is an error.
    pub fn new(lookup: Arc<dyn CertificateLookup>, config: ResolverConfig) -> Result<Self, CertError> {
        let base_domain = config.base_domain.trim_end_matches('.').to_ascii_lowercase();
        let fallback = Arc::new(build_fallback(&config, &base_domain)?);
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            lookup,
            base_domain,
            cache_ttl: config.cache_ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            fallback,
        })
    }

    pub fn fallback(&self) -> Arc<ServerConfig> {
        self.fallback.clone()
    }

    /// Cache and lookup key for a server name
    pub fn lookup_key(&self, server_name: &str) -> String {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();
        if !self.base_domain.is_empty()
            && (name == self.base_domain || name.ends_with(&format!(".{}", self.base_domain)))
        {
            return format!("*.{}", self.base_domain);
        }
        name
    }

    /// Configuration for a handshake. Never fails: missing names, unknown
    /// domains and lookup or load errors all yield the fallback.
    pub async fn resolve(&self, server_name: Option<&str>) -> Arc<ServerConfig> {
        let Some(name) = server_name.map(str::trim).filter(|name| !name.is_empty()) else {
            return self.fallback.clone();
        };
        let key = self.lookup_key(name);

        let cell = self.cell_for(&key);
        let resolved = cell.get_or_init(|| self.load(&key)).await.clone();

        if !resolved.cacheable {
            self.evict_if_current(&key, &cell);
        }
        resolved.config
    }

    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cell_for(&self, key: &str) -> Arc<OnceCell<Resolved>> {
        let mut cache = self.cache();
        if let Some(entry) = cache.get(key) {
            if entry.created.elapsed() < self.cache_ttl {
                return entry.cell.clone();
            }
            debug!("Certificate for {} expired", key);
        }

        let cell = Arc::new(OnceCell::new());
        cache.put(
            key.to_string(),
            CacheEntry {
                cell: cell.clone(),
                created: Instant::now(),
            },
        );
        cell
    }

    fn evict_if_current(&self, key: &str, cell: &Arc<OnceCell<Resolved>>) {
        let mut cache = self.cache();
        let current = cache
            .peek(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.cell, cell));
        if current {
            cache.pop(key);
        }
    }

    async fn load(&self, key: &str) -> Resolved {
        let fallback = Resolved {
            config: self.fallback.clone(),
            cacheable: false,
        };

        match self.lookup.lookup(key).await {
            LookupOutcome::Found(paths) => match load_server_config(&paths) {
                Ok(config) => {
                    info!("Loaded certificate for {}", key);
                    Resolved {
                        config: Arc::new(config),
                        cacheable: true,
                    }
                }
                Err(e) => {
                    error!("Failed to load certificate for {}, using fallback: {}", key, e);
                    fallback
                }
            },
            LookupOutcome::NotFound => {
                warn!("No certificate found for {}, using fallback", key);
                fallback
            }
            LookupOutcome::Error(e) => {
                error!("Certificate lookup for {} failed, using fallback: {}", key, e);
                fallback
            }
        }
    }
}

fn build_fallback(config: &ResolverConfig, base_domain: &str) -> Result<ServerConfig, CertError> {
    if let (Some(cert), Some(key)) = (&config.fallback_cert, &config.fallback_key) {
        info!(
            "Loading fallback certificate from {} and {}",
            cert.display(),
            key.display()
        );
        match load_pem_pair(cert, key) {
            Ok(server) => return Ok(server),
            Err(e) => error!("Failed to load fallback certificate, generating one: {}", e),
        }
    } else {
        info!("No fallback certificate configured, generating a self-signed one");
    }

    let names = fallback_names(base_domain);
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let generated = generate_self_signed_cert(&names)?;
    server_config(vec![generated.cert_der], generated.key_der)
}
