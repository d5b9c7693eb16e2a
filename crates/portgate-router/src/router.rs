//! Ownership router
//!
//! Picks the relay instance for an edge request without shared state:
//! probe every candidate concurrently, take the first that claims the
//! tunnel, otherwise fall back to the first candidate. A wrong fallback
//! answers 404 for a tunnel it does not hold, which is acceptable.

use crate::probe::{Instance, OwnershipProbe};
use crate::routing_key::{RequestContext, RoutingKey};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct OwnershipRouter {
    probe: Arc<dyn OwnershipProbe>,
    base_domain: String,
    probe_timeout: Duration,
    next: AtomicUsize,
}

impl OwnershipRouter {
    pub fn new(probe: Arc<dyn OwnershipProbe>, base_domain: impl Into<String>) -> Self {
        Self {
            probe,
            base_domain: base_domain.into(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            next: AtomicUsize::new(0),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Choose the instance for a request.
    ///
    /// Only an empty candidate list yields `None`; every other outcome,
    /// including probe timeouts and errors, resolves to some candidate.
    pub async fn choose(&self, candidates: &[Instance], ctx: &RequestContext) -> Option<Instance> {
        if candidates.is_empty() {
            return None;
        }

        let chosen = match RoutingKey::extract(ctx, &self.base_domain) {
            None => self.round_robin(candidates),
            Some(RoutingKey::PublicHost(public_host)) => {
                match_public_host(candidates, &public_host).unwrap_or(&candidates[0])
            }
            Some(key) => match self.find_owner(candidates, &key).await {
                Some(owner) => owner,
                None => {
                    debug!("No instance claimed {:?}, using {}", key, candidates[0].id);
                    &candidates[0]
                }
            },
        };
        Some(chosen.clone())
    }

    fn round_robin<'a>(&self, candidates: &'a [Instance]) -> &'a Instance {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        &candidates[index]
    }

    /// Probe all candidates at once; the first affirmative answer wins
    async fn find_owner<'a>(
        &self,
        candidates: &'a [Instance],
        key: &RoutingKey,
    ) -> Option<&'a Instance> {
        let mut probes: FuturesUnordered<_> = candidates
            .iter()
            .map(|instance| async move {
                match tokio::time::timeout(self.probe_timeout, self.probe.owns(instance, key)).await
                {
                    Ok(true) => Some(instance),
                    Ok(false) => None,
                    Err(_) => {
                        debug!("Ownership probe to {} timed out", instance.id);
                        None
                    }
                }
            })
            .collect();

        while let Some(answer) = probes.next().await {
            if let Some(owner) = answer {
                debug!("Instance {} owns {:?}", owner.id, key);
                return Some(owner);
            }
        }
        None
    }
}

/// Case-insensitive match on published `public-host` metadata
fn match_public_host<'a>(candidates: &'a [Instance], public_host: &str) -> Option<&'a Instance> {
    candidates.iter().find(|instance| {
        instance
            .public_host()
            .is_some_and(|host| host.eq_ignore_ascii_case(public_host))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Probe answering from a fixed table, with optional per-instance delay
    #[derive(Default)]
    struct ScriptedProbe {
        owners: HashSet<String>,
        delays: HashMap<String, Duration>,
        calls: AtomicUsize,
        seen_keys: Mutex<Vec<RoutingKey>>,
    }

    impl ScriptedProbe {
        fn owned_by(ids: &[&str]) -> Self {
            Self {
                owners: ids.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            }
        }

        fn with_delay(mut self, id: &str, delay: Duration) -> Self {
            self.delays.insert(id.to_string(), delay);
            self
        }
    }

    #[async_trait]
    impl OwnershipProbe for ScriptedProbe {
        async fn owns(&self, instance: &Instance, key: &RoutingKey) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_keys.lock().unwrap().push(key.clone());
            if let Some(delay) = self.delays.get(&instance.id) {
                tokio::time::sleep(*delay).await;
            }
            self.owners.contains(&instance.id)
        }
    }

    fn instances() -> Vec<Instance> {
        vec![
            Instance::new("a", "http://10.0.0.1:8080").with_public_host("net-a.portgate.dev"),
            Instance::new("b", "http://10.0.0.2:8080").with_public_host("net-b.portgate.dev"),
            Instance::new("c", "http://10.0.0.3:8080"),
        ]
    }

    fn router(probe: Arc<ScriptedProbe>) -> OwnershipRouter {
        OwnershipRouter::new(probe, "portgate.dev")
    }

    fn host(host: &str) -> RequestContext {
        RequestContext::new().with_host(host)
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let router = router(Arc::new(ScriptedProbe::default()));
        assert_eq!(router.choose(&[], &host("shop.portgate.dev")).await, None);
        assert_eq!(router.choose(&[], &RequestContext::new()).await, None);
    }

    #[tokio::test]
    async fn test_round_robin_without_key() {
        let probe = Arc::new(ScriptedProbe::default());
        let router = router(probe.clone());
        let candidates = instances();

        let mut seen = HashSet::new();
        for _ in 0..candidates.len() * 3 {
            let chosen = router.choose(&candidates, &host("portgate.dev")).await.unwrap();
            seen.insert(chosen.id);
        }
        assert_eq!(seen.len(), candidates.len());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_public_host_match_skips_probe() {
        let probe = Arc::new(ScriptedProbe::default());
        let router = router(probe.clone());
        let ctx = host("anything.portgate.dev").with_query("public-host=NET-B.portgate.dev");

        let chosen = router.choose(&instances(), &ctx).await.unwrap();
        assert_eq!(chosen.id, "b");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_public_host_no_match_falls_back_to_first() {
        let probe = Arc::new(ScriptedProbe::default());
        let router = router(probe.clone());
        let ctx = RequestContext::new().with_query("public-host=net-zz.portgate.dev");

        for _ in 0..3 {
            let chosen = router.choose(&instances(), &ctx).await.unwrap();
            assert_eq!(chosen.id, "a");
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_finds_owner() {
        let probe = Arc::new(ScriptedProbe::owned_by(&["c"]));
        let router = router(probe.clone());

        let chosen = router
            .choose(&instances(), &host("shop.portgate.dev:443"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "c");
        assert_eq!(
            probe.seen_keys.lock().unwrap()[0],
            RoutingKey::Subdomain("shop".into())
        );
    }

    #[tokio::test]
    async fn test_custom_domain_probe() {
        let probe = Arc::new(ScriptedProbe::owned_by(&["b"]));
        let router = router(probe.clone());

        let chosen = router
            .choose(&instances(), &host("www.customer.io"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "b");
        assert!(probe
            .seen_keys
            .lock()
            .unwrap()
            .iter()
            .all(|key| *key == RoutingKey::CustomDomain("www.customer.io".into())));
    }

    #[tokio::test]
    async fn test_no_owner_falls_back_to_first() {
        let probe = Arc::new(ScriptedProbe::default());
        let router = router(probe.clone());

        let chosen = router
            .choose(&instances(), &host("ghost.portgate.dev"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "a");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_owner_times_out() {
        let probe = Arc::new(
            ScriptedProbe::owned_by(&["b"]).with_delay("b", Duration::from_secs(2)),
        );
        let router = router(probe);

        let chosen = router
            .choose(&instances(), &host("shop.portgate.dev"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_run_concurrently() {
        let probe = Arc::new(
            ScriptedProbe::owned_by(&["c"])
                .with_delay("a", Duration::from_millis(300))
                .with_delay("b", Duration::from_millis(300))
                .with_delay("c", Duration::from_millis(300)),
        );
        let router = router(probe);

        let started = tokio::time::Instant::now();
        let chosen = router
            .choose(&instances(), &host("shop.portgate.dev"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "c");
        assert!(started.elapsed() < DEFAULT_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_first_affirmative_wins() {
        let probe = Arc::new(
            ScriptedProbe::owned_by(&["a", "b"]).with_delay("a", Duration::from_millis(200)),
        );
        let router = router(probe);

        let chosen = router
            .choose(&instances(), &host("shop.portgate.dev"))
            .await
            .unwrap();
        assert_eq!(chosen.id, "b");
    }
}
