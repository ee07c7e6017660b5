//! Per-service-key endpoint snapshots.
//!
//! Reads are lock-free: each key owns an `ArcSwapOption<EndpointSnapshot>`
//! that is replaced whole on refresh. Writers for the same key (first
//! population and registry pushes) are serialised by a per-key async mutex,
//! which also makes concurrent first resolvers share one registry fetch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use courier_core::{RawEndpoint, ServiceKey};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{Endpoint, EndpointError};
use crate::traits::{RegistryClient, Transport, TransportRegistry};

// ---------------------------------------------------------------------------
// EndpointSnapshot
// ---------------------------------------------------------------------------

/// Immutable endpoint list for one key at one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    generation: u64,
    endpoints: Arc<[Endpoint]>,
}

impl EndpointSnapshot {
    /// Monotonic across the cache; bumped on every refresh.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[derive(Default)]
struct CacheEntry {
    snapshot: ArcSwapOption<EndpointSnapshot>,
    write_lock: Mutex<()>,
}

// ---------------------------------------------------------------------------
// EndpointCache
// ---------------------------------------------------------------------------

/// Resolves service keys to live endpoint lists.
///
/// Entries are created lazily on first [`resolve`](Self::resolve), refreshed
/// by [`on_registry_change`](Self::on_registry_change) and dropped by
/// [`invalidate`](Self::invalidate). Nothing expires by time and failed
/// fetches are not retried.
pub struct EndpointCache {
    registry: Arc<dyn RegistryClient>,
    transports: Arc<dyn TransportRegistry>,
    entries: DashMap<ServiceKey, Arc<CacheEntry>>,
    generation: AtomicU64,
}

impl fmt::Debug for EndpointCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCache")
            .field("entries", &self.entries.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EndpointCache {
    #[must_use]
    pub fn new(registry: Arc<dyn RegistryClient>, transports: Arc<dyn TransportRegistry>) -> Self {
        Self {
            registry,
            transports,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Current endpoints for `key`, populating the entry on first use.
    ///
    /// # Errors
    ///
    /// - [`EndpointError::UnknownTransport`] when no transport is registered
    ///   under the key's transport name
    /// - [`EndpointError::UnknownService`] when the registry does not know the key
    /// - [`EndpointError::RegistryUnavailable`] when the fetch itself fails
    /// - [`EndpointError::NoEndpoints`] when the current snapshot is empty
    pub async fn resolve(&self, key: &ServiceKey) -> Result<Arc<EndpointSnapshot>, EndpointError> {
        let transport = self.transport_for(key)?;

        loop {
            let entry = Arc::clone(self.entries.entry(key.clone()).or_default().value());
            if let Some(snapshot) = entry.snapshot.load_full() {
                return non_empty(key, snapshot);
            }

            let _guard = entry.write_lock.lock().await;
            // Another resolver may have populated it while we waited.
            if let Some(snapshot) = entry.snapshot.load_full() {
                return non_empty(key, snapshot);
            }
            // Or failed and removed it, or it was invalidated.
            if !self.is_current(key, &entry) {
                continue;
            }

            let fetched = match self.registry.fetch_endpoints(key).await {
                Ok(Some(raw)) => Ok(raw),
                Ok(None) => Err(EndpointError::UnknownService(key.clone())),
                Err(e) => Err(EndpointError::RegistryUnavailable(e)),
            };
            return match fetched {
                Ok(raw) => non_empty(key, self.install(&entry, key, &transport, raw)),
                Err(e) => {
                    self.entries.remove_if(key, |_, current| {
                        Arc::ptr_eq(current, &entry) && current.snapshot.load().is_none()
                    });
                    debug!(%key, error = %e, "endpoint population failed");
                    Err(e)
                }
            };
        }
    }

    /// The cached snapshot for `key`, without contacting the registry.
    #[must_use]
    pub fn snapshot(&self, key: &ServiceKey) -> Option<Arc<EndpointSnapshot>> {
        self.entries.get(key)?.snapshot.load_full()
    }

    /// Applies a registry push for `key`.
    ///
    /// Returns the new generation, or `None` when `key` was never resolved
    /// and the change was ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::UnknownTransport`]; the previous snapshot is
    /// left in place.
    pub async fn on_registry_change(
        &self,
        key: &ServiceKey,
        raw: Vec<RawEndpoint>,
    ) -> Result<Option<u64>, EndpointError> {
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            debug!(%key, "ignoring registry change for unresolved key");
            return Ok(None);
        };
        let transport = self.transport_for(key)?;

        let _guard = entry.write_lock.lock().await;
        // A population still pending when the push arrived may have failed.
        if entry.snapshot.load().is_none() {
            debug!(%key, "ignoring registry change for unpopulated key");
            return Ok(None);
        }
        let snapshot = self.install(&entry, key, &transport, raw);
        Ok(Some(snapshot.generation))
    }

    /// Drops the entry for `key`; the next resolve fetches again.
    pub fn invalidate(&self, key: &ServiceKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!(%key, "endpoint cache entry invalidated");
        }
        removed
    }

    /// Number of keys with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_current(&self, key: &ServiceKey, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    fn transport_for(&self, key: &ServiceKey) -> Result<Arc<dyn Transport>, EndpointError> {
        self.transports.find(key.transport_name()).ok_or_else(|| {
            error!(
                %key,
                transport = key.transport_name(),
                "no transport registered for service key"
            );
            EndpointError::UnknownTransport(key.transport_name().to_string())
        })
    }

    /// Converts `raw` and swaps it in. Caller holds the entry's write lock.
    fn install(
        &self,
        entry: &CacheEntry,
        key: &ServiceKey,
        transport: &Arc<dyn Transport>,
        raw: Vec<RawEndpoint>,
    ) -> Arc<EndpointSnapshot> {
        let total = raw.len();
        let endpoints: Arc<[Endpoint]> = raw
            .into_iter()
            .filter(|r| r.scheme().is_none_or(|s| s == transport.name()))
            .map(|r| Endpoint::new(Arc::clone(transport), r))
            .collect();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let snapshot = Arc::new(EndpointSnapshot {
            generation,
            endpoints,
        });
        entry.snapshot.store(Some(Arc::clone(&snapshot)));
        info!(
            %key,
            generation,
            endpoints = snapshot.endpoints.len(),
            skipped = total - snapshot.endpoints.len(),
            "endpoint snapshot refreshed"
        );
        snapshot
    }
}

fn non_empty(
    key: &ServiceKey,
    snapshot: Arc<EndpointSnapshot>,
) -> Result<Arc<EndpointSnapshot>, EndpointError> {
    if snapshot.is_empty() {
        Err(EndpointError::NoEndpoints(key.clone()))
    } else {
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::endpoint::testing::table;

    /// Registry backed by a fixed map, counting fetches.
    #[derive(Default)]
    pub(crate) struct StaticRegistry {
        pub(crate) services: parking_lot::Mutex<HashMap<ServiceKey, Vec<RawEndpoint>>>,
        pub(crate) fetches: AtomicUsize,
        pub(crate) delay: Option<Duration>,
        pub(crate) fail: bool,
    }

    impl StaticRegistry {
        pub(crate) fn with(key: &ServiceKey, addresses: &[&str]) -> Self {
            let registry = Self::default();
            registry.services.lock().insert(
                key.clone(),
                addresses.iter().map(|a| RawEndpoint::new(*a)).collect(),
            );
            registry
        }
    }

    #[async_trait]
    impl RegistryClient for StaticRegistry {
        async fn fetch_endpoints(
            &self,
            key: &ServiceKey,
        ) -> anyhow::Result<Option<Vec<RawEndpoint>>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("registry offline");
            }
            Ok(self.services.lock().get(key).cloned())
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::new("shop", "orders", "latest", "rest")
    }

    fn cache(registry: StaticRegistry) -> (Arc<StaticRegistry>, EndpointCache) {
        let registry = Arc::new(registry);
        let cache = EndpointCache::new(registry.clone(), table(&["rest", "highway"]));
        (registry, cache)
    }

    #[tokio::test]
    async fn resolve_populates_once_and_filters_schemes() {
        let (registry, cache) = cache(StaticRegistry::with(
            &key(),
            &["rest://10.0.0.1:8080", "highway://10.0.0.1:7070", "10.0.0.2:8080"],
        ));

        let first = cache.resolve(&key()).await.unwrap();
        let addresses: Vec<&str> = first.endpoints().iter().map(Endpoint::address).collect();
        assert_eq!(addresses, vec!["rest://10.0.0.1:8080", "10.0.0.2:8080"]);

        let second = cache.resolve(&key()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_resolvers_share_one_fetch() {
        let mut registry = StaticRegistry::with(&key(), &["rest://a:1"]);
        registry.delay = Some(Duration::from_millis(20));
        let (registry, cache) = cache(registry);
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.resolve(&key()).await }));
        }
        let mut generations = Vec::new();
        for handle in handles {
            generations.push(handle.await.unwrap().unwrap().generation());
        }

        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
        assert!(generations.iter().all(|g| *g == generations[0]));
    }

    #[tokio::test]
    async fn unknown_service_and_unknown_transport() {
        let (registry, cache) = cache(StaticRegistry::default());
        assert!(matches!(
            cache.resolve(&key()).await,
            Err(EndpointError::UnknownService(_))
        ));

        let grpc = ServiceKey::new("shop", "orders", "latest", "grpc");
        assert!(matches!(
            cache.resolve(&grpc).await,
            Err(EndpointError::UnknownTransport(name)) if name == "grpc"
        ));
        // Transport check happens before the registry is consulted.
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_failure_is_reported_not_cached() {
        let mut registry = StaticRegistry::with(&key(), &["rest://a:1"]);
        registry.fail = true;
        let (registry, cache) = cache(registry);

        assert!(matches!(
            cache.resolve(&key()).await,
            Err(EndpointError::RegistryUnavailable(_))
        ));
        assert!(cache.snapshot(&key()).is_none());
        assert!(cache.is_empty());
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_populations_leave_no_entries() {
        let (registry, cache) = cache(StaticRegistry::default());
        for i in 0..100 {
            let missing = ServiceKey::new("shop", format!("svc-{i}"), "latest", "rest");
            assert!(matches!(
                cache.resolve(&missing).await,
                Err(EndpointError::UnknownService(_))
            ));
        }
        assert_eq!(cache.len(), 0);

        // Still unresolved, so pushes are ignored.
        let missing = ServiceKey::new("shop", "svc-7", "latest", "rest");
        let applied = cache
            .on_registry_change(&missing, vec![RawEndpoint::new("rest://a:1")])
            .await
            .unwrap();
        assert_eq!(applied, None);

        // Once the registry learns the key, the next resolve fetches it.
        registry
            .services
            .lock()
            .insert(missing.clone(), vec![RawEndpoint::new("rest://a:1")]);
        let snapshot = cache.resolve(&missing).await.unwrap();
        assert_eq!(snapshot.endpoints()[0].address(), "rest://a:1");
        assert_eq!(cache.len(), 1);
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 101);
    }

    #[tokio::test]
    async fn waiters_behind_a_failed_population_fetch_again() {
        let mut registry = StaticRegistry::default();
        registry.delay = Some(Duration::from_millis(20));
        let (registry, cache) = cache(registry);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.resolve(&key()).await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(EndpointError::UnknownService(_))
            ));
        }
        assert!(cache.is_empty());
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_snapshot_is_no_endpoints_until_pushed() {
        let (_, cache) = cache(StaticRegistry::with(&key(), &[]));
        assert!(matches!(
            cache.resolve(&key()).await,
            Err(EndpointError::NoEndpoints(_))
        ));

        let generation = cache
            .on_registry_change(&key(), vec![RawEndpoint::new("rest://b:2")])
            .await
            .unwrap();
        assert_eq!(generation, Some(2));
        let snapshot = cache.resolve(&key()).await.unwrap();
        assert_eq!(snapshot.endpoints()[0].address(), "rest://b:2");
    }

    #[tokio::test]
    async fn changes_for_unresolved_keys_are_ignored() {
        let (_, cache) = cache(StaticRegistry::default());
        let applied = cache
            .on_registry_change(&key(), vec![RawEndpoint::new("rest://a:1")])
            .await
            .unwrap();
        assert_eq!(applied, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (registry, cache) = cache(StaticRegistry::with(&key(), &["rest://a:1"]));
        let before = cache.resolve(&key()).await.unwrap();
        assert!(cache.invalidate(&key()));
        assert!(!cache.invalidate(&key()));

        let after = cache.resolve(&key()).await.unwrap();
        assert!(after.generation() > before.generation());
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_mixed_snapshots() {
        let (_, cache) = cache(StaticRegistry::with(&key(), &["rest://g0-a", "rest://g0-b"]));
        let cache = Arc::new(cache);
        cache.resolve(&key()).await.unwrap();

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            readers.push(tokio::spawn(async move {
                for _ in 0..2_000 {
                    let snapshot = cache.snapshot(&key()).unwrap();
                    let tags: Vec<&str> = snapshot
                        .endpoints()
                        .iter()
                        .map(|e| e.address().split('-').next().unwrap_or_default())
                        .collect();
                    assert_eq!(tags.len(), 2);
                    assert!(tags.iter().all(|t| *t == tags[0]), "mixed snapshot: {tags:?}");
                    tokio::task::yield_now().await;
                }
            }));
        }

        for g in 1..200 {
            let raw = vec![
                RawEndpoint::new(format!("rest://g{g}-a")),
                RawEndpoint::new(format!("rest://g{g}-b")),
            ];
            cache.on_registry_change(&key(), raw).await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
