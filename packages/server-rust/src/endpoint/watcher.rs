//! Background task that applies service-registry pushes to an [`EndpointCache`].

use std::sync::Arc;

use courier_core::{RawEndpoint, ServiceKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::EndpointCache;

/// Channel capacity for pending registry events.
const EVENT_BUFFER: usize = 256;

/// Notification from the service registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Full replacement endpoint list for a key.
    Changed {
        key: ServiceKey,
        endpoints: Vec<RawEndpoint>,
    },
    /// The key's entry should be dropped and re-fetched on next use.
    Invalidated { key: ServiceKey },
}

/// Handle to the watcher task.
///
/// The task stops when every sender is dropped or on [`stop`](Self::stop).
pub struct RegistryWatcher {
    tx: Option<mpsc::Sender<RegistryEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryWatcher {
    /// Spawns the watcher for `cache`.
    #[must_use]
    pub fn start(cache: Arc<EndpointCache>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryEvent>(EVENT_BUFFER);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => apply(&cache, event).await,
                        None => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("registry watcher stopped");
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// A sender for registry clients that push changes.
    ///
    /// Returns `None` once the watcher has been stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<RegistryEvent>> {
        self.tx.clone()
    }

    /// Queues one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher has been stopped.
    pub async fn submit(&self, event: RegistryEvent) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| anyhow::anyhow!("registry watcher channel closed")),
            None => Err(anyhow::anyhow!("registry watcher not running")),
        }
    }

    /// Stops the task and waits for it to finish. Queued events may be dropped.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn apply(cache: &EndpointCache, event: RegistryEvent) {
    match event {
        RegistryEvent::Changed { key, endpoints } => {
            if let Err(e) = cache.on_registry_change(&key, endpoints).await {
                warn!(%key, error = %e, "registry change not applied");
            }
        }
        RegistryEvent::Invalidated { key } => {
            cache.invalidate(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::endpoint::cache::tests::StaticRegistry;
    use crate::endpoint::testing::table;

    fn key() -> ServiceKey {
        ServiceKey::new("shop", "orders", "latest", "rest")
    }

    /// Yields to the watcher task until `condition` holds.
    async fn applied(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("watcher did not apply the event");
    }

    #[tokio::test]
    async fn applies_changes_and_invalidations() {
        let registry = Arc::new(StaticRegistry::with(&key(), &["rest://a:1"]));
        let cache = Arc::new(EndpointCache::new(registry, table(&["rest"])));
        let first = cache.resolve(&key()).await.unwrap().generation();

        let mut watcher = RegistryWatcher::start(Arc::clone(&cache));
        watcher
            .submit(RegistryEvent::Changed {
                key: key(),
                endpoints: vec![RawEndpoint::new("rest://b:2"), RawEndpoint::new("rest://c:3")],
            })
            .await
            .unwrap();
        applied(|| cache.snapshot(&key()).is_some_and(|s| s.generation() > first)).await;

        let snapshot = cache.snapshot(&key()).unwrap();
        assert!(snapshot.generation() > first);
        assert_eq!(snapshot.endpoints().len(), 2);

        watcher
            .submit(RegistryEvent::Invalidated { key: key() })
            .await
            .unwrap();
        applied(|| cache.snapshot(&key()).is_none()).await;
        assert!(cache.is_empty());

        watcher.stop().await;
        assert!(watcher.sender().is_none());
        assert!(watcher
            .submit(RegistryEvent::Invalidated { key: key() })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stops_when_senders_are_dropped() {
        let cache = Arc::new(EndpointCache::new(
            Arc::new(StaticRegistry::default()),
            table(&["rest"]),
        ));
        let mut watcher = RegistryWatcher::start(cache);
        let handle = watcher.handle.take().unwrap();
        watcher.tx.take();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(watcher.shutdown_tx.is_some());
    }
}
