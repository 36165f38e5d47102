//! Install and activate: seeding the current generation and evicting the
//! others.

use std::sync::Arc;

use edusync_net::{Fetcher, Request};
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheHandle, CacheKey, CacheStore};
use crate::config::WorkerConfig;
use crate::event::WorkerScope;
use crate::ServiceWorkerError;

/// Result of an activation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generations removed.
    pub deleted: Vec<String>,
    /// Generations that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Clients taken over by the claim.
    pub claimed: usize,
}

/// Owns the current generation and its lifecycle.
pub struct LifecycleManager {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            store,
            network,
        }
    }

    /// Name of the generation this worker serves from.
    pub fn current_generation(&self) -> &str {
        &self.config.cache_name
    }

    /// Seed the current generation, then ask to skip waiting.
    pub async fn install(&self, scope: &dyn WorkerScope) -> Result<CacheHandle, ServiceWorkerError> {
        info!(cache = %self.config.cache_name, "Service worker installing");
        let cache = self.seed().await?;
        scope.skip_waiting().await?;
        Ok(cache)
    }

    /// Open the current generation and store every seed resource.
    ///
    /// All seed fetches must succeed with an ok status before anything is
    /// written.
    pub async fn seed(&self) -> Result<CacheHandle, ServiceWorkerError> {
        let cache = CacheHandle::open(self.store.clone(), &self.config.cache_name).await?;
        info!(cache = cache.name(), "Opened cache");

        let urls = self
            .config
            .seed_urls()
            .map_err(|e| ServiceWorkerError::ConfigError(e.to_string()))?;
        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_seed(url))).await?;

        let count = entries.len();
        cache.put_all(entries).await?;
        info!(cache = cache.name(), count, "Seeded cache");
        Ok(cache)
    }

    async fn fetch_seed(&self, url: Url) -> Result<CacheEntry, ServiceWorkerError> {
        let seed_failed = |reason: String| ServiceWorkerError::SeedFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .network
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|e| seed_failed(e.to_string()))?;
        if !response.ok() {
            return Err(seed_failed(format!("status {}", response.status)));
        }

        debug!(url = %url, status = response.status, "Fetched seed resource");
        CacheEntry::from_response(CacheKey::get(&url), response)
            .await
            .map_err(|e| seed_failed(e.to_string()))
    }

    /// Delete every generation but the current one, then claim clients.
    ///
    /// Never fails: each deletion is independent, and a failed deletion or
    /// claim is logged and reported.
    pub async fn activate(&self, scope: &dyn WorkerScope) -> ActivationReport {
        info!(cache = %self.config.cache_name, "Service worker activating");
        let mut report = ActivationReport::default();

        let names = match self.store.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not list cache generations, skipping eviction");
                Vec::new()
            }
        };

        let current = self.current_generation();
        let deletions = names
            .into_iter()
            .filter(|name| name != current)
            .map(|name| async move {
                info!(cache = %name, "Deleting old cache");
                let result = self.store.delete(&name).await;
                (name, result)
            });

        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        match scope.claim_clients().await {
            Ok(claimed) => report.claimed = claimed,
            Err(e) => warn!(error = %e, "Failed to claim clients"),
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            claimed = report.claimed,
            "Service worker activated"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::notification::Notification;
    use async_trait::async_trait;
    use edusync_net::{StaticNetwork, StaticResponse};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SCOPE: &str = "https://school.example/";

    #[derive(Default)]
    struct RecordingScope {
        skipped: AtomicBool,
        claims: AtomicUsize,
        fail_claim: bool,
    }

    #[async_trait]
    impl WorkerScope for RecordingScope {
        async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
            self.skipped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn claim_clients(&self) -> Result<usize, ServiceWorkerError> {
            if self.fail_claim {
                return Err(ServiceWorkerError::StateError("no active worker".into()));
            }
            self.claims.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }

        async fn show_notification(&self, _: Notification) -> Result<(), ServiceWorkerError> {
            Ok(())
        }

        async fn close_notification(&self, _: &str) -> Result<(), ServiceWorkerError> {
            Ok(())
        }

        async fn open_window(&self, _: Url) -> Result<(), ServiceWorkerError> {
            Ok(())
        }
    }

    /// Store whose `delete` fails for one name.
    struct BrokenDelete {
        inner: MemoryCacheStorage,
        broken: String,
    }

    #[async_trait]
    impl CacheStore for BrokenDelete {
        async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            self.inner.open(name).await
        }
        async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
            self.inner.put_all(name, entries).await
        }
        async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
            self.inner.put(name, entry).await
        }
        async fn match_key(
            &self,
            name: &str,
            key: &CacheKey,
        ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
            self.inner.match_key(name, key).await
        }
        async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, ServiceWorkerError> {
            self.inner.entry_keys(name).await
        }
        async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
            self.inner.keys().await
        }
        async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            if name == self.broken {
                return Err(ServiceWorkerError::CacheError("disk busy".into()));
            }
            self.inner.delete(name).await
        }
    }

    fn config() -> Arc<WorkerConfig> {
        Arc::new(
            WorkerConfig::default()
                .with_scope(Url::parse(SCOPE).unwrap())
                .with_cache_name("v2")
                .with_seed_resources(["/", "/static/app.css", "/offline/"]),
        )
    }

    fn seeded_network() -> StaticNetwork {
        StaticNetwork::new()
            .with_route("https://school.example/", StaticResponse::ok("home"))
            .with_route("https://school.example/static/app.css", StaticResponse::ok("css"))
            .with_route("https://school.example/offline/", StaticResponse::ok("offline"))
    }

    #[tokio::test]
    async fn test_install_seeds_and_skips_waiting() {
        let store = Arc::new(MemoryCacheStorage::new());
        let manager = LifecycleManager::new(config(), store.clone(), Arc::new(seeded_network()));
        let scope = RecordingScope::default();

        let cache = manager.install(&scope).await.unwrap();
        assert_eq!(cache.name(), "v2");
        assert_eq!(store.len("v2").await, 3);
        assert!(scope.skipped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_one_failed_seed_fails_install_and_writes_nothing() {
        let network = seeded_network().with_failure("https://school.example/static/app.css", "reset");
        let store = Arc::new(MemoryCacheStorage::new());
        let manager = LifecycleManager::new(config(), store.clone(), Arc::new(network));
        let scope = RecordingScope::default();

        let err = manager.install(&scope).await.unwrap_err();
        match err {
            ServiceWorkerError::SeedFailed { url, .. } => {
                assert_eq!(url, "https://school.example/static/app.css")
            }
            other => panic!("expected seed failure, got {other:?}"),
        }
        assert_eq!(store.len("v2").await, 0);
        assert!(!scope.skipped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_non_ok_seed_fails_install() {
        let network = StaticNetwork::new()
            .with_route("https://school.example/", StaticResponse::ok("home"))
            .with_route("https://school.example/offline/", StaticResponse::ok("offline"));
        let manager = LifecycleManager::new(
            config(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(network),
        );

        let err = manager.seed().await.unwrap_err();
        assert!(err.to_string().contains("status 404"));
    }

    #[tokio::test]
    async fn test_activate_evicts_other_generations() {
        let store = Arc::new(MemoryCacheStorage::new());
        for name in ["v0", "v1", "v2"] {
            store.open(name).await.unwrap();
        }
        let manager = LifecycleManager::new(config(), store.clone(), Arc::new(StaticNetwork::new()));
        let scope = RecordingScope::default();

        let report = manager.activate(&scope).await;
        assert_eq!(report.deleted, vec!["v0", "v1"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.claimed, 2);
        assert_eq!(store.keys().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_failed_deletion_does_not_block_others_or_claim() {
        let store = Arc::new(BrokenDelete {
            inner: MemoryCacheStorage::new(),
            broken: "v0".to_string(),
        });
        for name in ["v0", "v1", "v2"] {
            store.open(name).await.unwrap();
        }
        let manager = LifecycleManager::new(config(), store.clone(), Arc::new(StaticNetwork::new()));
        let scope = RecordingScope::default();

        let report = manager.activate(&scope).await;
        assert_eq!(report.deleted, vec!["v1"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "v0");
        assert_eq!(scope.claims.load(Ordering::SeqCst), 1);
        assert_eq!(store.keys().await.unwrap(), vec!["v0", "v2"]);
    }

    #[tokio::test]
    async fn test_failed_claim_is_reported_not_raised() {
        let manager = LifecycleManager::new(
            config(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StaticNetwork::new()),
        );
        let scope = RecordingScope {
            fail_claim: true,
            ..Default::default()
        };

        let report = manager.activate(&scope).await;
        assert_eq!(report.claimed, 0);
    }
}
