//! Fetch policy: cache first, then network, then offline fallback.
//!
//! ```text
//! Intercepted ─┬─ PassThrough
//!              ├─ CacheHit ─────────────────────────────────────► Done
//!              └─ CacheMiss ─► Network ─┬─ Ok (cacheable: tee, store copy) ─► Done
//!                                       └─ Err ─┬─ navigation: offline page ────► Done
//!                                               └─ otherwise: 408 ──────────────► Done
//! ```

use std::sync::Arc;

use edusync_net::{Fetcher, NetError, Request, Response, ResponseType};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::WorkerConfig;
use crate::event::{ExtendableEvent, ResponseSource};
use crate::filter::{FilterVerdict, PassReason, RequestFilter};

/// Status of the locally built answer to a failed non-navigation fetch.
pub const NETWORK_ERROR_STATUS: u16 = 408;

/// Body of the locally built answer to a failed non-navigation fetch.
pub const NETWORK_ERROR_BODY: &str = "Network error happened";

/// Decision for one request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the platform performs the request itself.
    PassThrough(PassReason),
    /// Answered by the worker.
    Respond(Response, ResponseSource),
}

/// Whether a network response may be written to the cache.
pub fn is_cacheable(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic && !response.redirected
}

/// The per-request decision procedure.
pub struct FetchPolicy {
    config: Arc<WorkerConfig>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    filter: RequestFilter,
    offline_key: CacheKey,
}

impl FetchPolicy {
    pub fn new(
        config: Arc<WorkerConfig>,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
    ) -> edusync_common::Result<Self> {
        let offline_key = CacheKey::get(&config.offline_url()?);
        let filter = RequestFilter::from_prefixes(&config.bypass_prefixes);
        Ok(Self {
            config,
            store,
            network,
            filter,
            offline_key,
        })
    }

    /// Handle one request. Detached cache writes are registered on
    /// `lifetime`; their outcome never affects the returned response.
    pub async fn handle(&self, request: &Request, lifetime: &mut ExtendableEvent) -> FetchOutcome {
        if let FilterVerdict::PassThrough(reason) = self.filter.check(request) {
            return FetchOutcome::PassThrough(reason);
        }

        let key = CacheKey::get(&request.url);
        if let Some(entry) = self.lookup(&key).await {
            debug!(url = %request.url, "Cache hit");
            return FetchOutcome::Respond(entry.to_response(), ResponseSource::Cache);
        }

        trace!(url = %request.url, "Cache miss, fetching from network");
        let response = match self.network.fetch(request.clone()).await {
            Ok(response) => response,
            Err(e) => return self.recover(request, &e).await,
        };

        if !is_cacheable(&response) {
            debug!(
                url = %request.url,
                status = response.status,
                response_type = ?response.response_type,
                redirected = response.redirected,
                "Network response not cacheable"
            );
            return FetchOutcome::Respond(response, ResponseSource::Network { stored: false });
        }

        let (response, copy) = response.tee();
        lifetime.wait_until(self.store_detached(key, copy));
        FetchOutcome::Respond(response, ResponseSource::Network { stored: true })
    }

    /// Current-generation lookup; a store error counts as a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.store.match_key(&self.config.cache_name, key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    fn store_detached(&self, key: CacheKey, copy: Response) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cache_name = self.config.cache_name.clone();
        tokio::spawn(async move {
            let url = key.url.clone();
            let entry = match CacheEntry::from_response(key, copy).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(url = %url, error = %e, "Could not snapshot response for cache");
                    return;
                }
            };
            match store.put(&cache_name, entry).await {
                Ok(()) => trace!(cache = %cache_name, url = %url, "Cached network response"),
                Err(e) => warn!(cache = %cache_name, url = %url, error = %e, "Cache write failed"),
            }
        })
    }

    async fn recover(&self, request: &Request, error: &NetError) -> FetchOutcome {
        if request.is_navigation() {
            info!(url = %request.url, error = %error, "Fetch failed; returning offline page instead");
            return match self.lookup(&self.offline_key).await {
                Some(entry) => {
                    FetchOutcome::Respond(entry.to_response(), ResponseSource::OfflineFallback)
                }
                None => {
                    warn!(offline = %self.offline_key.url, "Offline page missing from cache");
                    FetchOutcome::Respond(Response::error(), ResponseSource::Synthetic)
                }
            };
        }

        debug!(url = %request.url, error = %error, "Fetch failed; returning network error response");
        let response = Response::new(NETWORK_ERROR_STATUS, NETWORK_ERROR_BODY)
            .with_header("Content-Type", "text/plain");
        FetchOutcome::Respond(response, ResponseSource::Synthetic)
    }
}
