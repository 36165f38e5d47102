//! Versioned cache store.
//!
//! ```text
//! CacheStore (caches)
//!     └── generation "edusync-v1.0.0"
//!             └── CacheKey (GET + URL) → CacheEntry (response snapshot)
//! ```
//!
//! Every generation is a flat key/value map. Only `GET` requests are ever
//! keyed; the fragment of a URL is not part of its key.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use edusync_common::ResultExt;
use edusync_net::{NetError, Request, Response, ResponseType};
use hashbrown::HashMap;
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys and Entries ====================

/// Lookup key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a `GET` of `url`.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    /// Key for a request; `None` for anything but `GET`.
    pub fn for_request(request: &Request) -> Option<Self> {
        (request.method == Method::GET).then(|| Self::get(&request.url))
    }

    fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

/// Immutable snapshot of a response, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,

    /// Final response URL.
    pub url: Option<String>,

    pub status: u16,
    pub status_text: String,

    /// Headers in wire order; repeated names are kept.
    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,

    pub response_type: ResponseType,
    pub redirected: bool,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response, consuming its body.
    pub async fn from_response(key: CacheKey, response: Response) -> Result<Self, NetError> {
        let url = response.url.as_ref().map(Url::to_string);
        let headers = response.header_pairs();
        let status = response.status;
        let status_text = response.status_text.clone();
        let response_type = response.response_type;
        let redirected = response.redirected;
        let body = response.bytes().await?;

        Ok(Self {
            key,
            url,
            status,
            status_text,
            headers,
            body: body.to_vec(),
            response_type,
            redirected,
            cached_at: now_millis(),
        })
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.status, self.body.clone())
            .with_type(self.response_type)
            .with_redirected(self.redirected);
        response.status_text = self.status_text.clone();
        if let Some(url) = self.url.as_deref().and_then(|u| Url::parse(u).ok()) {
            response = response.with_url(url);
        }
        for (name, value) in &self.headers {
            response = response.with_header(name, value);
        }
        response
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Store Contract ====================

/// Persistent, name-addressed collection of cache generations.
///
/// Implementations synchronize internally; callers never assume exclusive
/// access across calls.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the generation if absent. Returns `true` when it was created.
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Insert every entry or none of them. Creates the generation if absent.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError>;

    /// Insert or replace one entry. Creates the generation if absent.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Look up a key in one generation.
    async fn match_key(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Keys stored in one generation; empty if the generation is absent.
    async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, ServiceWorkerError>;

    /// Generation names, in creation order.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a generation. Returns `true` when it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;
}

/// An opened generation.
#[derive(Clone)]
pub struct CacheHandle {
    name: String,
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").field("name", &self.name).finish()
    }
}

impl CacheHandle {
    /// Open (create-if-absent) a generation.
    pub async fn open(store: Arc<dyn CacheStore>, name: &str) -> Result<Self, ServiceWorkerError> {
        if store.open(name).await? {
            debug!(cache = name, "Created cache generation");
        }
        Ok(Self {
            name: name.to_string(),
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
        self.store.put_all(&self.name, entries).await
    }

    pub async fn put(&self, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        self.store.put(&self.name, entry).await
    }

    pub async fn keys(&self) -> Result<Vec<CacheKey>, ServiceWorkerError> {
        self.store.entry_keys(&self.name).await
    }
}

// ==================== Cache ====================

/// One generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a key.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add or replace an entry.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Memory Store ====================

#[derive(Debug, Default)]
struct Generations {
    caches: HashMap<String, Cache>,
    /// Creation order of `caches`.
    order: Vec<String>,
}

impl Generations {
    fn open(&mut self, name: &str) -> (&mut Cache, bool) {
        let created = !self.caches.contains_key(name);
        if created {
            self.order.push(name.to_string());
        }
        let cache = self
            .caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        (cache, created)
    }
}

/// Serialized form of a [`MemoryCacheStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub generations: Vec<GenerationSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}

/// In-process [`CacheStore`] guarded by a single `RwLock`.
///
/// The whole store round-trips through one JSON blob via
/// [`MemoryCacheStorage::to_json`] and [`MemoryCacheStorage::from_json`].
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<Generations>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a generation exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.read().await.caches.contains_key(name)
    }

    /// Number of entries in a generation.
    pub async fn len(&self, name: &str) -> usize {
        self.inner
            .read()
            .await
            .caches
            .get(name)
            .map(Cache::len)
            .unwrap_or(0)
    }

    /// Copy every generation out.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().await;
        let generations = inner
            .order
            .iter()
            .filter_map(|name| inner.caches.get(name))
            .map(|cache| GenerationSnapshot {
                name: cache.name.clone(),
                entries: cache.entries.values().cloned().collect(),
            })
            .collect();
        StoreSnapshot { generations }
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut generations = Generations::default();
        for generation in snapshot.generations {
            let (cache, _) = generations.open(&generation.name);
            for entry in generation.entries {
                cache.put(entry);
            }
        }
        Self {
            inner: RwLock::new(generations),
        }
    }

    /// Serialize the whole store.
    pub async fn to_json(&self) -> edusync_common::Result<String> {
        serde_json::to_string(&self.snapshot().await).context("serializing cache snapshot")
    }

    /// Load a store serialized with [`MemoryCacheStorage::to_json`].
    pub fn from_json(json: &str) -> edusync_common::Result<Self> {
        let snapshot: StoreSnapshot =
            serde_json::from_str(json).context("parsing cache snapshot")?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write the whole store to `path` as one JSON file.
    pub async fn save(&self, path: impl AsRef<Path>) -> edusync_common::Result<()> {
        let path = path.as_ref();
        tokio::fs::write(path, self.to_json().await?).await?;
        debug!(path = %path.display(), "Saved cache snapshot");
        Ok(())
    }

    /// Load a store written by [`MemoryCacheStorage::save`].
    pub async fn load(path: impl AsRef<Path>) -> edusync_common::Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }
}

fn reject_non_get(name: &str, entry: &CacheEntry) -> Result<(), ServiceWorkerError> {
    if entry.key.is_get() {
        Ok(())
    } else {
        Err(ServiceWorkerError::CacheError(format!(
            "{} {} cannot be stored in {name}: only GET is cacheable",
            entry.key.method, entry.key.url
        )))
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let (_, created) = self.inner.write().await.open(name);
        Ok(created)
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
        for entry in &entries {
            reject_non_get(name, entry)?;
        }
        let mut inner = self.inner.write().await;
        let (cache, _) = inner.open(name);
        let count = entries.len();
        for entry in entries {
            cache.put(entry);
        }
        trace!(cache = name, count, "Stored entries");
        Ok(())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        reject_non_get(name, &entry)?;
        trace!(cache = name, url = %entry.key.url, "Stored entry");
        self.inner.write().await.open(name).0.put(entry);
        Ok(())
    }

    async fn match_key(
        &self,
        name: &str,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(self
            .inner
            .read()
            .await
            .caches
            .get(name)
            .and_then(|cache| cache.match_key(key))
            .cloned())
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<CacheKey>, ServiceWorkerError> {
        Ok(self
            .inner
            .read()
            .await
            .caches
            .get(name)
            .map(|cache| cache.keys().into_iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.inner.read().await.order.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        inner.order.retain(|n| n != name);
        Ok(inner.caches.remove(name).is_some())
    }
}
