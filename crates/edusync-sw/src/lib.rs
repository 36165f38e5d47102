//! # EduSync Offline Worker
//!
//! Cache-first service worker for the EduSync school-management app.
//!
//! ## Features
//!
//! - **Install**: seed the current cache generation with the app shell
//! - **Activate**: evict every other generation, claim open windows
//! - **Fetch**: cache first, then network, then the offline page
//! - **Push**: show a notification, open the app on "view"
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     ├── Clients, NotificationCenter
//!     └── HostScope ──► WorkerScope
//!
//! OfflineWorker ──► WorkerEventHandler
//!     ├── LifecycleManager ──► CacheStore + Fetcher
//!     ├── FetchPolicy ──► RequestFilter, CacheStore, Fetcher
//!     └── NotificationRelay
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod event;
pub mod fetch;
pub mod filter;
pub mod lifecycle;
pub mod notification;
pub mod worker;

use edusync_common::EduSyncError;
use thiserror::Error;

pub use cache::{CacheEntry, CacheHandle, CacheKey, CacheStore, MemoryCacheStorage, StoreSnapshot};
pub use config::{NotificationAction, NotificationConfig, WorkerConfig};
pub use container::{
    Client, FetchResult, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent,
    ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use event::{
    ExtendableEvent, FetchEvent, NotificationClickEvent, PushEvent, ResponseSource,
    WorkerEventHandler, WorkerScope,
};
pub use fetch::{is_cacheable, FetchOutcome, FetchPolicy};
pub use filter::{FilterVerdict, PassReason, RequestFilter};
pub use lifecycle::{ActivationReport, LifecycleManager};
pub use notification::{ClickRoute, Notification, NotificationRelay, PushPayload};
pub use worker::OfflineWorker;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Seed resource {url} failed: {reason}")]
    SeedFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for EduSyncError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::SeedFailed { .. } | ServiceWorkerError::StateError(_) => {
                EduSyncError::lifecycle(err.to_string())
            }
            ServiceWorkerError::CacheError(message) => EduSyncError::cache(message),
            ServiceWorkerError::NotificationError(message) => EduSyncError::notification(message),
            ServiceWorkerError::ConfigError(message) => EduSyncError::config(message),
            ServiceWorkerError::NotFound(what) => EduSyncError::NotFound(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_failure_message() {
        let err = ServiceWorkerError::SeedFailed {
            url: "https://school.example/offline/".into(),
            reason: "status 500".into(),
        };
        assert_eq!(
            err.to_string(),
            "Seed resource https://school.example/offline/ failed: status 500"
        );
    }

    #[test]
    fn test_conversion_keeps_category() {
        let seed: EduSyncError = ServiceWorkerError::SeedFailed {
            url: "u".into(),
            reason: "r".into(),
        }
        .into();
        assert_eq!(seed.category(), "lifecycle");

        let cache: EduSyncError = ServiceWorkerError::CacheError("full".into()).into();
        assert_eq!(cache.category(), "cache");

        let missing: EduSyncError = ServiceWorkerError::NotFound("scope".into()).into();
        assert!(matches!(missing, EduSyncError::NotFound(_)));
    }
}
