//! Worker configuration.
//!
//! Everything the worker needs is fixed when it is built: the generation
//! name, the seed list, the offline page and the notification look. The
//! configuration is validated once and then shared read-only.

use edusync_common::{EduSyncError, Result};
use edusync_net::{LoaderConfig, ResourceLoader};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_SCOPE: &str = "http://localhost:8000/";

/// Offline worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Root of the application; seed paths resolve against it.
    pub scope: Url,

    /// Current cache generation name.
    pub cache_name: String,

    /// Root-relative paths cached at install, in order.
    pub seed_resources: Vec<String>,

    /// Page served to navigations when both cache and network fail.
    pub offline_path: String,

    /// URL prefixes the worker never intercepts.
    pub bypass_prefixes: Vec<String>,

    /// Push notification settings.
    pub notification: NotificationConfig,
}

/// A notification action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Push notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title when the payload has none.
    pub default_title: String,

    /// Body when the payload has none.
    pub default_body: String,

    pub icon: String,
    pub badge: String,

    /// Display tag; a new notification with the same tag replaces the old one.
    pub tag: String,

    /// Alert again when replacing a notification with the same tag.
    pub renotify: bool,

    pub actions: Vec<NotificationAction>,

    /// Action that opens the application window.
    pub open_action: String,

    /// Path opened by `open_action`.
    pub open_path: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scope: Url::parse(DEFAULT_SCOPE).expect("default scope is a valid URL"),
            cache_name: "edusync-v1.0.0".to_string(),
            seed_resources: [
                "/",
                "/static/dist/css/adminlte.min.css",
                "/static/plugins/fontawesome-free/css/all.min.css",
                "/static/plugins/toastr/toastr.min.css",
                "/static/dist/js/adminlte.min.js",
                "/static/plugins/jquery/jquery.min.js",
                "/static/plugins/bootstrap/js/bootstrap.bundle.min.js",
                "/static/plugins/toastr/toastr.min.js",
                "/static/dist/img/icon-192x192.png",
                "/static/dist/img/icon-512x512.png",
                "/offline/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            offline_path: "/offline/".to_string(),
            bypass_prefixes: vec!["chrome-extension://".to_string()],
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "EduSync".to_string(),
            default_body: "New notification from EduSync".to_string(),
            icon: "/static/dist/img/icon-192x192.png".to_string(),
            badge: "/static/dist/img/icon-72x72.png".to_string(),
            tag: "edusync-notification".to_string(),
            renotify: true,
            actions: vec![
                NotificationAction {
                    action: "view".to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: "close".to_string(),
                    title: "Close".to_string(),
                },
            ],
            open_action: "view".to_string(),
            open_path: "/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON configuration. Missing fields take the
    /// EduSync defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EduSyncError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_scope(mut self, scope: Url) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_seed_resources<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_resources = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offline_path(mut self, path: impl Into<String>) -> Self {
        self.offline_path = path.into();
        self
    }

    /// Check the invariants the worker relies on at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(EduSyncError::config("cache name must not be empty"));
        }
        if self.seed_resources.is_empty() {
            return Err(EduSyncError::config("seed resource list must not be empty"));
        }
        if !self.seed_resources.iter().any(|path| *path == self.offline_path) {
            return Err(EduSyncError::config(format!(
                "offline path {} is not in the seed list",
                self.offline_path
            )));
        }
        for path in &self.seed_resources {
            self.resolve(path)?;
        }
        self.resolve(&self.notification.open_path)?;
        Ok(())
    }

    /// Resolve a root-relative path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        let url = self.scope.join(path).map_err(|e| {
            EduSyncError::config_with_source(format!("cannot resolve {path}"), e)
        })?;
        if url.origin() != self.scope.origin() {
            return Err(EduSyncError::config(format!(
                "{path} resolves outside of scope {}",
                self.scope
            )));
        }
        Ok(url)
    }

    /// Seed resources as absolute URLs, in configured order.
    pub fn seed_urls(&self) -> Result<Vec<Url>> {
        self.seed_resources.iter().map(|p| self.resolve(p)).collect()
    }

    /// Absolute URL of the offline page.
    pub fn offline_url(&self) -> Result<Url> {
        self.resolve(&self.offline_path)
    }

    /// Absolute URL opened by the notification `view` action.
    pub fn open_url(&self) -> Result<Url> {
        self.resolve(&self.notification.open_path)
    }

    /// Network loader for this worker. Responses from the scope's origin are
    /// typed `basic` and may be cached; everything else is `cors` or `opaque`.
    pub fn resource_loader(&self, loader: LoaderConfig) -> Result<ResourceLoader> {
        Ok(ResourceLoader::new(self.scope.clone(), loader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_name, "edusync-v1.0.0");
        assert_eq!(config.seed_resources.len(), 11);
        assert_eq!(config.seed_resources.last().map(String::as_str), Some("/offline/"));
    }

    #[test]
    fn test_offline_path_must_be_seeded() {
        let config = WorkerConfig::default().with_offline_path("/gone/");
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("/gone/"));
    }

    #[test]
    fn test_empty_cache_name_rejected() {
        let config = WorkerConfig::default().with_cache_name("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_against_scope() {
        let config = WorkerConfig::default()
            .with_scope(Url::parse("https://school.example/").unwrap());
        assert_eq!(
            config.offline_url().unwrap().as_str(),
            "https://school.example/offline/"
        );
        assert!(config.resolve("https://elsewhere.example/x").is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json(
            r#"{
                "scope": "https://school.example/",
                "cache_name": "edusync-v2.0.0",
                "seed_resources": ["/", "/offline/"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "edusync-v2.0.0");
        assert_eq!(config.offline_path, "/offline/");
        assert_eq!(config.notification.tag, "edusync-notification");
        assert_eq!(config.bypass_prefixes, vec!["chrome-extension://".to_string()]);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(WorkerConfig::from_json("{ not json").is_err());
        assert!(WorkerConfig::from_json(r#"{"seed_resources": []}"#).is_err());
    }
}
