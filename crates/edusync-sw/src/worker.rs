//! The EduSync offline worker.

use std::sync::Arc;

use async_trait::async_trait;
use edusync_net::Fetcher;
use tracing::debug;

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::event::{
    ExtendableEvent, FetchEvent, NotificationClickEvent, PushEvent, WorkerEventHandler, WorkerScope,
};
use crate::fetch::{FetchOutcome, FetchPolicy};
use crate::lifecycle::LifecycleManager;
use crate::notification::{ClickRoute, NotificationRelay};
use crate::ServiceWorkerError;

/// Cache-first offline worker: seeds on install, evicts on activate, answers
/// fetches from cache or network, relays push notifications.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    lifecycle: LifecycleManager,
    policy: FetchPolicy,
    relay: NotificationRelay,
    scope: Arc<dyn WorkerScope>,
}

impl OfflineWorker {
    /// Build a worker. The configuration is validated here.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
        scope: Arc<dyn WorkerScope>,
    ) -> edusync_common::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        Ok(Self {
            lifecycle: LifecycleManager::new(config.clone(), store.clone(), network.clone()),
            policy: FetchPolicy::new(config.clone(), store, network)?,
            relay: NotificationRelay::new(config.clone()),
            config,
            scope,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

#[async_trait]
impl WorkerEventHandler for OfflineWorker {
    async fn on_install(&self, _event: &mut ExtendableEvent) -> Result<(), ServiceWorkerError> {
        self.lifecycle.install(self.scope.as_ref()).await.map(|_| ())
    }

    async fn on_activate(&self, _event: &mut ExtendableEvent) -> Result<(), ServiceWorkerError> {
        self.lifecycle.activate(self.scope.as_ref()).await;
        Ok(())
    }

    async fn on_fetch(&self, event: &mut FetchEvent) -> Result<(), ServiceWorkerError> {
        match self.policy.handle(&event.request, &mut event.lifetime).await {
            FetchOutcome::PassThrough(reason) => {
                debug!(url = %event.request.url, reason = ?reason, "Not intercepted");
                Ok(())
            }
            FetchOutcome::Respond(response, source) => event.respond_with(response, source),
        }
    }

    async fn on_push(&self, event: &mut PushEvent) -> Result<(), ServiceWorkerError> {
        match self.relay.compose(event.data.as_deref()) {
            Some(notification) => self.scope.show_notification(notification).await,
            None => Ok(()),
        }
    }

    async fn on_notification_click(
        &self,
        event: &mut NotificationClickEvent,
    ) -> Result<(), ServiceWorkerError> {
        self.scope
            .close_notification(&event.notification.tag)
            .await?;

        match self.relay.route_click(event.action.as_deref())? {
            ClickRoute::OpenWindow(url) => self.scope.open_window(url).await,
            ClickRoute::Dismiss => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::notification::Notification;
    use edusync_net::StaticNetwork;
    use tokio::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct LoggingScope {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkerScope for LoggingScope {
        async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
            self.calls.lock().await.push("skip_waiting".into());
            Ok(())
        }
        async fn claim_clients(&self) -> Result<usize, ServiceWorkerError> {
            self.calls.lock().await.push("claim".into());
            Ok(0)
        }
        async fn show_notification(&self, n: Notification) -> Result<(), ServiceWorkerError> {
            self.calls.lock().await.push(format!("show {}", n.title));
            Ok(())
        }
        async fn close_notification(&self, tag: &str) -> Result<(), ServiceWorkerError> {
            self.calls.lock().await.push(format!("close {tag}"));
            Ok(())
        }
        async fn open_window(&self, url: Url) -> Result<(), ServiceWorkerError> {
            self.calls.lock().await.push(format!("open {url}"));
            Ok(())
        }
    }

    fn worker(scope: Arc<LoggingScope>) -> OfflineWorker {
        let config = WorkerConfig::default()
            .with_scope(Url::parse("https://school.example/").unwrap());
        OfflineWorker::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StaticNetwork::new()),
            scope,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WorkerConfig::default().with_offline_path("/nowhere/");
        let result = OfflineWorker::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StaticNetwork::new()),
            Arc::new(LoggingScope::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_push_then_click_view() {
        let scope = Arc::new(LoggingScope::default());
        let worker = worker(scope.clone());

        let mut push = PushEvent::new(Some(bytes::Bytes::from_static(br#"{"title":"Fees due"}"#)));
        worker.on_push(&mut push).await.unwrap();

        let notification = worker.relay.compose(Some(br#"{}"#)).unwrap();
        let mut click = NotificationClickEvent::new(notification, Some("view".into()));
        worker.on_notification_click(&mut click).await.unwrap();

        assert_eq!(
            *scope.calls.lock().await,
            vec![
                "show Fees due".to_string(),
                "close edusync-notification".to_string(),
                "open https://school.example/".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_push_without_data_shows_nothing() {
        let scope = Arc::new(LoggingScope::default());
        let worker = worker(scope.clone());

        worker.on_push(&mut PushEvent::new(None)).await.unwrap();
        assert!(scope.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_click_close_only_closes() {
        let scope = Arc::new(LoggingScope::default());
        let worker = worker(scope.clone());

        let notification = worker.relay.compose(Some(br#"{}"#)).unwrap();
        let mut click = NotificationClickEvent::new(notification, Some("close".into()));
        worker.on_notification_click(&mut click).await.unwrap();
        assert_eq!(
            *scope.calls.lock().await,
            vec!["close edusync-notification".to_string()]
        );
    }
}
