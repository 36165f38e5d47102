//! Worker events and the two seams between the worker and its host.
//!
//! The host delivers events through [`WorkerEventHandler`]; the worker calls
//! back into the host through [`WorkerScope`]. Every event owns an
//! [`ExtendableEvent`] that collects detached work the host must settle
//! before it considers the event finished.

use async_trait::async_trait;
use bytes::Bytes;
use edusync_net::{Request, Response};
use tokio::task::JoinHandle;
use tracing::warn;
use url::Url;

use crate::notification::Notification;
use crate::ServiceWorkerError;

// ==================== Event Lifetime ====================

/// Keeps an event alive while work it spawned is still running.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: Vec<JoinHandle<()>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the event until `task` finishes.
    pub fn wait_until(&mut self, task: JoinHandle<()>) {
        self.pending.push(task);
    }

    /// Number of tasks not yet settled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every extending task. A panicked task is logged, not
    /// propagated.
    pub async fn settle(&mut self) {
        for task in self.pending.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Extending task did not complete");
            }
        }
    }
}

// ==================== Fetch ====================

/// Where a fetch answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served from the current generation.
    Cache,
    /// Served from the network; `stored` when a copy was sent to the cache.
    Network { stored: bool },
    /// Network failed on a navigation; offline page served.
    OfflineFallback,
    /// Network failed; response constructed locally.
    Synthetic,
}

/// A fetch event.
#[derive(Debug)]
pub struct FetchEvent {
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,

    pub lifetime: ExtendableEvent,

    response: Option<(Response, ResponseSource)>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            lifetime: ExtendableEvent::new(),
            response: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Answer the request. Only the first answer counts.
    pub fn respond_with(
        &mut self,
        response: Response,
        source: ResponseSource,
    ) -> Result<(), ServiceWorkerError> {
        if self.response.is_some() {
            return Err(ServiceWorkerError::StateError(format!(
                "{} already has a response",
                self.request.url
            )));
        }
        self.response = Some((response, source));
        Ok(())
    }

    pub fn was_responded(&self) -> bool {
        self.response.is_some()
    }

    pub fn take_response(&mut self) -> Option<(Response, ResponseSource)> {
        self.response.take()
    }
}

// ==================== Push and Notification Click ====================

/// A push message.
#[derive(Debug, Default)]
pub struct PushEvent {
    /// Raw payload; `None` when the push carried no data.
    pub data: Option<Bytes>,
    pub lifetime: ExtendableEvent,
}

impl PushEvent {
    pub fn new(data: Option<Bytes>) -> Self {
        Self {
            data,
            lifetime: ExtendableEvent::new(),
        }
    }
}

/// A click on a displayed notification or one of its actions.
#[derive(Debug)]
pub struct NotificationClickEvent {
    pub notification: Notification,

    /// Action button clicked; `None` for the notification body.
    pub action: Option<String>,

    pub lifetime: ExtendableEvent,
}

impl NotificationClickEvent {
    pub fn new(notification: Notification, action: Option<String>) -> Self {
        Self {
            notification,
            action,
            lifetime: ExtendableEvent::new(),
        }
    }
}

// ==================== Seams ====================

/// Event callbacks a worker implements. The host awaits each call before it
/// settles the event's lifetime.
#[async_trait]
pub trait WorkerEventHandler: Send + Sync {
    /// An error fails the install; the worker becomes redundant.
    async fn on_install(&self, event: &mut ExtendableEvent) -> Result<(), ServiceWorkerError>;

    async fn on_activate(&self, event: &mut ExtendableEvent) -> Result<(), ServiceWorkerError>;

    /// Leaving the event without a response passes the request through.
    async fn on_fetch(&self, event: &mut FetchEvent) -> Result<(), ServiceWorkerError>;

    async fn on_push(&self, event: &mut PushEvent) -> Result<(), ServiceWorkerError>;

    async fn on_notification_click(
        &self,
        event: &mut NotificationClickEvent,
    ) -> Result<(), ServiceWorkerError>;
}

/// Platform services available to a running worker.
#[async_trait]
pub trait WorkerScope: Send + Sync {
    /// Activate as soon as install finishes instead of waiting for old
    /// clients to go away.
    async fn skip_waiting(&self) -> Result<(), ServiceWorkerError>;

    /// Take control of every open window. Returns how many were claimed.
    async fn claim_clients(&self) -> Result<usize, ServiceWorkerError>;

    async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError>;

    async fn close_notification(&self, tag: &str) -> Result<(), ServiceWorkerError>;

    async fn open_window(&self, url: Url) -> Result<(), ServiceWorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_settle_waits_for_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut lifetime = ExtendableEvent::new();
        for _ in 0..3 {
            let done = done.clone();
            lifetime.wait_until(tokio::spawn(async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(lifetime.pending(), 3);

        lifetime.settle().await;
        assert_eq!(lifetime.pending(), 0);
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_survives_panicking_task() {
        let mut lifetime = ExtendableEvent::new();
        lifetime.wait_until(tokio::spawn(async { panic!("boom") }));
        lifetime.settle().await;
        assert_eq!(lifetime.pending(), 0);
    }

    #[test]
    fn test_respond_once() {
        let url = Url::parse("https://school.example/").unwrap();
        let mut event = FetchEvent::new(Request::get(url)).with_client("client-1");
        assert!(!event.was_responded());

        event
            .respond_with(Response::new(200, "a"), ResponseSource::Cache)
            .unwrap();
        let second = event.respond_with(Response::new(200, "b"), ResponseSource::Synthetic);
        assert!(matches!(second, Err(ServiceWorkerError::StateError(_))));

        let (_, source) = event.take_response().unwrap();
        assert_eq!(source, ResponseSource::Cache);
    }
}
