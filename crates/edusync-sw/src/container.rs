//! Host side of the worker: registration slots, clients, notifications and
//! event dispatch.
//!
//! ```text
//! install ─► Installing ─┬─ Err ─► Redundant (previous active kept)
//!                        └─ Ok ──► Installed ─┬─ skip_waiting ─► Activating ─► Activated
//!                                             └─ activate() ──┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use edusync_net::{Request, Response};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::event::{
    ExtendableEvent, FetchEvent, NotificationClickEvent, PushEvent, ResponseSource,
    WorkerEventHandler, WorkerScope,
};
use crate::notification::Notification;
use crate::ServiceWorkerError;

// ==================== Types ====================

tokio::task_local! {
    /// Worker whose install event is running on the current task.
    static INSTALLING: ServiceWorkerId;
}

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<dyn WorkerEventHandler>,
}

impl ServiceWorker {
    pub fn new(handler: Arc<dyn WorkerEventHandler>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    pub fn handler(&self) -> Arc<dyn WorkerEventHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// ==================== Registration ====================

/// The three worker slots of one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,

    pub installing: Option<ServiceWorker>,

    /// Installed but not active.
    pub waiting: Option<ServiceWorker>,

    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether `url` falls inside this registration's scope.
    pub fn controls(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Take the installing worker if it is `id`. Any other occupant stays.
    fn take_installing(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Some(worker),
            other => {
                self.installing = other;
                None
            }
        }
    }

    /// Transition worker `id` from installing to waiting. Returns the waiting
    /// worker it replaced, now redundant. Fails when a newer install has
    /// taken the installing slot.
    pub fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let mut worker = self.take_installing(id).ok_or_else(|| {
            ServiceWorkerError::StateError(format!("Install of {id:?} was superseded"))
        })?;
        worker.set_state(ServiceWorkerState::Installed);
        Ok(self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        }))
    }

    /// Drop worker `id` after a failed install. `None` when it was already
    /// superseded.
    pub fn install_failed(&mut self, id: ServiceWorkerId, error: String) -> Option<ServiceWorker> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Redundant);
        worker.error = Some(error);
        Some(worker)
    }
}

// ==================== Clients ====================

/// A window the service worker may control.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,

    pub url: Url,

    pub focused: bool,

    /// Worker controlling this client's fetches.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// An uncontrolled, unfocused window client.
    pub fn window(url: Url) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            focused: false,
            controller: None,
        }
    }
}

/// Clients known to the host.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All clients, controlled or not.
    pub fn match_all(&self) -> Vec<&Client> {
        self.clients.values().collect()
    }

    /// Open a focused top-level window. Other windows lose focus.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        for client in self.clients.values_mut() {
            client.focused = false;
        }

        let mut client = Client::window(url);
        client.focused = true;
        client.controller = controller;
        self.add(client.clone());
        client
    }

    /// Make `worker` the controller of every client inside `scope`. Returns
    /// the ids of clients whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        self.clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect()
    }
}

// ==================== Notifications ====================

/// Displayed notifications keyed by tag. Showing a tag again replaces the
/// earlier notification.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: HashMap<String, Notification>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification, returning the one it replaced.
    pub fn show(&mut self, notification: Notification) -> Option<Notification> {
        self.shown.insert(notification.tag.clone(), notification)
    }

    pub fn close(&mut self, tag: &str) -> Option<Notification> {
        self.shown.remove(tag)
    }

    pub fn get(&self, tag: &str) -> Option<&Notification> {
        self.shown.get(tag)
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

// ==================== Host Events ====================

/// Events reported to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    NotificationShown {
        tag: String,
        title: String,
    },
    WindowOpened {
        client_id: String,
        url: Url,
    },
}

// ==================== Host Scope ====================

/// Platform services handed to a worker. Cheap to clone; every clone shares
/// the container's state.
#[derive(Clone)]
pub struct HostScope {
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<NotificationCenter>>,
    /// Workers that asked to skip waiting during their install.
    skip_waiting: Arc<RwLock<HashSet<ServiceWorkerId>>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl HostScope {
    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn state_change(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(worker = ?worker_id, state = ?new_state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }
}

#[async_trait]
impl WorkerScope for HostScope {
    async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        let worker = INSTALLING.try_with(|id| *id).map_err(|_| {
            ServiceWorkerError::StateError("skip_waiting outside an install event".to_string())
        })?;
        debug!(worker = ?worker, "Skip waiting requested");
        self.skip_waiting.write().await.insert(worker);
        Ok(())
    }

    async fn claim_clients(&self) -> Result<usize, ServiceWorkerError> {
        let (worker, scope) = {
            let registration = self.registration.read().await;
            let active = registration.get_active().ok_or_else(|| {
                ServiceWorkerError::StateError("No active worker to claim clients".to_string())
            })?;
            (active.id, registration.scope.clone())
        };

        let claimed = self.clients.write().await.claim(worker, &scope);
        for client_id in &claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: worker,
            });
        }
        info!(worker = ?worker, claimed = claimed.len(), "Clients claimed");
        Ok(claimed.len())
    }

    async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        let tag = notification.tag.clone();
        let title = notification.title.clone();
        if self.notifications.write().await.show(notification).is_some() {
            debug!(tag = %tag, "Replaced notification with same tag");
        }
        self.emit(ServiceWorkerEvent::NotificationShown { tag, title });
        Ok(())
    }

    async fn close_notification(&self, tag: &str) -> Result<(), ServiceWorkerError> {
        if self.notifications.write().await.close(tag).is_none() {
            debug!(tag, "Closing notification that is not shown");
        }
        Ok(())
    }

    async fn open_window(&self, url: Url) -> Result<(), ServiceWorkerError> {
        let controller = {
            let registration = self.registration.read().await;
            registration
                .get_active()
                .filter(|_| registration.controls(&url))
                .map(|w| w.id)
        };

        let client = self.clients.write().await.open_window(url.clone(), controller);
        info!(client = %client.id, url = %url, "Window opened");
        self.emit(ServiceWorkerEvent::WindowOpened {
            client_id: client.id,
            url,
        });
        Ok(())
    }
}

// ==================== Service Worker Container ====================

/// Outcome of dispatching a request to the controlling worker.
#[derive(Debug)]
pub enum FetchResult {
    /// The worker answered. `pending` holds detached work (the cache write)
    /// the embedder may settle.
    Responded {
        response: Response,
        source: ResponseSource,
        pending: ExtendableEvent,
    },
    /// No controlling worker, or the worker declined; the request goes to
    /// the network untouched.
    PassThrough(Request),
}

/// Drives one registration: runs the worker through install and activate,
/// and routes fetch, push and notification clicks to the active worker.
pub struct ServiceWorkerContainer {
    host: HostScope,
}

impl ServiceWorkerContainer {
    /// Create a container for `scope`.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let host = HostScope {
            registration: Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope))),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(NotificationCenter::new())),
            skip_waiting: Arc::new(RwLock::new(HashSet::new())),
            event_tx,
        };
        (Self { host }, event_rx)
    }

    /// Platform services for a worker running in this container.
    pub fn host_scope(&self) -> Arc<HostScope> {
        Arc::new(self.host.clone())
    }

    pub async fn scope(&self) -> Url {
        self.host.registration.read().await.scope.clone()
    }

    /// Run `handler` through install. On success the worker waits, or
    /// activates straight away if it asked to skip waiting. On failure it is
    /// redundant and the current active worker keeps control. An install
    /// overtaken by a newer one fails with `StateError`.
    pub async fn install(
        &self,
        handler: Arc<dyn WorkerEventHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = ServiceWorker::new(Arc::clone(&handler));
        let id = worker.id;
        worker.set_state(ServiceWorkerState::Installing);

        let superseded = self
            .host
            .registration
            .write()
            .await
            .installing
            .replace(worker)
            .map(|old| old.id);
        if let Some(old) = superseded {
            self.host.state_change(old, ServiceWorkerState::Redundant);
        }
        self.host.state_change(id, ServiceWorkerState::Installing);

        let mut lifetime = ExtendableEvent::new();
        let result = INSTALLING.scope(id, handler.on_install(&mut lifetime)).await;
        lifetime.settle().await;
        let skip = self.host.skip_waiting.write().await.remove(&id);

        if let Err(e) = result {
            warn!(worker = ?id, error = %e, "Install failed, worker is redundant");
            let dropped = self
                .host
                .registration
                .write()
                .await
                .install_failed(id, e.to_string());
            if dropped.is_some() {
                self.host.state_change(id, ServiceWorkerState::Redundant);
            }
            return Err(e);
        }

        let replaced = self.host.registration.write().await.install_complete(id);
        let replaced = match replaced {
            Ok(replaced) => replaced,
            Err(e) => {
                warn!(worker = ?id, "Install finished after a newer install took over");
                return Err(e);
            }
        };
        if let Some(old) = replaced {
            self.host.state_change(old, ServiceWorkerState::Redundant);
        }
        self.host.state_change(id, ServiceWorkerState::Installed);
        info!(worker = ?id, "Service worker installed");

        if skip {
            self.activate().await?;
        }
        Ok(id)
    }

    /// Promote the waiting worker and run its activate event. A failing
    /// activate handler is logged; the worker still becomes active.
    pub async fn activate(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let (id, handler, retired) = {
            let mut registration = self.host.registration.write().await;
            let mut worker = registration
                .waiting
                .take()
                .ok_or_else(|| ServiceWorkerError::NotFound("waiting worker".to_string()))?;
            worker.set_state(ServiceWorkerState::Activating);
            let id = worker.id;
            let handler = worker.handler();
            let retired = registration.active.replace(worker).map(|mut old| {
                old.set_state(ServiceWorkerState::Redundant);
                old.id
            });
            (id, handler, retired)
        };
        if let Some(old) = retired {
            self.host.state_change(old, ServiceWorkerState::Redundant);
        }
        self.host.state_change(id, ServiceWorkerState::Activating);

        let mut lifetime = ExtendableEvent::new();
        if let Err(e) = handler.on_activate(&mut lifetime).await {
            warn!(worker = ?id, error = %e, "Activate handler failed");
        }
        lifetime.settle().await;

        if let Some(active) = self
            .host
            .registration
            .write()
            .await
            .active
            .as_mut()
            .filter(|w| w.id == id)
        {
            active.set_state(ServiceWorkerState::Activated);
        }
        self.host.state_change(id, ServiceWorkerState::Activated);
        info!(worker = ?id, "Service worker activated");
        Ok(id)
    }

    /// Dispatch a request to the active worker.
    ///
    /// Navigations are only routed when they fall inside the scope.
    pub async fn fetch(&self, request: Request) -> FetchResult {
        let handler = {
            let registration = self.host.registration.read().await;
            registration
                .get_active()
                .filter(|w| w.is_active())
                .filter(|_| !request.is_navigation() || registration.controls(&request.url))
                .map(|w| w.handler())
        };
        let Some(handler) = handler else {
            return FetchResult::PassThrough(request);
        };

        let mut event = FetchEvent::new(request);
        if let Err(e) = handler.on_fetch(&mut event).await {
            warn!(url = %event.request.url, error = %e, "Fetch handler failed");
        }

        match event.take_response() {
            Some((response, source)) => FetchResult::Responded {
                response,
                source,
                pending: event.lifetime,
            },
            None => FetchResult::PassThrough(event.request),
        }
    }

    /// Deliver a push message to the active worker.
    pub async fn push(&self, data: Option<Bytes>) -> Result<(), ServiceWorkerError> {
        let handler = self.active_handler().await?;

        let mut event = PushEvent::new(data);
        if let Err(e) = handler.on_push(&mut event).await {
            warn!(error = %e, "Push handler failed");
        }
        event.lifetime.settle().await;
        Ok(())
    }

    /// Click the notification shown under `tag`, on `action` or on its body.
    pub async fn click_notification(
        &self,
        tag: &str,
        action: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let handler = self.active_handler().await?;
        let notification = self
            .host
            .notifications
            .read()
            .await
            .get(tag)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {tag}")))?;

        let mut event = NotificationClickEvent::new(notification, action.map(str::to_string));
        if let Err(e) = handler.on_notification_click(&mut event).await {
            warn!(tag, error = %e, "Notification click handler failed");
        }
        event.lifetime.settle().await;
        Ok(())
    }

    async fn active_handler(&self) -> Result<Arc<dyn WorkerEventHandler>, ServiceWorkerError> {
        self.host
            .registration
            .read()
            .await
            .get_active()
            .map(ServiceWorker::handler)
            .ok_or_else(|| ServiceWorkerError::NotFound("active worker".to_string()))
    }

    /// Register an open window. It stays uncontrolled until a claim.
    pub async fn add_client(&self, url: Url) -> String {
        let client = Client::window(url);
        let id = client.id.clone();
        self.host.clients.write().await.add(client);
        id
    }

    pub async fn client(&self, id: &str) -> Option<Client> {
        self.host.clients.read().await.get(id).cloned()
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.host
            .clients
            .read()
            .await
            .match_all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn notification(&self, tag: &str) -> Option<Notification> {
        self.host.notifications.read().await.get(tag).cloned()
    }

    pub async fn notification_count(&self) -> usize {
        self.host.notifications.read().await.len()
    }

    /// Id and state of the active worker.
    pub async fn active(&self) -> Option<(ServiceWorkerId, ServiceWorkerState)> {
        let registration = self.host.registration.read().await;
        registration.active.as_ref().map(|w| (w.id, w.state))
    }

    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.host.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    pub async fn installing(&self) -> Option<ServiceWorkerId> {
        self.host
            .registration
            .read()
            .await
            .installing
            .as_ref()
            .map(|w| w.id)
    }
}
