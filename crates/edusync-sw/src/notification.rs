//! Push notification formatting and click routing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{NotificationAction, WorkerConfig};
use crate::ServiceWorkerError;

/// Inbound push payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// A notification ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub renotify: bool,
    pub actions: Vec<NotificationAction>,
}

/// What a notification click leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickRoute {
    OpenWindow(Url),
    /// Close only.
    Dismiss,
}

/// Turns push payloads into notifications and clicks into navigation.
#[derive(Debug, Clone)]
pub struct NotificationRelay {
    config: Arc<WorkerConfig>,
}

impl NotificationRelay {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self { config }
    }

    /// Build the notification for a push. `None` means nothing is shown:
    /// the push had no data, or the data is not a JSON object.
    pub fn compose(&self, data: Option<&[u8]>) -> Option<Notification> {
        let Some(data) = data else {
            debug!("Push without data, nothing to show");
            return None;
        };

        let payload = match serde_json::from_slice::<Value>(data) {
            Ok(value @ Value::Object(_)) => match PushPayload::deserialize(value) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed push payload");
                    return None;
                }
            },
            Ok(other) => {
                warn!(kind = json_kind(&other), "Ignoring push payload that is not an object");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed push payload");
                return None;
            }
        };

        let settings = &self.config.notification;
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());

        Some(Notification {
            title: non_empty(payload.title).unwrap_or_else(|| settings.default_title.clone()),
            body: non_empty(payload.body).unwrap_or_else(|| settings.default_body.clone()),
            icon: settings.icon.clone(),
            badge: settings.badge.clone(),
            tag: settings.tag.clone(),
            renotify: settings.renotify,
            actions: settings.actions.clone(),
        })
    }

    /// Route a click on `action` (`None` for the notification body).
    pub fn route_click(&self, action: Option<&str>) -> Result<ClickRoute, ServiceWorkerError> {
        match action {
            Some(action) if action == self.config.notification.open_action => {
                let url = self
                    .config
                    .open_url()
                    .map_err(|e| ServiceWorkerError::NotificationError(e.to_string()))?;
                Ok(ClickRoute::OpenWindow(url))
            }
            _ => Ok(ClickRoute::Dismiss),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
