use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Worker;
use super::clients::{WindowClient, url_path};
use super::error::WorkerError;

pub const NOTIFICATION_ICON: &str = "/icons/icon-192x192.png";
pub const NOTIFICATION_BADGE: &str = "/icons/icon-72x72.png";
pub const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];

/// Body of a push message. Everything besides `title` and `body` is kept as
/// notification data.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationPayload {
    pub fn parse(bytes: &[u8]) -> Result<Self, WorkerError> {
        if bytes.is_empty() {
            return Err(WorkerError::InvalidPush("empty payload".to_string()));
        }
        serde_json::from_slice(bytes).map_err(|e| WorkerError::InvalidPush(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub actions: Vec<NotificationAction>,
    pub data: Map<String, Value>,
    pub shown_at: String,
}

impl Notification {
    pub fn from_payload(payload: NotificationPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: payload.title,
            body: payload.body,
            icon: NOTIFICATION_ICON.to_string(),
            badge: NOTIFICATION_BADGE.to_string(),
            vibrate: VIBRATE_PATTERN.to_vec(),
            actions: vec![
                NotificationAction {
                    action: "open".to_string(),
                    title: "Open".to_string(),
                },
                NotificationAction {
                    action: "close".to_string(),
                    title: "Close".to_string(),
                },
            ],
            data: payload.extra,
            shown_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Where notifications are displayed.
pub trait Notifier: Send + Sync {
    fn show(&self, notification: Notification);
    /// Remove a visible notification, returning it if it was shown.
    fn close(&self, id: &str) -> Option<Notification>;
    fn list(&self) -> Vec<Notification>;
}

/// Host notifier: logs each notification and keeps the visible ones in memory.
#[derive(Default)]
pub struct NotificationCenter {
    visible: Mutex<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.visible.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for NotificationCenter {
    fn show(&self, notification: Notification) {
        tracing::info!(
            id = %notification.id,
            title = %notification.title,
            body = %notification.body,
            "notification shown"
        );
        self.lock().push(notification);
    }

    fn close(&self, id: &str) -> Option<Notification> {
        let mut visible = self.lock();
        let pos = visible.iter().position(|n| n.id == id)?;
        Some(visible.remove(pos))
    }

    fn list(&self) -> Vec<Notification> {
        self.lock().clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ClickOutcome {
    /// The notification was dismissed without opening anything.
    Closed,
    /// An existing window at the root URL was focused.
    Focused { client: WindowClient },
    /// No window was open at the root URL; a new one was opened.
    Opened { client: WindowClient },
}

impl Worker {
    pub fn on_push(&self, bytes: &[u8]) -> Result<Notification, WorkerError> {
        let payload = NotificationPayload::parse(bytes).inspect_err(|err| {
            tracing::warn!(error = %err, "push payload rejected");
        })?;
        let notification = Notification::from_payload(payload);
        self.notifications.show(notification.clone());
        Ok(notification)
    }

    /// Close the notification, then focus or open the dashboard unless the
    /// action was `close`.
    pub fn on_notification_click(
        &self,
        id: &str,
        action: Option<&str>,
    ) -> Result<ClickOutcome, WorkerError> {
        let notification = self
            .notifications
            .close(id)
            .ok_or_else(|| WorkerError::UnknownNotification(id.to_string()))?;

        let action = action.unwrap_or_default();
        if !action.is_empty() && action != "open" {
            tracing::debug!(id, action, "notification dismissed");
            return Ok(ClickOutcome::Closed);
        }

        let root = &self.config.root_url;
        if let Some(existing) = self.clients.find_by_path(url_path(root)) {
            if let Some(client) = self.clients.focus(&existing.id) {
                tracing::info!(id = %notification.id, client = %client.id, "focused existing window");
                return Ok(ClickOutcome::Focused { client });
            }
        }

        let controller = (self.state() == super::lifecycle::WorkerState::Activated)
            .then(|| self.config.cache_name.clone());
        let client = self.clients.open_window(root, controller);
        tracing::info!(id = %notification.id, client = %client.id, url = %root, "opened new window");
        Ok(ClickOutcome::Opened { client })
    }
}
