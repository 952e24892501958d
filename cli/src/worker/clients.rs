use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// An application window the host knows about.
#[derive(Debug, Clone, Serialize)]
pub struct WindowClient {
    pub id: String,
    pub url: String,
    pub focused: bool,
    /// Cache version of the worker controlling this window, if any.
    pub controller: Option<String>,
    pub opened_at: String,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<WindowClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WindowClient>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, url: &str, controller: Option<String>) -> WindowClient {
        let client = WindowClient {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            focused: false,
            controller,
            opened_at: chrono::Utc::now().to_rfc3339(),
        };
        self.lock().push(client.clone());
        client
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != before
    }

    pub fn match_all(&self) -> Vec<WindowClient> {
        self.lock().clone()
    }

    /// First window whose path equals `path`.
    pub fn find_by_path(&self, path: &str) -> Option<WindowClient> {
        self.lock()
            .iter()
            .find(|c| url_path(&c.url) == path)
            .cloned()
    }

    pub fn focus(&self, id: &str) -> Option<WindowClient> {
        let mut clients = self.lock();
        if !clients.iter().any(|c| c.id == id) {
            return None;
        }
        let mut focused = None;
        for client in clients.iter_mut() {
            client.focused = client.id == id;
            if client.focused {
                focused = Some(client.clone());
            }
        }
        focused
    }

    pub fn open_window(&self, url: &str, controller: Option<String>) -> WindowClient {
        let client = self.register(url, controller);
        self.focus(&client.id).unwrap_or(client)
    }

    /// Take control of every window. Returns how many changed controller.
    pub fn claim(&self, version: &str) -> usize {
        let mut changed = 0;
        for client in self.lock().iter_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                changed += 1;
            }
        }
        changed
    }

    /// Windows still controlled by a different worker version.
    pub fn controlled_by_other(&self, version: &str) -> usize {
        self.lock()
            .iter()
            .filter(|c| c.controller.as_deref().is_some_and(|v| v != version))
            .count()
    }
}

/// Path part of a URL: `http://host:8080/a?b` → `/a?b`, `/a` → `/a`.
pub(crate) fn url_path(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("http://127.0.0.1:8080/"), "/");
        assert_eq!(url_path("https://farm.local"), "/");
        assert_eq!(url_path("https://farm.local/cycles?x=1"), "/cycles?x=1");
        assert_eq!(url_path("/reports"), "/reports");
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ClientRegistry::new();
        let a = registry.register("/", None);
        registry.register("/cycles", None);
        assert_eq!(registry.match_all().len(), 2);
        assert!(registry.remove(&a.id));
        assert!(!registry.remove(&a.id));
        assert_eq!(registry.match_all().len(), 1);
    }

    #[test]
    fn test_focus_is_exclusive() {
        let registry = ClientRegistry::new();
        let a = registry.register("/", None);
        let b = registry.register("/cycles", None);
        registry.focus(&a.id).unwrap();
        registry.focus(&b.id).unwrap();
        let focused: Vec<String> = registry
            .match_all()
            .into_iter()
            .filter(|c| c.focused)
            .map(|c| c.id)
            .collect();
        assert_eq!(focused, vec![b.id]);
        assert!(registry.focus("missing").is_none());
    }

    #[test]
    fn test_find_by_path_ignores_origin() {
        let registry = ClientRegistry::new();
        registry.register("http://localhost:8080/cycles", None);
        let root = registry.register("http://localhost:8080/", None);
        assert_eq!(registry.find_by_path("/").unwrap().id, root.id);
        assert!(registry.find_by_path("/inventory").is_none());
    }

    #[test]
    fn test_claim_and_controlled_by_other() {
        let registry = ClientRegistry::new();
        registry.register("/", Some("coop-farm-v1".to_string()));
        registry.register("/cycles", None);
        assert_eq!(registry.controlled_by_other("coop-farm-v2"), 1);
        assert_eq!(registry.claim("coop-farm-v2"), 2);
        assert_eq!(registry.controlled_by_other("coop-farm-v2"), 0);
        assert_eq!(registry.claim("coop-farm-v2"), 0);
    }

    #[test]
    fn test_open_window_focuses_new_client() {
        let registry = ClientRegistry::new();
        let existing = registry.register("/cycles", None);
        registry.focus(&existing.id);
        let opened = registry.open_window("/", None);
        assert!(opened.focused);
        assert_eq!(registry.match_all().iter().filter(|c| c.focused).count(), 1);
    }
}
