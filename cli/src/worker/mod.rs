//! The offline worker: cache lifecycle, request interception, background
//! sync and the notification bridge, driven through explicit hooks.
//!
//! A [`Worker`] is created once per host with [`Worker::new`] and shared as
//! `Arc<Worker>`. Hooks are plain `async fn`s; work that must outlive the
//! caller is handed to [`KeepAlive`].

pub mod clients;
pub mod error;
pub mod intercept;
pub mod keepalive;
pub mod lifecycle;
pub mod notify;
pub mod store;
pub mod sync;
#[cfg(test)]
pub(crate) mod testutil;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use coop_core::cache::CacheStorage;
use coop_core::db::Database;

use crate::config::WorkerConfig;
use crate::network::OriginClient;

use self::clients::{ClientRegistry, WindowClient};
use self::error::WorkerError;
use self::keepalive::KeepAlive;
use self::lifecycle::{ActivateReport, WorkerState};
use self::notify::{NotificationCenter, Notifier};
use self::store::StoreHandle;
use self::sync::SyncQueue;

/// Worker state keys persisted in the record store.
pub(crate) const INSTALLED_CACHE_KEY: &str = "installed_cache";
pub(crate) const ACTIVE_CACHE_KEY: &str = "active_cache";

/// Message posted by a window to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub cache_name: String,
    /// Cache version currently controlling windows, if any.
    pub active_version: Option<String>,
    pub origin: String,
    pub clients: usize,
    pub notifications: usize,
    pub pending_syncs: Vec<String>,
    pub tasks_in_flight: usize,
}

pub struct Worker {
    config: WorkerConfig,
    network: OriginClient,
    cache: StoreHandle<CacheStorage>,
    store: StoreHandle<Database>,
    state: Mutex<WorkerState>,
    active_version: Mutex<Option<String>>,
    clients: ClientRegistry,
    notifications: NotificationCenter,
    sync: SyncQueue,
    keepalive: KeepAlive,
}

impl Worker {
    /// Build a worker over already-opened storage.
    ///
    /// The lifecycle state is restored from what earlier runs persisted: a
    /// worker whose bucket was activated before resumes as `Activated`, one
    /// that was only installed resumes as `Installed`.
    pub fn new(config: WorkerConfig, cache: CacheStorage, store: Database) -> Result<Self> {
        let network = OriginClient::new(
            &config.origin,
            Duration::from_secs(config.fetch_timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
        )?;

        let installed = store.get_state(INSTALLED_CACHE_KEY)?;
        let active = store.get_state(ACTIVE_CACHE_KEY)?;
        let has_bucket = cache.has_bucket(&config.cache_name)?;
        let current = Some(config.cache_name.as_str());

        let state = if has_bucket && active.as_deref() == current {
            WorkerState::Activated
        } else if has_bucket && installed.as_deref() == current {
            WorkerState::Installed
        } else {
            WorkerState::Parsed
        };
        tracing::debug!(
            cache = %config.cache_name,
            state = state.as_str(),
            active = active.as_deref().unwrap_or("-"),
            "worker restored"
        );

        Ok(Self {
            sync: SyncQueue::new(&config.sync),
            config,
            network,
            cache: StoreHandle::new(cache),
            store: StoreHandle::new(store),
            state: Mutex::new(state),
            active_version: Mutex::new(active),
            clients: ClientRegistry::new(),
            notifications: NotificationCenter::new(),
            keepalive: KeepAlive::new(),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle<Database> {
        &self.store
    }

    pub fn keepalive(&self) -> &KeepAlive {
        &self.keepalive
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(from = state.as_str(), to = next.as_str(), "worker state changed");
        *state = next;
    }

    /// Move to `next` if the current state is one of `from`.
    fn transition(&self, from: &[WorkerState], next: WorkerState) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !from.contains(&state) {
            return Err(WorkerError::InvalidState(state.as_str(), next.as_str()));
        }
        tracing::info!(from = state.as_str(), to = next.as_str(), "worker state changed");
        *state = next;
        Ok(())
    }

    pub fn active_version(&self) -> Option<String> {
        self.active_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install if needed, then activate unless an older version still
    /// controls open windows.
    pub async fn start(&self) -> Result<WorkerState, WorkerError> {
        match self.state() {
            WorkerState::Activated => {
                tracing::info!(cache = %self.config.cache_name, "worker already active");
            }
            WorkerState::Parsed | WorkerState::Redundant => {
                self.on_install().await?;
                self.activate_when_ready().await?;
            }
            WorkerState::Installed => {
                self.activate_when_ready().await?;
            }
            WorkerState::Installing | WorkerState::Activating => {
                return Err(WorkerError::InvalidState(
                    self.state().as_str(),
                    WorkerState::Installed.as_str(),
                ));
            }
        }
        Ok(self.state())
    }

    /// Activate an installed worker when no window is held by another version.
    pub async fn activate_when_ready(&self) -> Result<Option<ActivateReport>, WorkerError> {
        if self.state() != WorkerState::Installed {
            return Ok(None);
        }
        let waiting_on = self.clients.controlled_by_other(&self.config.cache_name);
        if waiting_on > 0 {
            tracing::info!(
                cache = %self.config.cache_name,
                clients = waiting_on,
                "installed, waiting for older windows to close"
            );
            return Ok(None);
        }
        self.on_activate().await.map(Some)
    }

    pub async fn on_message(
        &self,
        message: ControlMessage,
    ) -> Result<Option<ActivateReport>, WorkerError> {
        match message {
            ControlMessage::SkipWaiting => {
                if self.state() != WorkerState::Installed {
                    tracing::debug!(state = self.state().as_str(), "SKIP_WAITING ignored");
                    return Ok(None);
                }
                tracing::info!("SKIP_WAITING received, activating now");
                self.on_activate().await.map(Some)
            }
        }
    }

    /// A window opened by the application announces itself.
    pub fn on_client_opened(&self, url: &str) -> WindowClient {
        let controller = if self.state() == WorkerState::Activated {
            Some(self.config.cache_name.clone())
        } else {
            self.active_version()
        };
        let client = self.clients.register(url, controller);
        tracing::debug!(client = %client.id, url, "client registered");
        client
    }

    /// Returns false if no such window was known.
    pub async fn on_client_closed(&self, id: &str) -> Result<bool, WorkerError> {
        if !self.clients.remove(id) {
            return Ok(false);
        }
        tracing::debug!(client = id, "client closed");
        self.activate_when_ready().await?;
        Ok(true)
    }

    /// True when the origin answers at all.
    pub async fn origin_reachable(&self) -> bool {
        self.network.probe().await
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state(),
            cache_name: self.config.cache_name.clone(),
            active_version: self.active_version(),
            origin: self.network.origin().to_string(),
            clients: self.clients.match_all().len(),
            notifications: self.notifications.list().len(),
            pending_syncs: self.sync.pending(),
            tasks_in_flight: self.keepalive.pending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testutil::{FarmLog, farm_origin, spawn_origin, test_config, test_worker};

    #[test]
    fn test_control_message_parsing() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(msg, ControlMessage::SkipWaiting);
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"RELOAD"}"#).is_err());
    }

    #[tokio::test]
    async fn test_start_installs_and_activates() {
        let origin = spawn_origin(farm_origin(FarmLog::default(), Duration::ZERO)).await;
        let worker = test_worker(&origin.url);
        assert_eq!(worker.state(), WorkerState::Parsed);

        assert_eq!(worker.start().await.unwrap(), WorkerState::Activated);
        assert_eq!(worker.active_version().as_deref(), Some("coop-farm-v1"));

        // Starting again is a no-op
        assert_eq!(worker.start().await.unwrap(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_state_restored_from_disk() {
        let origin = spawn_origin(farm_origin(FarmLog::default(), Duration::ZERO)).await;
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("coop.db");
        let cache_path = tmp.path().join("cache.db");

        let open = || {
            Worker::new(
                test_config(&origin.url),
                CacheStorage::open(&cache_path).unwrap(),
                Database::open(&db_path).unwrap(),
            )
            .unwrap()
        };

        let worker = open();
        worker.on_install().await.unwrap();
        drop(worker);
        assert_eq!(open().state(), WorkerState::Installed);

        let worker = open();
        worker.on_activate().await.unwrap();
        drop(worker);
        assert_eq!(open().state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_new_version_waits_for_old_clients() {
        let origin = spawn_origin(farm_origin(FarmLog::default(), Duration::ZERO)).await;
        let mut config = test_config(&origin.url);
        config.cache_name = "coop-farm-v2".to_string();
        let worker = testutil::worker_with(config, CacheStorage::open_in_memory().unwrap());

        let old = worker
            .clients()
            .register("http://farm.local/", Some("coop-farm-v1".to_string()));

        assert_eq!(worker.start().await.unwrap(), WorkerState::Installed);

        // Closing the only old window lets the new version take over
        assert!(worker.on_client_closed(&old.id).await.unwrap());
        assert_eq!(worker.state(), WorkerState::Activated);
        assert!(!worker.on_client_closed(&old.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_immediately() {
        let origin = spawn_origin(farm_origin(FarmLog::default(), Duration::ZERO)).await;
        let mut config = test_config(&origin.url);
        config.cache_name = "coop-farm-v2".to_string();
        let worker = testutil::worker_with(config, CacheStorage::open_in_memory().unwrap());
        let old = worker
            .clients()
            .register("/", Some("coop-farm-v1".to_string()));

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);

        let report = worker
            .on_message(ControlMessage::SkipWaiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(worker.state(), WorkerState::Activated);
        let claimed = worker.clients().match_all();
        assert_eq!(claimed[0].id, old.id);
        assert_eq!(claimed[0].controller.as_deref(), Some("coop-farm-v2"));

        // A second SKIP_WAITING has nothing to do
        assert!(
            worker
                .on_message(ControlMessage::SkipWaiting)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_client_controller_follows_state() {
        let origin = spawn_origin(farm_origin(FarmLog::default(), Duration::ZERO)).await;
        let worker = test_worker(&origin.url);
        assert!(worker.on_client_opened("/").controller.is_none());

        worker.start().await.unwrap();
        let client = worker.on_client_opened("/cycles");
        assert_eq!(client.controller.as_deref(), Some("coop-farm-v1"));

        let status = worker.status();
        assert_eq!(status.clients, 2);
        assert_eq!(status.state, WorkerState::Activated);
        assert_eq!(status.origin, origin.url);
    }
}
