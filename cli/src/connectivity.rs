//! Fires registered background syncs once the origin is reachable.

use std::sync::Arc;
use std::time::Duration;

use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No registration was waiting; the origin was not probed.
    Idle,
    Offline,
    /// Pending registrations were fired; `remaining` are still registered.
    Fired { remaining: usize },
}

pub struct ConnectivityMonitor {
    worker: Arc<Worker>,
    interval: Duration,
    online: Option<bool>,
}

impl ConnectivityMonitor {
    pub fn new(worker: Arc<Worker>) -> Self {
        let interval = Duration::from_secs(worker.config().connectivity_interval_secs);
        Self {
            worker,
            interval,
            online: None,
        }
    }

    pub async fn tick(&mut self) -> Tick {
        if self.worker.pending_syncs().is_empty() {
            return Tick::Idle;
        }

        let online = self.worker.origin_reachable().await;
        if self.online != Some(online) {
            if online {
                tracing::info!("origin reachable");
            } else {
                tracing::warn!("origin unreachable, holding background syncs");
            }
            self.online = Some(online);
        }
        if !online {
            return Tick::Offline;
        }

        let worker = Arc::clone(&self.worker);
        let run = self.worker.keepalive().wait_until("connectivity", async move {
            worker.fire_pending().await;
        });
        if let Err(err) = run.await {
            tracing::error!(error = %err, "background sync task failed");
        }
        Tick::Fired {
            remaining: self.worker.pending_syncs().len(),
        }
    }

    /// Tick forever. Meant to be spawned and aborted at shutdown; a run that
    /// already started is tracked by the keep-alive registry.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let tick = self.tick().await;
            tracing::trace!(?tick, "connectivity tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coop_core::models::{Collection, SyncRecord};
    use serde_json::json;

    use crate::worker::testutil::{
        FarmLog, farm_origin, spawn_origin_on, test_worker, unreachable_origin,
    };

    #[tokio::test]
    async fn test_idle_without_registrations() {
        let worker = Arc::new(test_worker(&unreachable_origin().await));
        let mut monitor = ConnectivityMonitor::new(worker);
        assert_eq!(monitor.tick().await, Tick::Idle);
    }

    #[tokio::test]
    async fn test_sync_fires_when_origin_returns() {
        let url = unreachable_origin().await;
        let worker = Arc::new(test_worker(&url));
        let record = SyncRecord::from_value(json!({"id": "r1", "date": "2024-03-01"})).unwrap();
        worker
            .store()
            .put(Collection::DailyRecords, record)
            .await
            .unwrap();

        worker.register_sync("sync-daily-records").unwrap();
        worker.keepalive().drain().await;
        assert_eq!(worker.pending_syncs(), vec!["sync-daily-records"]);

        let mut monitor = ConnectivityMonitor::new(Arc::clone(&worker));
        assert_eq!(monitor.tick().await, Tick::Offline);

        let log = FarmLog::default();
        let _origin = spawn_origin_on(&url, farm_origin(log.clone(), Duration::ZERO)).await;

        assert_eq!(monitor.tick().await, Tick::Fired { remaining: 0 });
        assert_eq!(log.posts_for("r1"), 1);
        let stored = worker
            .store()
            .get_all(Collection::DailyRecords)
            .await
            .unwrap();
        assert!(stored[0].is_synced());
        assert_eq!(monitor.tick().await, Tick::Idle);
    }
}
