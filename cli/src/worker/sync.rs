//! Background sync: replay records the foreground saved while offline.
//!
//! Runs are single-flight per tag. A caller arriving while a run is in flight
//! joins it and receives its report; the join also asks the runner for one
//! more pass, so records saved after the run began are not missed. Across
//! processes the same tag is guarded by a lease row in the record store.
//! Every POST carries the record key as its `Idempotency-Key` for the case
//! where an acknowledgment was lost.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use coop_core::db::Database;
use coop_core::models::{Collection, SyncRecord};

use super::Worker;
use super::error::{SyncItemError, WorkerError};
use super::store::StoreHandle;
use crate::config::SyncTargetConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub tag: String,
    pub collection: Collection,
    pub endpoint: String,
}

impl From<&SyncTargetConfig> for SyncTarget {
    fn from(config: &SyncTargetConfig) -> Self {
        Self {
            tag: config.tag.clone(),
            collection: config.collection,
            endpoint: config.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub tag: String,
    /// POSTs made, counting a record again if it was resent after an edit.
    pub attempted: usize,
    pub synced: usize,
    pub failures: Vec<SyncItemError>,
    /// Records that were edited while their POST was in flight. The edit is
    /// kept unsynced and goes out on the next run.
    pub superseded: Vec<String>,
}

impl SyncReport {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attempted: 0,
            synced: 0,
            failures: Vec::new(),
            superseded: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.superseded.is_empty()
    }

    fn forget(&mut self, key: &str) {
        self.failures.retain(|f| f.key != key);
        self.superseded.retain(|k| k != key);
    }
}

type RunResult = Result<SyncReport, WorkerError>;
type Waiters = Vec<oneshot::Sender<RunResult>>;

/// Callers joined to one tag's run.
#[derive(Default)]
struct Inflight {
    waiters: Waiters,
    /// Someone joined after the current pass started.
    rerun: bool,
}

enum Slot<'a> {
    /// Nobody is running this tag; the caller runs it.
    Run(RunGuard<'a>),
    /// A run is in flight; its result arrives here.
    Join(oneshot::Receiver<RunResult>),
}

/// Holds a tag's slot while its run is in flight. Dropping it without
/// finishing (the run was cancelled) releases the slot and the joined
/// callers see the run as abandoned.
struct RunGuard<'a> {
    queue: &'a SyncQueue,
    tag: String,
    finished: bool,
}

impl RunGuard<'_> {
    /// True, and the flag cleared, if a caller joined since the last check.
    fn take_rerun(&self) -> bool {
        self.queue
            .inflight()
            .get_mut(&self.tag)
            .is_some_and(|entry| std::mem::take(&mut entry.rerun))
    }

    /// Hand `result` to every joined caller and release the slot, unless the
    /// result is a success and a caller joined since the last check. Then
    /// nothing is sent and false tells the runner to go again.
    fn try_finish(&mut self, result: &RunResult) -> bool {
        if result.is_ok() && self.take_rerun() {
            return false;
        }
        self.finished = true;
        let entry = self.queue.inflight().remove(&self.tag).unwrap_or_default();
        for waiter in entry.waiters {
            let _ = waiter.send(result.clone());
        }
        true
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.inflight().remove(&self.tag);
        }
    }
}

/// A tag's lease row, owned by this worker for the length of a run.
/// Dropped without [`Lease::release`], it is released in the background;
/// if that never happens the row simply expires.
struct Lease {
    store: StoreHandle<Database>,
    name: String,
    holder: String,
    ttl: Duration,
    released: bool,
}

impl Lease {
    async fn acquire(
        store: &StoreHandle<Database>,
        tag: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, WorkerError> {
        let mut lease = Self {
            store: store.clone(),
            name: format!("sync:{tag}"),
            holder: holder.to_string(),
            ttl,
            released: false,
        };
        if lease.renew().await? {
            Ok(Some(lease))
        } else {
            lease.released = true;
            Ok(None)
        }
    }

    /// Push the expiry out again. False means another process took over.
    async fn renew(&self) -> Result<bool, WorkerError> {
        let (name, holder, ttl) = (self.name.clone(), self.holder.clone(), self.ttl);
        Ok(self
            .store
            .with(move |db| db.acquire_lease(&name, &holder, ttl))
            .await?)
    }

    async fn release(mut self) {
        self.released = true;
        let (name, holder) = (self.name.clone(), self.holder.clone());
        if let Err(err) = self
            .store
            .with(move |db| db.release_lease(&name, &holder))
            .await
        {
            tracing::warn!(lease = %self.name, error = %err, "failed to release sync lease");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let (name, holder) = (self.name.clone(), self.holder.clone());
        runtime.spawn(async move {
            let _ = store.with(move |db| db.release_lease(&name, &holder)).await;
        });
    }
}

pub struct SyncQueue {
    targets: Vec<SyncTarget>,
    /// Identifies this worker in lease rows.
    holder: String,
    inflight: Mutex<HashMap<String, Inflight>>,
    /// Registered tags waiting for connectivity.
    pending: Mutex<BTreeSet<String>>,
}

impl SyncQueue {
    pub fn new(targets: &[SyncTargetConfig]) -> Self {
        Self {
            targets: targets.iter().map(SyncTarget::from).collect(),
            holder: format!("{}:{}", std::process::id(), uuid::Uuid::new_v4()),
            inflight: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, Inflight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_set(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self, tag: &str) -> Option<&SyncTarget> {
        self.targets.iter().find(|t| t.tag == tag)
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending_set().iter().cloned().collect()
    }

    fn claim(&self, tag: &str) -> Slot<'_> {
        let mut inflight = self.inflight();
        if let Some(entry) = inflight.get_mut(tag) {
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            entry.rerun = true;
            Slot::Join(rx)
        } else {
            inflight.insert(tag.to_string(), Inflight::default());
            Slot::Run(RunGuard {
                queue: self,
                tag: tag.to_string(),
                finished: false,
            })
        }
    }

    #[cfg(test)]
    fn is_running(&self, tag: &str) -> bool {
        self.inflight().contains_key(tag)
    }
}

impl Worker {
    /// Handle a sync event for `tag`.
    pub async fn on_sync(&self, tag: &str) -> RunResult {
        let Some(target) = self.sync.target(tag).cloned() else {
            tracing::warn!(tag, "sync event for unknown tag ignored");
            return Err(WorkerError::UnknownSyncTag(tag.to_string()));
        };

        match self.sync.claim(tag) {
            Slot::Join(rx) => {
                tracing::debug!(tag, "joining in-flight sync run");
                rx.await
                    .map_err(|_| WorkerError::SyncAbandoned(tag.to_string()))?
            }
            Slot::Run(mut guard) => {
                let result = self.run_leased(&target, &mut guard).await;
                if !guard.finished {
                    guard.try_finish(&result);
                }
                result
            }
        }
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.fetch_timeout_secs.saturating_mul(2).max(60))
    }

    /// Replay under the cross-process lease until no caller is waiting for
    /// another pass. The lease is released before the slot, so a run started
    /// right after this one never loses its lease to our release.
    async fn run_leased(&self, target: &SyncTarget, guard: &mut RunGuard<'_>) -> RunResult {
        let mut report = SyncReport::new(&target.tag);
        let mut sent = HashMap::new();
        loop {
            let Some(lease) =
                Lease::acquire(&self.store, &target.tag, &self.sync.holder, self.lease_ttl())
                    .await?
            else {
                tracing::info!(tag = %target.tag, "another process is syncing this tag");
                return Err(WorkerError::SyncBusy(target.tag.clone()));
            };

            let pass = loop {
                let pass = self
                    .replay(target, &lease, &mut report, &mut sent)
                    .await
                    .map(|()| report.clone());
                if pass.is_err() || !guard.take_rerun() {
                    break pass;
                }
                tracing::debug!(tag = %target.tag, "new work joined the run, replaying again");
            };
            lease.release().await;

            if guard.try_finish(&pass) {
                if let Ok(report) = &pass {
                    tracing::info!(
                        tag = %target.tag,
                        attempted = report.attempted,
                        synced = report.synced,
                        failed = report.failures.len(),
                        superseded = report.superseded.len(),
                        "sync run finished"
                    );
                }
                return pass;
            }
            tracing::debug!(tag = %target.tag, "new work joined while the run was closing");
        }
    }

    /// One pass over the collection. `sent` remembers what earlier passes of
    /// the same run posted, so a record is only resent if it changed.
    async fn replay(
        &self,
        target: &SyncTarget,
        lease: &Lease,
        report: &mut SyncReport,
        sent: &mut HashMap<String, SyncRecord>,
    ) -> Result<(), WorkerError> {
        let records = self.store.get_all(target.collection).await?;

        for record in records.into_iter().filter(|r| !r.is_synced()) {
            let key = record.key().to_string();
            if sent.get(&key) == Some(&record) {
                continue;
            }
            if !lease.renew().await? {
                return Err(WorkerError::SyncBusy(target.tag.clone()));
            }
            report.attempted += 1;

            let reason = match self.network.post_json(&target.endpoint, &record, &key).await {
                Ok(status) if status.is_success() => {
                    let collection = target.collection;
                    let posted = record.clone();
                    let flipped = self
                        .store
                        .with(move |db| db.mark_synced_if_unchanged(collection, &posted))
                        .await?;
                    report.forget(&key);
                    if flipped {
                        report.synced += 1;
                        tracing::debug!(tag = %target.tag, key = %key, "record synced");
                    } else {
                        tracing::info!(tag = %target.tag, key = %key, "record edited during sync, kept unsynced");
                        report.superseded.push(key.clone());
                    }
                    sent.insert(key, record);
                    continue;
                }
                Ok(status) => format!("remote answered {status}"),
                Err(err) => err.to_string(),
            };
            tracing::warn!(tag = %target.tag, key = %key, reason = %reason, "record not synced");
            report.forget(&key);
            report.failures.push(SyncItemError {
                key: key.clone(),
                reason,
            });
            sent.insert(key, record);
        }
        Ok(())
    }

    /// Remember a sync request from the foreground and try it right away in
    /// the background. Unfinished registrations are retried whenever the
    /// connectivity monitor sees the origin.
    pub fn register_sync(self: &Arc<Self>, tag: &str) -> Result<(), WorkerError> {
        if self.sync.target(tag).is_none() {
            tracing::warn!(tag, "sync registration for unknown tag ignored");
            return Err(WorkerError::UnknownSyncTag(tag.to_string()));
        }
        self.sync.pending_set().insert(tag.to_string());
        tracing::info!(tag, "sync registered");

        let worker = Arc::clone(self);
        self.keepalive.wait_until("sync", async move {
            worker.fire_pending().await;
        });
        Ok(())
    }

    /// Fire every pending registration once. Registrations whose run was
    /// complete are dropped; the rest stay for the next attempt.
    pub async fn fire_pending(&self) -> Vec<(String, RunResult)> {
        let mut results = Vec::new();
        for tag in self.sync.pending() {
            let result = self.on_sync(&tag).await;
            match &result {
                Ok(report) if report.is_complete() => {
                    self.sync.pending_set().remove(&tag);
                }
                Ok(report) => {
                    tracing::info!(
                        tag = %tag,
                        failed = report.failures.len(),
                        superseded = report.superseded.len(),
                        "sync stays registered"
                    );
                }
                Err(WorkerError::SyncBusy(_)) => {
                    tracing::info!(tag = %tag, "sync stays registered, another process holds it");
                }
                Err(err) => {
                    tracing::error!(tag = %tag, error = %err, "sync run failed");
                }
            }
            results.push((tag, result));
        }
        results
    }

    pub fn pending_syncs(&self) -> Vec<String> {
        self.sync.pending()
    }
}
