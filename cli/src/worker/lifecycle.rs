//! Install and activate: populate the current cache bucket from the static
//! manifest, then evict every other bucket and take control of open windows.

use serde::Serialize;

use coop_core::models::CachedResponse;

use super::error::{InstallError, WorkerError};
use super::{ACTIVE_CACHE_KEY, INSTALLED_CACHE_KEY, Worker};
use crate::network::FetchRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Install failed; the worker never serves from its bucket.
    Redundant,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub cache_name: String,
    pub assets: Vec<String>,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivateReport {
    pub cache_name: String,
    pub deleted: Vec<String>,
    pub claimed: usize,
}

impl Worker {
    /// Fetch every manifest asset and store them in the current bucket in one
    /// transaction. Any failed asset leaves the bucket untouched and the
    /// worker `Redundant`.
    pub async fn on_install(&self) -> Result<InstallReport, WorkerError> {
        self.transition(
            &[
                WorkerState::Parsed,
                WorkerState::Redundant,
                WorkerState::Installed,
            ],
            WorkerState::Installing,
        )?;

        match self.install_assets().await {
            Ok(report) => {
                self.set_state(WorkerState::Installed);
                tracing::info!(
                    cache = %report.cache_name,
                    assets = report.assets.len(),
                    bytes = report.bytes,
                    "install complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_state(WorkerState::Redundant);
                tracing::error!(cache = %self.config.cache_name, error = %err, "install failed");
                Err(err.into())
            }
        }
    }

    async fn install_assets(&self) -> Result<InstallReport, InstallError> {
        let cache_name = self.config.cache_name.clone();
        let mut entries: Vec<(String, CachedResponse)> =
            Vec::with_capacity(self.config.manifest.len());

        for asset in &self.config.manifest {
            let response = self
                .network
                .fetch(&FetchRequest::get(asset))
                .await
                .map_err(|e| InstallError::Asset {
                    asset: asset.clone(),
                    reason: e.to_string(),
                })?;
            if !(200..300).contains(&response.status) {
                return Err(InstallError::Asset {
                    asset: asset.clone(),
                    reason: format!("origin answered {}", response.status),
                });
            }
            tracing::debug!(asset = %asset, bytes = response.body.len(), "fetched manifest asset");
            entries.push((asset.clone(), response));
        }

        let assets: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let bytes = entries.iter().map(|(_, r)| r.body.len()).sum();

        let bucket = cache_name.clone();
        self.cache
            .with(move |cache| cache.put_all(&bucket, &entries))
            .await
            .map_err(|e| InstallError::Storage(e.0))?;

        let name = cache_name.clone();
        self.store
            .with(move |db| db.set_state(INSTALLED_CACHE_KEY, &name))
            .await
            .map_err(|e| InstallError::Storage(e.0))?;

        Ok(InstallReport {
            cache_name,
            assets,
            bytes,
        })
    }

    /// Delete every bucket but the current one, record the new active
    /// version and claim all open windows.
    pub async fn on_activate(&self) -> Result<ActivateReport, WorkerError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)?;

        match self.evict_stale_buckets().await {
            Ok(deleted) => {
                let cache_name = self.config.cache_name.clone();
                *self
                    .active_version
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cache_name.clone());
                self.set_state(WorkerState::Activated);
                let claimed = self.clients.claim(&cache_name);
                tracing::info!(
                    cache = %cache_name,
                    deleted = deleted.len(),
                    claimed,
                    "activated"
                );
                Ok(ActivateReport {
                    cache_name,
                    deleted,
                    claimed,
                })
            }
            Err(err) => {
                self.set_state(WorkerState::Installed);
                tracing::error!(error = %err, "activation failed");
                Err(err.into())
            }
        }
    }

    async fn evict_stale_buckets(&self) -> Result<Vec<String>, super::error::StoreError> {
        let current = self.config.cache_name.clone();
        let deleted = self
            .cache
            .with(move |cache| {
                let mut deleted = Vec::new();
                for name in cache.bucket_names()? {
                    if name != current && cache.delete_bucket(&name)? {
                        deleted.push(name);
                    }
                }
                Ok(deleted)
            })
            .await?;
        for name in &deleted {
            tracing::info!(cache = %name, "deleted stale cache");
        }

        let current = self.config.cache_name.clone();
        self.store
            .with(move |db| db.set_state(ACTIVE_CACHE_KEY, &current))
            .await?;
        Ok(deleted)
    }
}
