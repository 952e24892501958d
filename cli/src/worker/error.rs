use serde::Serialize;
use thiserror::Error;

/// A fetch attempt that never produced an HTTP response.
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// The install step failed; nothing from the manifest was stored.
#[derive(Debug, Error, Clone)]
pub enum InstallError {
    #[error("failed to fetch manifest asset {asset}: {reason}")]
    Asset { asset: String, reason: String },
    #[error("failed to write cache bucket: {0}")]
    Storage(String),
}

/// The record store or cache storage failed to open or a transaction aborted.
#[derive(Debug, Error, Clone)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

/// One record that could not be replayed. Collected, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct SyncItemError {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Error, Clone)]
pub enum WorkerError {
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no background sync registered for tag '{0}'")]
    UnknownSyncTag(String),
    #[error("sync run for '{0}' was abandoned before it finished")]
    SyncAbandoned(String),
    #[error("another process is already syncing '{0}'")]
    SyncBusy(String),
    #[error("invalid push payload: {0}")]
    InvalidPush(String),
    #[error("no notification with id '{0}'")]
    UnknownNotification(String),
    #[error("worker is {0}, expected {1}")]
    InvalidState(&'static str, &'static str),
}
