use std::sync::{Arc, Mutex, PoisonError};

use coop_core::db::KeyValueStore;
use coop_core::models::{Collection, SyncRecord};

use super::error::StoreError;

/// Async access to a synchronous store.
///
/// Every operation runs on the blocking pool under the store's mutex, so the
/// handler awaiting it never blocks the executor and each call is atomic.
pub struct StoreHandle<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for StoreHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> StoreHandle<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn with<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> anyhow::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let store = inner.lock().unwrap_or_else(PoisonError::into_inner);
            op(&store)
        })
        .await
        .map_err(|e| StoreError(format!("store task failed: {e}")))?
        .map_err(StoreError::from)
    }
}

impl<S: KeyValueStore + 'static> StoreHandle<S> {
    pub async fn get_all(&self, collection: Collection) -> Result<Vec<SyncRecord>, StoreError> {
        self.with(move |store| store.get_all(collection)).await
    }

    pub async fn put(&self, collection: Collection, record: SyncRecord) -> Result<(), StoreError> {
        self.with(move |store| store.put(collection, &record)).await
    }
}
