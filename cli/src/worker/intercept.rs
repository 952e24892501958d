use std::sync::Arc;

use axum::http::Method;
use serde::Serialize;

use coop_core::models::CachedResponse;

use super::Worker;
use super::lifecycle::WorkerState;
use crate::network::FetchRequest;

/// Header telling the caller which branch produced a response.
pub const SOURCE_HEADER: &str = "x-coop-source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    /// Fresh from the origin.
    Network,
    /// Origin unreachable, served from the current bucket.
    Cache,
    /// Failed navigation answered with the cached offline document.
    OfflinePage,
    /// Generated locally because nothing else was available.
    Synthetic,
    /// Worker not active yet; proxied without touching the cache.
    Passthrough,
}

impl ResponseSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::OfflinePage => "offline-page",
            Self::Synthetic => "synthetic",
            Self::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Intercepted {
    pub source: ResponseSource,
    pub response: CachedResponse,
}

impl Intercepted {
    fn new(source: ResponseSource, response: CachedResponse) -> Self {
        Self { source, response }
    }
}

fn plain_text(status: u16, body: &str) -> CachedResponse {
    CachedResponse::new(
        status,
        vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body.as_bytes().to_vec(),
    )
}

impl Worker {
    /// Network first, cache second, offline page or a synthetic 408 last.
    /// Always produces a complete response.
    pub async fn on_fetch(&self, request: &FetchRequest) -> Intercepted {
        if self.state() != WorkerState::Activated {
            return match self.network.fetch(request).await {
                Ok(response) => Intercepted::new(ResponseSource::Passthrough, response),
                Err(err) => {
                    tracing::warn!(key = %request.key, error = %err, "origin unreachable before activation");
                    Intercepted::new(
                        ResponseSource::Passthrough,
                        plain_text(502, "Origin unreachable"),
                    )
                }
            };
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if request.method == Method::GET && (200..300).contains(&response.status) {
                    let response = self.write_through(&request.key, response).await;
                    return Intercepted::new(ResponseSource::Network, response);
                }
                Intercepted::new(ResponseSource::Network, response)
            }
            Err(err) => {
                tracing::debug!(key = %request.key, error = %err, "network failed, trying cache");
                self.fallback(request).await
            }
        }
    }

    /// Store a copy of a fresh 2xx GET response in the current bucket. A failed
    /// write is logged; the caller still gets the response.
    async fn write_through(&self, key: &str, response: CachedResponse) -> CachedResponse {
        let snapshot = Arc::new(response);
        let entry = Arc::clone(&snapshot);
        let bucket = self.config.cache_name.clone();
        let request_key = key.to_string();
        if let Err(err) = self
            .cache
            .with(move |cache| cache.put(&bucket, &request_key, &entry))
            .await
        {
            tracing::warn!(key, error = %err, "failed to cache response");
        }
        Arc::unwrap_or_clone(snapshot)
    }

    async fn fallback(&self, request: &FetchRequest) -> Intercepted {
        if request.method == Method::GET {
            if let Some(hit) = self.lookup(&request.key).await {
                tracing::info!(key = %request.key, "served from cache");
                return Intercepted::new(ResponseSource::Cache, hit);
            }
        }

        if request.is_navigation() {
            if let Some(page) = self.lookup(&self.config.offline_page).await {
                tracing::info!(key = %request.key, "served offline page");
                return Intercepted::new(ResponseSource::OfflinePage, page);
            }
        }

        tracing::info!(key = %request.key, "offline with nothing cached");
        Intercepted::new(ResponseSource::Synthetic, plain_text(408, "Network error"))
    }

    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let bucket = self.config.cache_name.clone();
        let request_key = key.to_string();
        match self
            .cache
            .with(move |cache| cache.match_entry(&bucket, &request_key))
            .await
        {
            Ok(hit) => hit,
            Err(err) => {
                tracing::warn!(key, error = %err, "cache lookup failed");
                None
            }
        }
    }
}
