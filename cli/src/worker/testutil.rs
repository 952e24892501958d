//! Throwaway origins and workers for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use coop_core::cache::CacheStorage;
use coop_core::db::Database;

use super::Worker;
use crate::config::WorkerConfig;

pub(crate) struct Origin {
    pub url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Origin {
    /// Stop accepting connections and close idle ones; later requests fail to connect.
    pub async fn go_offline(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

pub(crate) async fn spawn_origin(router: Router) -> Origin {
    spawn_origin_on("http://127.0.0.1:0", router).await
}

/// Serve `router` at a specific `http://host:port`, e.g. one that was
/// unreachable earlier in the test.
pub(crate) async fn spawn_origin_on(url: &str, router: Router) -> Origin {
    let bind = url.trim_start_matches("http://");
    let listener = tokio::net::TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    Origin {
        url: format!("http://{addr}"),
        shutdown: Some(tx),
        handle,
    }
}

/// An address nothing listens on.
pub(crate) async fn unreachable_origin() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub(crate) fn test_config(origin: &str) -> WorkerConfig {
    WorkerConfig {
        origin: origin.to_string(),
        fetch_timeout_secs: 2,
        connect_timeout_secs: 1,
        ..WorkerConfig::default()
    }
}

pub(crate) fn test_worker(origin: &str) -> Worker {
    worker_with(test_config(origin), CacheStorage::open_in_memory().unwrap())
}

pub(crate) fn worker_with(config: WorkerConfig, cache: CacheStorage) -> Worker {
    Worker::new(config, cache, Database::open_in_memory().unwrap()).unwrap()
}

/// What the farm origin saw.
#[derive(Clone, Default)]
pub(crate) struct FarmLog {
    pub api_hits: Arc<AtomicUsize>,
    /// POSTs per `Idempotency-Key`.
    pub posts: Arc<Mutex<HashMap<String, usize>>>,
    pub post_order: Arc<Mutex<Vec<String>>>,
}

impl FarmLog {
    pub fn posts_for(&self, key: &str) -> usize {
        self.posts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_posts(&self) -> usize {
        self.posts.lock().unwrap().values().sum()
    }
}

/// Serves the dashboard shell and the daily-records endpoint. Record id "2"
/// is always rejected with a 500. POSTs take `post_delay` to answer.
pub(crate) fn farm_origin(log: FarmLog, post_delay: Duration) -> Router {
    Router::new()
        .route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<h1>مزرعة</h1>") }),
        )
        .route(
            "/manifest.json",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/manifest+json")],
                    "{\"name\":\"farm\"}",
                )
            }),
        )
        .route("/icons/icon-192x192.png", get(|| async { "png192" }))
        .route("/icons/icon-512x512.png", get(|| async { "png512" }))
        .route(
            "/api/cycles",
            get(|State(log): State<FarmLog>| async move {
                let n = log.api_hits.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{{\"version\":{n}}}")
            }),
        )
        .route(
            "/api/daily-records",
            post(
                move |State(log): State<FarmLog>,
                      headers: HeaderMap,
                      Json(record): Json<serde_json::Value>| async move {
                    let key = headers
                        .get("idempotency-key")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *log.posts.lock().unwrap().entry(key.clone()).or_default() += 1;
                    log.post_order.lock().unwrap().push(key);
                    tokio::time::sleep(post_delay).await;
                    if record["id"] == "2" {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::CREATED
                    }
                },
            ),
        )
        .with_state(log)
}
