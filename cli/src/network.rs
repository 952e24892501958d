use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, header};
use serde::Serialize;

use coop_core::models::CachedResponse;

use crate::worker::error::NetworkError;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An intercepted request, detached from the server that received it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    /// Path and query, e.g. `/api/cycles?status=active`. Doubles as the cache key.
    pub key: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn get(key: &str) -> Self {
        Self {
            method: Method::GET,
            key: key.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A page navigation: browsers say so with `Sec-Fetch-Mode`, older ones
    /// only with an HTML `Accept` on a GET.
    pub fn is_navigation(&self) -> bool {
        if let Some(mode) = self.headers.get("sec-fetch-mode") {
            return mode.as_bytes().eq_ignore_ascii_case(b"navigate");
        }
        self.method == Method::GET
            && self
                .headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|accept| accept.contains("text/html"))
    }
}

pub struct OriginClient {
    client: reqwest::Client,
    origin: String,
}

impl OriginClient {
    pub fn new(origin: &str, timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("coop-worker/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            origin: origin.trim_end_matches('/').to_string(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn url(&self, key: &str) -> String {
        format!("{}{key}", self.origin)
    }

    /// Single network attempt, bounded by the client timeout. Any HTTP status
    /// is a success at this layer; only transport failures are errors.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, NetworkError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if is_hop_by_hop(name.as_str())
                || name == header::HOST
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.key))
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = builder.send().await.map_err(NetworkError::from)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| {
                !is_hop_by_hop(name.as_str()) && *name != header::CONTENT_LENGTH
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await.map_err(NetworkError::from)?;

        Ok(CachedResponse::new(status, headers, body.to_vec()))
    }

    /// POST a JSON document. The idempotency key lets the remote side drop a
    /// replay whose first acknowledgment never reached us.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
        idempotency_key: &str,
    ) -> Result<StatusCode, NetworkError> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .header("idempotency-key", idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(NetworkError::from)?;
        Ok(resp.status())
    }

    /// True when the origin answers at all.
    pub async fn probe(&self) -> bool {
        self.client.head(self.url("/")).send().await.is_ok()
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
