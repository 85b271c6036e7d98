// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-process HTTP server for exercising range reads in tests
//!
//! Serves one object at `/data.parquet` with configurable ETag, range
//! support and injected failures, and records every request it sees.

use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Mutex;
use warp::Filter;
use warp::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, LAST_MODIFIED, RANGE};
use warp::http::{HeaderMap, Method, Response, StatusCode};
use warp::hyper::Body;

/// Path at which the object is served
pub const OBJECT_PATH: &str = "/data.parquet";

/// One request observed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

impl RecordedRequest {
    #[must_use]
    pub fn is_range_get(&self) -> bool {
        self.method == "GET" && self.range.is_some()
    }

    #[must_use]
    pub fn is_full_get(&self) -> bool {
        self.method == "GET" && self.range.is_none()
    }
}

#[derive(Debug)]
struct MockState {
    content: Bytes,
    etag: Option<String>,
    last_modified: Option<String>,
    ranges_enabled: bool,
    head_allowed: bool,
    fail_next: usize,
    short_reads: usize,
    requests: Vec<RecordedRequest>,
}

/// Mock object server
pub struct MockServer {
    base_url: String,
    state: Arc<Mutex<MockState>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockServer {
    /// Start serving `content` on an ephemeral port.
    pub async fn start(content: impl Into<Bytes>) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            content: content.into(),
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            ranges_enabled: true,
            head_allowed: true,
            fail_next: 0,
            short_reads: 0,
            requests: Vec::new(),
        }));

        let shared = state.clone();
        let route = warp::path::full()
            .and(warp::method())
            .and(warp::header::headers_cloned())
            .and_then(move |path: warp::path::FullPath, method: Method, headers: HeaderMap| {
                let state = shared.clone();
                async move { respond(path.as_str(), &method, &headers, &state).await }
            });

        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let handle = tokio::spawn(server);

        MockServer {
            base_url: format!("http://127.0.0.1:{}", addr.port()),
            state,
            server_handle: Some(handle),
        }
    }

    /// URL of the served object
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, OBJECT_PATH)
    }

    /// URL of a path that answers 404
    #[must_use]
    pub fn missing_url(&self) -> String {
        format!("{}/missing.parquet", self.base_url)
    }

    /// Replace the object, as if it were rewritten upstream.
    pub async fn set_content(&self, content: impl Into<Bytes>, etag: Option<&str>) {
        let mut state = self.state.lock().await;
        state.content = content.into();
        state.etag = etag.map(String::from);
    }

    /// Serve without an ETag so clients fall back to weak validators.
    pub async fn clear_etag(&self) {
        self.state.lock().await.etag = None;
    }

    /// Ignore `Range` headers and stop advertising `Accept-Ranges`.
    pub async fn disable_ranges(&self) {
        self.state.lock().await.ranges_enabled = false;
    }

    /// Answer HEAD with 405 Method Not Allowed.
    pub async fn reject_head(&self) {
        self.state.lock().await.head_allowed = false;
    }

    /// Answer the next `n` requests with 503.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next = n;
    }

    /// Serve the next `n` range requests one byte short.
    pub async fn short_reads(&self, n: usize) {
        self.state.lock().await.short_reads = n;
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Number of GET requests carrying a `Range` header
    pub async fn range_request_count(&self) -> usize {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|r| r.is_range_get())
            .count()
    }

    /// Number of GET requests for the whole object
    pub async fn full_request_count(&self) -> usize {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|r| r.is_full_get())
            .count()
    }

    pub async fn clear_requests(&self) {
        self.state.lock().await.requests.clear();
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(handle) = &self.server_handle {
            handle.abort();
        }
    }
}

async fn respond(
    path: &str,
    method: &Method,
    headers: &HeaderMap,
    state: &Mutex<MockState>,
) -> Result<Response<Body>, Infallible> {
    let mut state = state.lock().await;
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        path: path.to_string(),
        range: range.clone(),
    });

    if path != OBJECT_PATH {
        return Ok(status_only(StatusCode::NOT_FOUND));
    }
    if state.fail_next > 0 {
        state.fail_next -= 1;
        return Ok(status_only(StatusCode::SERVICE_UNAVAILABLE));
    }
    if *method == Method::HEAD && !state.head_allowed {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }
    if *method != Method::HEAD && *method != Method::GET {
        return Ok(status_only(StatusCode::METHOD_NOT_ALLOWED));
    }

    let total = state.content.len() as u64;
    let mut builder = Response::builder();
    if let Some(etag) = &state.etag {
        builder = builder.header(ETAG, etag.as_str());
    }
    if let Some(modified) = &state.last_modified {
        builder = builder.header(LAST_MODIFIED, modified.as_str());
    }
    if state.ranges_enabled {
        builder = builder.header(ACCEPT_RANGES, "bytes");
    }

    let requested = range
        .as_deref()
        .filter(|_| state.ranges_enabled && *method == Method::GET)
        .and_then(parse_range_header);

    let response = match requested {
        Some((start, _)) if start >= total => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty()),
        Some((start, end)) => {
            let mut end = end.min(total.saturating_sub(1));
            if state.short_reads > 0 && end > start {
                state.short_reads -= 1;
                end -= 1;
            }
            let body = state.content.slice(start as usize..(end + 1) as usize);
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
                .header(CONTENT_LENGTH, body.len())
                .body(Body::from(body))
        }
        None => builder
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, total)
            .body(Body::from(state.content.clone())),
    };
    Ok(response.unwrap_or_else(|_| status_only(StatusCode::INTERNAL_SERVER_ERROR)))
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Parse `bytes=a-b` (or the open form `bytes=a-`).
fn parse_range_header(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => u64::MAX,
        e => e.parse::<u64>().ok()?,
    };
    (end >= start).then_some((start, end))
}
