// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! HTTP range transport
//!
//! A [`RangeTransport`] issues HEAD probes and `Range` GETs against one URL.
//! Requests share a pooled `reqwest::Client` and a semaphore that bounds
//! how many are in flight. Transient failures (timeouts, connection
//! errors, 5xx, 408, 429, short bodies) are retried with exponential
//! backoff; everything else fails on the first attempt.

use crate::config::TransportConfig;
use crate::error::{RangeError, Result};
use crate::identity::{ByteRange, ContentRange, ResourceIdentity};
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use diagnostics::*;
use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, HeaderName, HeaderValue,
    LAST_MODIFIED, RANGE,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Outcome of one attempt, before retry policy is applied.
#[derive(Debug)]
enum Failure {
    Transient(String),
    Permanent(RangeError),
}

impl From<RangeError> for Failure {
    fn from(err: RangeError) -> Self {
        Failure::Permanent(err)
    }
}

type Attempt<T> = std::result::Result<T, Failure>;

pub struct RangeTransport {
    url: String,
    config: TransportConfig,
    client: RwLock<Option<reqwest::Client>>,
    permits: Semaphore,
    identity: RwLock<Option<ResourceIdentity>>,
    requests: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl std::fmt::Debug for RangeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeTransport")
            .field("url", &self.url)
            .field("pool_size", &self.config.pool_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RangeTransport {
    /// Create a transport for `url`. Fails with a configuration error for
    /// non-HTTP URLs, invalid headers, or an invalid config.
    pub fn new(url: &str, config: TransportConfig) -> Result<Self> {
        config.validate()?;

        let parsed = url::Url::parse(url)
            .map_err(|e| RangeError::config(format!("invalid URL {url}: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(RangeError::config(format!(
                "unsupported scheme '{}' in {url}",
                parsed.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RangeError::config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RangeError::config(format!("invalid value for header {name}: {e}")))?;
            _ = headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(config.pool_per_host)
            .default_headers(headers)
            .build()
            .map_err(|e| RangeError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            url: url.to_string(),
            permits: Semaphore::new(config.pool_size),
            config,
            client: RwLock::new(Some(client)),
            identity: RwLock::new(None),
            requests: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    /// HTTP requests issued so far, retries included.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Body bytes received by range and full fetches.
    #[must_use]
    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched.load(Ordering::Relaxed)
    }

    /// Identity seen by the most recent probe or fetch.
    #[must_use]
    pub fn last_identity(&self) -> Option<ResourceIdentity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Release the connection pool. Idempotent; later requests fail with
    /// a usage error.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.permits.close();
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("closed transport for {url}", url: self.url.as_str());
    }

    /// Learn the size, ETag and range support of the resource.
    pub async fn probe(&self) -> Result<ResourceIdentity> {
        let identity = (|| self.probe_once())
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|f: &Failure| matches!(f, Failure::Transient(_)))
            .notify(|f: &Failure, delay: Duration| self.log_retry(f, delay))
            .await
            .map_err(|f| self.exhausted(f, None))?;

        info!(
            "probed {url}: {size} bytes, validator {validator}",
            url: self.url.as_str(),
            size: identity.size,
            validator: identity.validator()
        );
        self.store_identity(identity.clone());
        Ok(identity)
    }

    /// Fetch exactly `range`. The server must answer 206; a 200 means
    /// ranges are ignored and yields [`RangeError::RangeNotSupported`].
    ///
    /// The response must come from the `expected` version, or from the
    /// last probed one when `None`; otherwise the fetch fails with
    /// [`RangeError::ResourceChanged`].
    pub async fn fetch(
        &self,
        range: ByteRange,
        expected: Option<&ResourceIdentity>,
    ) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        if let Some(identity) = self.expected_identity(expected) {
            if !identity.accepts_ranges {
                return Err(RangeError::RangeNotSupported {
                    url: self.url.clone(),
                });
            }
        }

        let body = (|| self.fetch_once(range, expected))
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|f: &Failure| matches!(f, Failure::Transient(_)))
            .notify(|f: &Failure, delay: Duration| self.log_retry(f, delay))
            .await
            .map_err(|f| self.exhausted(f, Some(range)))?;

        _ = self
            .bytes_fetched
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(body)
    }

    /// Download the whole resource with a plain GET, checked against
    /// `expected` like [`RangeTransport::fetch`].
    pub async fn fetch_all(&self, expected: Option<&ResourceIdentity>) -> Result<Bytes> {
        let body = (|| self.fetch_all_once(expected))
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(|f: &Failure| matches!(f, Failure::Transient(_)))
            .notify(|f: &Failure, delay: Duration| self.log_retry(f, delay))
            .await
            .map_err(|f| self.exhausted(f, None))?;

        _ = self
            .bytes_fetched
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        info!("downloaded {url} in full: {len} bytes", url: self.url.as_str(), len: body.len());
        Ok(body)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_factor)
            .with_factor(2.0)
            .with_max_times(self.config.retries)
            .with_max_delay(self.config.max_backoff())
    }

    fn log_retry(&self, failure: &Failure, delay: Duration) {
        if let Failure::Transient(cause) = failure {
            warn!(
                "retrying {url} in {delay_ms}ms: {cause}",
                url: self.url.as_str(),
                delay_ms: delay.as_millis() as u64,
                cause: cause.as_str()
            );
        }
    }

    fn exhausted(&self, failure: Failure, range: Option<ByteRange>) -> RangeError {
        match failure {
            Failure::Permanent(err) => err,
            Failure::Transient(cause) => {
                error!(
                    "giving up on {url} after {attempts} attempts: {cause}",
                    url: self.url.as_str(),
                    attempts: self.config.max_attempts(),
                    cause: cause.as_str()
                );
                RangeError::HttpRange {
                    url: self.url.clone(),
                    range,
                    attempts: self.config.max_attempts(),
                    cause,
                }
            }
        }
    }

    fn permanent(&self, range: Option<ByteRange>, cause: String) -> Failure {
        Failure::Permanent(RangeError::HttpRange {
            url: self.url.clone(),
            range,
            attempts: 1,
            cause,
        })
    }

    fn not_found(&self, status: StatusCode) -> Failure {
        Failure::Permanent(RangeError::ResourceNotFound {
            url: self.url.clone(),
            status: status.as_u16(),
        })
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> RangeError {
        RangeError::usage(format!("transport for {} is closed", self.url))
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(|_| self.closed_error())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Attempt<reqwest::Response> {
        _ = self.requests.fetch_add(1, Ordering::Relaxed);
        request.send().await.map_err(|e| {
            if e.is_builder() {
                Failure::Permanent(RangeError::config(e.to_string()))
            } else {
                Failure::Transient(e.to_string())
            }
        })
    }

    async fn probe_once(&self) -> Attempt<ResourceIdentity> {
        let client = self.client()?;
        let _permit = self.acquire().await?;

        let response = self.send(client.head(&self.url)).await?;
        let status = response.status();
        if is_missing(status) {
            return Err(self.not_found(status));
        }
        if is_transient(status) {
            return Err(Failure::Transient(format!("HEAD returned {status}")));
        }

        let headers = response.headers();
        let mut identity = ResourceIdentity {
            url: self.url.clone(),
            size: 0,
            etag: header_string(headers, &ETAG),
            accepts_ranges: header_string(headers, &ACCEPT_RANGES)
                .is_none_or(|v| !v.eq_ignore_ascii_case("none")),
            last_modified: header_string(headers, &LAST_MODIFIED),
        };

        // HEAD responses carry no body, so the header is the only source.
        let declared = if status.is_success() {
            header_string(headers, &CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok())
        } else {
            None
        };

        match declared {
            Some(size) if size > 0 => identity.size = size,
            _ => self.size_from_range_probe(&client, &mut identity).await?,
        }
        Ok(identity)
    }

    /// Determine the size with `Range: bytes=0-0` when HEAD is refused or
    /// reports no length.
    async fn size_from_range_probe(
        &self,
        client: &reqwest::Client,
        identity: &mut ResourceIdentity,
    ) -> Attempt<()> {
        let response = self
            .send(client.get(&self.url).header(RANGE, "bytes=0-0"))
            .await?;
        let status = response.status();
        if is_missing(status) {
            return Err(self.not_found(status));
        }
        if is_transient(status) {
            return Err(Failure::Transient(format!("size probe returned {status}")));
        }

        let headers = response.headers();
        if identity.etag.is_none() {
            identity.etag = header_string(headers, &ETAG);
        }
        if identity.last_modified.is_none() {
            identity.last_modified = header_string(headers, &LAST_MODIFIED);
        }

        let total = match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                header_string(headers, &CONTENT_RANGE)
                    .and_then(|v| ContentRange::parse(&v))
                    .and_then(|cr| cr.total)
            }
            StatusCode::OK => {
                identity.accepts_ranges = false;
                header_string(headers, &CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok())
            }
            _ => None,
        };

        match total {
            Some(size) => {
                identity.size = size;
                Ok(())
            }
            None => Err(Failure::Permanent(RangeError::FileSize {
                url: self.url.clone(),
            })),
        }
    }

    async fn fetch_once(
        &self,
        range: ByteRange,
        expected: Option<&ResourceIdentity>,
    ) -> Attempt<Bytes> {
        let client = self.client()?;
        let _permit = self.acquire().await?;

        debug!("GET {url} {range}", url: self.url.as_str(), range: range.header_value());
        let response = self
            .send(client.get(&self.url).header(RANGE, range.header_value()))
            .await?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                return Err(Failure::Permanent(RangeError::RangeNotSupported {
                    url: self.url.clone(),
                }));
            }
            s if is_missing(s) => return Err(self.not_found(s)),
            s if is_transient(s) => {
                return Err(Failure::Transient(format!("GET {range} returned {s}")));
            }
            s => return Err(self.permanent(Some(range), format!("unexpected status {s}"))),
        }

        let headers = response.headers();
        let Some(content_range) =
            header_string(headers, &CONTENT_RANGE).and_then(|v| ContentRange::parse(&v))
        else {
            return Err(Failure::Permanent(RangeError::RangeNotSupported {
                url: self.url.clone(),
            }));
        };
        if let Some(served) = content_range.range {
            if served.offset != range.offset {
                return Err(self.permanent(
                    Some(range),
                    format!("server returned range {served}"),
                ));
            }
        }

        self.check_unchanged(expected, headers)?;
        let etag = header_string(headers, &ETAG);

        let body = response
            .bytes()
            .await
            .map_err(|e| Failure::Transient(format!("reading body: {e}")))?;
        if body.len() as u64 != range.length {
            return Err(Failure::Transient(format!(
                "short read: expected {} bytes, got {}",
                range.length,
                body.len()
            )));
        }

        self.observe(etag, content_range.total);
        Ok(body)
    }

    async fn fetch_all_once(&self, expected: Option<&ResourceIdentity>) -> Attempt<Bytes> {
        let client = self.client()?;
        let _permit = self.acquire().await?;

        let response = self.send(client.get(&self.url)).await?;
        let status = response.status();
        if is_missing(status) {
            return Err(self.not_found(status));
        }
        if is_transient(status) {
            return Err(Failure::Transient(format!("GET returned {status}")));
        }
        if !status.is_success() {
            return Err(self.permanent(None, format!("unexpected status {status}")));
        }

        self.check_unchanged(expected, response.headers())?;
        let etag = header_string(response.headers(), &ETAG);
        let body = response
            .bytes()
            .await
            .map_err(|e| Failure::Transient(format!("reading body: {e}")))?;
        self.observe(etag, Some(body.len() as u64));
        Ok(body)
    }

    fn expected_identity(&self, expected: Option<&ResourceIdentity>) -> Option<ResourceIdentity> {
        expected.cloned().or_else(|| self.last_identity())
    }

    /// Bytes from another version of the object must not be mixed with
    /// the probed one. ETags decide when both sides have one, otherwise
    /// Last-Modified does.
    fn check_unchanged(
        &self,
        expected: Option<&ResourceIdentity>,
        headers: &HeaderMap,
    ) -> Attempt<()> {
        let Some(known) = self.expected_identity(expected) else {
            return Ok(());
        };
        let changed = match (known.etag, header_string(headers, &ETAG)) {
            (Some(known), Some(seen)) => (known != seen).then(|| format!("ETag {known} -> {seen}")),
            (Some(_), None) => None,
            (None, _) => match (known.last_modified, header_string(headers, &LAST_MODIFIED)) {
                (Some(known), Some(seen)) if known != seen => {
                    Some(format!("Last-Modified {known} -> {seen}"))
                }
                _ => None,
            },
        };
        match changed {
            Some(cause) => Err(Failure::Permanent(RangeError::ResourceChanged {
                url: self.url.clone(),
                cause,
            })),
            None => Ok(()),
        }
    }

    fn observe(&self, etag: Option<String>, total: Option<u64>) {
        let mut guard = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(identity) => {
                if identity.etag.is_none() {
                    identity.etag = etag;
                }
            }
            None => {
                if let Some(size) = total {
                    *guard = Some(ResourceIdentity {
                        url: self.url.clone(),
                        size,
                        etag,
                        accepts_ranges: true,
                        last_modified: None,
                    });
                }
            }
        }
    }

    fn store_identity(&self, identity: ResourceIdentity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }
}

fn is_missing(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            retries: 2,
            backoff_factor: Duration::from_millis(1),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let err = RangeTransport::new("ftp://example.com/x", fast_config()).unwrap_err();
        assert!(matches!(err, RangeError::Config(_)));
        let err = RangeTransport::new("not a url", fast_config()).unwrap_err();
        assert!(matches!(err, RangeError::Config(_)));
    }

    #[test]
    fn test_rejects_invalid_header() {
        let mut config = fast_config();
        _ = config
            .headers
            .insert("X-Bad".to_string(), "line\nbreak".to_string());
        let err = RangeTransport::new("http://example.com/x", config).unwrap_err();
        assert!(matches!(err, RangeError::Config(_)));
    }

    #[tokio::test]
    async fn test_probe_reads_identity() {
        let server = MockServer::start(content(1000)).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();

        let identity = transport.probe().await.unwrap();
        assert_eq!(identity.size, 1000);
        assert_eq!(identity.etag.as_deref(), Some("\"v1\""));
        assert!(identity.accepts_ranges);
        assert_eq!(transport.last_identity(), Some(identity));
    }

    #[tokio::test]
    async fn test_probe_falls_back_to_range_get_when_head_refused() {
        let server = MockServer::start(content(777)).await;
        server.reject_head().await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();

        let identity = transport.probe().await.unwrap();
        assert_eq!(identity.size, 777);

        let requests = server.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].range.as_deref(), Some("bytes=0-0"));
    }

    #[tokio::test]
    async fn test_probe_missing_resource_is_not_retried() {
        let server = MockServer::start(content(10)).await;
        let transport = RangeTransport::new(&server.missing_url(), fast_config()).unwrap();

        let err = transport.probe().await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(server.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_exact_range() {
        let data = content(5000);
        let server = MockServer::start(data.clone()).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        let bytes = transport.fetch(ByteRange::new(100, 50), None).await.unwrap();
        assert_eq!(&bytes[..], &data[100..150]);
        assert_eq!(transport.bytes_fetched(), 50);

        let requests = server.requests().await;
        assert_eq!(requests.last().unwrap().range.as_deref(), Some("bytes=100-149"));
    }

    #[tokio::test]
    async fn test_fetch_empty_range_makes_no_request() {
        let server = MockServer::start(content(10)).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        let bytes = transport.fetch(ByteRange::new(5, 0), None).await.unwrap();
        assert!(bytes.is_empty());
        assert!(server.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let data = content(300);
        let server = MockServer::start(data.clone()).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        server.fail_next(2).await;
        let bytes = transport.fetch(ByteRange::new(0, 10), None).await.unwrap();
        assert_eq!(&bytes[..], &data[0..10]);
        assert_eq!(server.range_request_count().await, 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_retries() {
        let server = MockServer::start(content(300)).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        server.fail_next(10).await;
        let err = transport.fetch(ByteRange::new(0, 10), None).await.unwrap_err();
        match err {
            RangeError::HttpRange {
                attempts, range, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(range, Some(ByteRange::new(0, 10)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(server.range_request_count().await, 3);
    }

    #[tokio::test]
    async fn test_short_read_is_retried() {
        let data = content(300);
        let server = MockServer::start(data.clone()).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        server.short_reads(1).await;
        let bytes = transport.fetch(ByteRange::new(20, 40), None).await.unwrap();
        assert_eq!(&bytes[..], &data[20..60]);
        assert_eq!(server.range_request_count().await, 2);
    }

    #[tokio::test]
    async fn test_ignored_range_is_reported() {
        let server = MockServer::start(content(300)).await;
        server.disable_ranges().await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        let err = transport.fetch(ByteRange::new(0, 10), None).await.unwrap_err();
        assert!(err.is_range_not_supported());
    }

    #[tokio::test]
    async fn test_changed_etag_mid_read_fails() {
        let server = MockServer::start(content(300)).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        _ = transport.probe().await.unwrap();

        server.set_content(content(300), Some("\"v2\"")).await;
        let err = transport.fetch(ByteRange::new(0, 10), None).await.unwrap_err();
        assert!(err.is_resource_changed(), "unexpected error {err:?}");
        assert_eq!(server.range_request_count().await, 1);
    }

    #[tokio::test]
    async fn test_full_download_of_replaced_resource_fails() {
        let server = MockServer::start(vec![1u8; 100]).await;
        server.disable_ranges().await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        let identity = transport.probe().await.unwrap();

        server.set_content(vec![2u8; 100], Some("\"v2\"")).await;
        let err = transport.fetch_all(Some(&identity)).await.unwrap_err();
        assert!(err.is_resource_changed(), "unexpected error {err:?}");
        assert_eq!(server.full_request_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_modified_decides_without_etag() {
        let server = MockServer::start(content(100)).await;
        server.clear_etag().await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        let identity = transport.probe().await.unwrap();
        assert!(identity.etag.is_none());

        let stale = ResourceIdentity {
            last_modified: Some("Thu, 01 Jan 2015 00:00:00 GMT".to_string()),
            ..identity.clone()
        };
        let err = transport
            .fetch(ByteRange::new(0, 10), Some(&stale))
            .await
            .unwrap_err();
        assert!(err.is_resource_changed(), "unexpected error {err:?}");
        assert!(transport.fetch(ByteRange::new(0, 10), Some(&identity)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_all() {
        let data = content(4096);
        let server = MockServer::start(data.clone()).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();

        let bytes = transport.fetch_all(None).await.unwrap();
        assert_eq!(&bytes[..], &data[..]);
        assert_eq!(server.full_request_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = MockServer::start(content(100)).await;
        let transport = RangeTransport::new(&server.url(), fast_config()).unwrap();
        transport.close();
        transport.close();
        assert!(transport.is_closed());

        let err = transport.fetch(ByteRange::new(0, 10), None).await.unwrap_err();
        assert!(matches!(err, RangeError::Usage(_)));
    }
}
