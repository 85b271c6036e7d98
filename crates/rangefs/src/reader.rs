// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Hybrid memory/network reader over one remote resource
//!
//! Reads are served, in order of preference, from the tail buffer kept
//! after footer discovery, from a full copy of the resource when one has
//! been loaded, and otherwise by range requests. Once the server is found
//! to ignore ranges the whole object is downloaded once (or taken from the
//! cache) and every later read is served from memory.

use crate::cache::{Namespace, ResourceCache};
use crate::error::{RangeError, Result};
use crate::identity::{ByteRange, ResourceIdentity};
use crate::transport::RangeTransport;
use bytes::Bytes;
use diagnostics::*;
use futures::{StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Cache key of the full copy within [`Namespace::Data`]
pub const FULL_COPY_KEY: &str = "full";

/// Default upper bound on ranges fetched individually by one `read_ranges`
pub const DEFAULT_MAX_RANGES: usize = 32;

/// Counters describing how reads were served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub network_requests: u64,
    pub bytes_fetched: u64,
    pub buffer_hits: u64,
    pub full_downloads: u64,
}

#[derive(Debug)]
struct TailBuffer {
    offset: u64,
    bytes: Bytes,
}

impl TailBuffer {
    fn slice(&self, range: ByteRange) -> Option<Bytes> {
        let held = ByteRange::new(self.offset, self.bytes.len() as u64);
        held.contains(&range).then(|| {
            let start = (range.offset - self.offset) as usize;
            self.bytes.slice(start..start + range.length as usize)
        })
    }
}

#[derive(Debug)]
pub struct RemoteReader {
    transport: Arc<RangeTransport>,
    identity: ResourceIdentity,
    cache: Option<ResourceCache>,
    ttl: Duration,
    max_ranges: usize,
    tail: RwLock<Option<TailBuffer>>,
    full: OnceCell<Bytes>,
    ranges_unsupported: AtomicBool,
    network_requests: AtomicU64,
    bytes_fetched: AtomicU64,
    buffer_hits: AtomicU64,
    full_downloads: AtomicU64,
}

impl RemoteReader {
    /// Reader for the resource version described by `identity`.
    #[must_use]
    pub fn new(transport: Arc<RangeTransport>, identity: ResourceIdentity) -> Self {
        Self {
            ranges_unsupported: AtomicBool::new(!identity.accepts_ranges),
            transport,
            identity,
            cache: None,
            ttl: Duration::ZERO,
            max_ranges: DEFAULT_MAX_RANGES,
            tail: RwLock::new(None),
            full: OnceCell::new(),
            network_requests: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            buffer_hits: AtomicU64::new(0),
            full_downloads: AtomicU64::new(0),
        }
    }

    /// Keep full copies in `cache` for `ttl`. A zero TTL disables caching.
    #[must_use]
    pub fn with_cache(mut self, cache: ResourceCache, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.cache = Some(cache);
            self.ttl = ttl;
        }
        self
    }

    #[must_use]
    pub fn with_max_ranges(mut self, max_ranges: usize) -> Self {
        self.max_ranges = max_ranges.max(1);
        self
    }

    #[must_use]
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.identity.size
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<RangeTransport> {
        &self.transport
    }

    /// True once reads are served from a full in-memory copy.
    #[must_use]
    pub fn has_full_copy(&self) -> bool {
        self.full.initialized()
    }

    #[must_use]
    pub fn ranges_supported(&self) -> bool {
        !self.ranges_unsupported.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            network_requests: self.network_requests.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            full_downloads: self.full_downloads.load(Ordering::Relaxed),
        }
    }

    /// Exactly `length` bytes starting at `offset`.
    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Bytes> {
        let range = ByteRange::new(offset, length);
        self.identity.check_range(range)?;
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        if let Some(bytes) = self.from_memory(range) {
            return Ok(bytes);
        }
        if !self.ranges_supported() {
            return self.from_full_copy(range).await;
        }

        match self.fetch_remote(range).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_range_not_supported() => {
                self.mark_ranges_unsupported();
                self.from_full_copy(range).await
            }
            Err(e) => Err(e),
        }
    }

    /// Read several ranges as one operation, returned in request order.
    ///
    /// Ranges not already in memory are fetched concurrently, bounded by
    /// the transport's pool. More than `max_ranges` of them are replaced by
    /// one download of the whole resource.
    pub async fn read_ranges(&self, ranges: &[ByteRange]) -> Result<Vec<Bytes>> {
        for range in ranges {
            self.identity.check_range(*range)?;
        }

        let pending = ranges
            .iter()
            .filter(|r| !r.is_empty() && self.from_memory_peek(**r).is_none())
            .count();

        if pending > self.max_ranges && self.ranges_supported() {
            info!(
                "{pending} ranges exceed limit {max_ranges}, downloading {url} in full",
                pending: pending,
                max_ranges: self.max_ranges,
                url: self.identity.url.as_str()
            );
            let full = self.load_full().await?;
            return Ok(ranges.iter().map(|r| slice_full(&full, *r)).collect());
        }

        futures::stream::iter(ranges.iter().copied())
            .map(|range| self.read_at(range.offset, range.length))
            .buffered(self.transport.pool_size())
            .try_collect()
            .await
    }

    /// The last `length` bytes of the resource, kept in memory so later
    /// reads inside them need no request.
    pub async fn read_tail(&self, length: u64) -> Result<Bytes> {
        let length = length.min(self.identity.size);
        let range = ByteRange::new(self.identity.size - length, length);
        if let Some(bytes) = self.from_memory(range) {
            return Ok(bytes);
        }

        let bytes = self.read_at(range.offset, range.length).await?;
        *self.tail.write().unwrap_or_else(PoisonError::into_inner) = Some(TailBuffer {
            offset: range.offset,
            bytes: bytes.clone(),
        });
        Ok(bytes)
    }

    /// Load the whole resource once, from the cache when a copy for this
    /// version exists, otherwise with a single GET.
    pub async fn load_full(&self) -> Result<Bytes> {
        self.full
            .get_or_try_init(|| self.fetch_full())
            .await
            .cloned()
    }

    fn mark_ranges_unsupported(&self) {
        if !self.ranges_unsupported.swap(true, Ordering::AcqRel) {
            warn!(
                "{url} does not honor range requests, falling back to a full download",
                url: self.identity.url.as_str()
            );
        }
    }

    fn from_memory_peek(&self, range: ByteRange) -> Option<Bytes> {
        if let Some(full) = self.full.get() {
            return Some(slice_full(full, range));
        }
        self.tail
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|tail| tail.slice(range))
    }

    fn from_memory(&self, range: ByteRange) -> Option<Bytes> {
        let bytes = self.from_memory_peek(range)?;
        _ = self.buffer_hits.fetch_add(1, Ordering::Relaxed);
        Some(bytes)
    }

    async fn from_full_copy(&self, range: ByteRange) -> Result<Bytes> {
        let full = self.load_full().await?;
        Ok(slice_full(&full, range))
    }

    async fn fetch_remote(&self, range: ByteRange) -> Result<Bytes> {
        _ = self.network_requests.fetch_add(1, Ordering::Relaxed);
        let bytes = self.transport.fetch(range, Some(&self.identity)).await?;
        _ = self
            .bytes_fetched
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    async fn fetch_full(&self) -> Result<Bytes> {
        let validator = self.identity.validator();
        if let Some(cache) = &self.cache {
            match cache.lookup(Namespace::Data, FULL_COPY_KEY, &validator).await {
                Ok(Some(bytes)) if bytes.len() as u64 == self.identity.size => {
                    info!("using cached copy of {url}", url: self.identity.url.as_str());
                    return Ok(bytes);
                }
                Ok(_) => {}
                Err(e) => warn!("cache lookup failed: {error}", error: e.to_string()),
            }
        }

        _ = self.network_requests.fetch_add(1, Ordering::Relaxed);
        _ = self.full_downloads.fetch_add(1, Ordering::Relaxed);
        let bytes = self.transport.fetch_all(Some(&self.identity)).await?;
        _ = self
            .bytes_fetched
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        if bytes.len() as u64 != self.identity.size {
            return Err(RangeError::HttpRange {
                url: self.identity.url.clone(),
                range: None,
                attempts: 1,
                cause: format!(
                    "full download returned {} bytes, expected {}",
                    bytes.len(),
                    self.identity.size
                ),
            });
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .write(Namespace::Data, FULL_COPY_KEY, bytes.clone(), self.ttl, &validator)
                .await
            {
                warn!("failed to cache full copy: {error}", error: e.to_string());
            }
        }
        Ok(bytes)
    }
}

fn slice_full(full: &Bytes, range: ByteRange) -> Bytes {
    full.slice(range.offset as usize..range.end() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::TransportConfig;
    use crate::testing::MockServer;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn config() -> TransportConfig {
        TransportConfig {
            retries: 1,
            backoff_factor: Duration::from_millis(1),
            pool_size: 4,
            ..TransportConfig::default()
        }
    }

    async fn open(server: &MockServer) -> RemoteReader {
        let transport = Arc::new(RangeTransport::new(&server.url(), config()).unwrap());
        let identity = transport.probe().await.unwrap();
        server.clear_requests().await;
        RemoteReader::new(transport, identity)
    }

    #[tokio::test]
    async fn test_read_at_exact_bytes() {
        let data = content(10_000);
        let server = MockServer::start(data.clone()).await;
        let reader = open(&server).await;

        let bytes = reader.read_at(1234, 100).await.unwrap();
        assert_eq!(&bytes[..], &data[1234..1334]);
        assert!(reader.read_at(0, 0).await.unwrap().is_empty());

        let err = reader.read_at(9_990, 11).await.unwrap_err();
        assert!(matches!(err, RangeError::Usage(_)));
        assert_eq!(server.range_request_count().await, 1);
    }

    #[tokio::test]
    async fn test_tail_buffer_serves_reads() {
        let data = content(10_000);
        let server = MockServer::start(data.clone()).await;
        let reader = open(&server).await;

        let tail = reader.read_tail(1_000).await.unwrap();
        assert_eq!(&tail[..], &data[9_000..]);

        let inner = reader.read_at(9_500, 8).await.unwrap();
        assert_eq!(&inner[..], &data[9_500..9_508]);
        assert_eq!(server.range_request_count().await, 1);
        assert_eq!(reader.stats().buffer_hits, 1);
    }

    #[tokio::test]
    async fn test_tail_longer_than_resource() {
        let data = content(50);
        let server = MockServer::start(data.clone()).await;
        let reader = open(&server).await;
        let tail = reader.read_tail(64 * 1024).await.unwrap();
        assert_eq!(&tail[..], &data[..]);
    }

    #[tokio::test]
    async fn test_read_ranges_preserves_order() {
        let data = content(20_000);
        let server = MockServer::start(data.clone()).await;
        let reader = open(&server).await;

        let ranges = vec![
            ByteRange::new(15_000, 10),
            ByteRange::new(0, 5),
            ByteRange::new(7_000, 0),
            ByteRange::new(9_000, 300),
        ];
        let parts = reader.read_ranges(&ranges).await.unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(&parts[0][..], &data[15_000..15_010]);
        assert_eq!(&parts[1][..], &data[0..5]);
        assert!(parts[2].is_empty());
        assert_eq!(&parts[3][..], &data[9_000..9_300]);
        assert_eq!(server.range_request_count().await, 3);
    }

    #[tokio::test]
    async fn test_too_many_ranges_downloads_once() {
        let data = content(4_000);
        let server = MockServer::start(data.clone()).await;
        let reader = open(&server).await.with_max_ranges(2);

        let ranges: Vec<ByteRange> = (0..5).map(|i| ByteRange::new(i * 500, 100)).collect();
        let parts = reader.read_ranges(&ranges).await.unwrap();
        for (range, part) in ranges.iter().zip(&parts) {
            assert_eq!(&part[..], &data[range.offset as usize..range.end() as usize]);
        }
        assert_eq!(server.range_request_count().await, 0);
        assert_eq!(server.full_request_count().await, 1);
        assert_eq!(reader.stats().full_downloads, 1);
    }

    #[tokio::test]
    async fn test_fallback_downloads_once_under_concurrency() {
        let data = content(8_000);
        let server = MockServer::start(data.clone()).await;
        server.disable_ranges().await;
        let reader = Arc::new(open(&server).await);

        let reads = (0..8u64).map(|i| {
            let reader = reader.clone();
            async move { reader.read_at(i * 1_000, 10).await }
        });
        let results = futures::future::join_all(reads).await;
        for (i, result) in results.into_iter().enumerate() {
            let bytes = result.unwrap();
            assert_eq!(&bytes[..], &data[i * 1_000..i * 1_000 + 10]);
        }

        assert_eq!(server.full_request_count().await, 1);
        assert!(reader.has_full_copy());
        assert!(!reader.ranges_supported());

        // Everything later is served from memory
        server.clear_requests().await;
        let _ = reader.read_at(5, 5).await.unwrap();
        assert!(server.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_copy_is_reused_from_cache() {
        let data = content(3_000);
        let server = MockServer::start(data.clone()).await;
        server.disable_ranges().await;
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path()).resource(&server.url());

        let first = open(&server).await.with_cache(cache.clone(), Duration::from_secs(60));
        let _ = first.read_at(0, 10).await.unwrap();
        assert_eq!(server.full_request_count().await, 1);

        let second = open(&server).await.with_cache(cache, Duration::from_secs(60));
        let bytes = second.read_at(100, 10).await.unwrap();
        assert_eq!(&bytes[..], &data[100..110]);
        assert_eq!(server.full_request_count().await, 0);
        assert_eq!(second.stats().full_downloads, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_full_copy_cache() {
        let server = MockServer::start(content(100)).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path()).resource(&server.url());
        let reader = open(&server).await.with_cache(cache.clone(), Duration::ZERO);

        let _ = reader.load_full().await.unwrap();
        assert!(cache.read(Namespace::Data, FULL_COPY_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_rejects_replaced_content() {
        let server = MockServer::start(vec![1u8; 100]).await;
        server.disable_ranges().await;
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path()).resource(&server.url());
        let reader = open(&server)
            .await
            .with_cache(cache.clone(), Duration::from_secs(60));
        assert_eq!(reader.identity().validator(), "\"v1\"");

        server.set_content(vec![2u8; 100], Some("\"v2\"")).await;
        let err = reader.read_at(0, 4).await.unwrap_err();
        assert!(err.is_resource_changed(), "unexpected error {err:?}");
        assert!(!reader.has_full_copy());
        assert!(cache.read(Namespace::Data, FULL_COPY_KEY).await.unwrap().is_none());
    }
}
