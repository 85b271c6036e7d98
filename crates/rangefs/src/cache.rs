// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! On-disk cache with TTL and content-identity validation
//!
//! Each remote resource gets its own directory, named by the SHA-256 of its
//! URL, with one subdirectory per [`Namespace`]. An entry is a single file:
//!
//! ```text
//! HCFSENT1 | u32 LE header length | header JSON | payload
//! ```
//!
//! The header records when the entry was written, its TTL, the validator of
//! the resource version it was derived from, and the payload length and
//! SHA-256. Entries are staged in a temporary file in the same directory and
//! renamed into place, so readers see either the old entry or the new one.
//! Anything that fails to decode is treated as a miss.

use crate::error::{RangeError, Result};
use crate::identity::ResourceIdentity;
use backon::{BlockingRetryable, ExponentialBuilder};
use bytes::Bytes;
use diagnostics::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

const MAGIC: &[u8; 8] = b"HCFSENT1";
const MAX_HEADER_LEN: u32 = 64 * 1024;
const MAX_PLAIN_KEY_LEN: usize = 64;
const ENTRY_EXTENSION: &str = "entry";
const IDENTITY_KEY: &str = "identity";

/// Kinds of payload kept per resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Raw footer bytes
    Footer,
    /// Derived statistics index
    Stats,
    /// Full copies of the resource
    Data,
    /// Results of equality queries
    Queries,
    /// Results of SQL queries
    Sql,
    /// Last observed identity
    Meta,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Footer,
        Namespace::Stats,
        Namespace::Data,
        Namespace::Queries,
        Namespace::Sql,
        Namespace::Meta,
    ];

    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Namespace::Footer => "footer",
            Namespace::Stats => "stats",
            Namespace::Data => "data",
            Namespace::Queries => "queries",
            Namespace::Sql => "sql",
            Namespace::Meta => "meta",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// What to remove with [`ResourceCache::clear`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Namespace(Namespace),
    Resource,
}

/// Classification of an entry against the current validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL and derived from the current resource version
    Fresh,
    /// TTL lapsed but the validator still matches; usable after revalidation
    Expired,
    /// Derived from another resource version; must not be served
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    pub validator: String,
    pub len: u64,
    pub sha256: String,
}

impl EntryHeader {
    /// Classify against `validator` at time `now_ms`. A validator mismatch
    /// wins over an unexpired TTL.
    #[must_use]
    pub fn freshness(&self, now_ms: u64, validator: &str) -> Freshness {
        let expired = now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms;
        if self.validator != validator {
            Freshness::Stale
        } else if expired {
            Freshness::Expired
        } else {
            Freshness::Fresh
        }
    }
}

/// A decoded cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub header: EntryHeader,
    pub payload: Bytes,
}

impl CacheEntry {
    #[must_use]
    pub fn freshness(&self, now_ms: u64, validator: &str) -> Freshness {
        self.header.freshness(now_ms, validator)
    }
}

/// Hit and miss counters for one resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub corrupt: u64,
    pub revalidations: u64,
}

/// Root of the cache directory tree
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache scoped to one remote resource.
    #[must_use]
    pub fn resource(&self, url: &str) -> ResourceCache {
        ResourceCache {
            url: url.to_string(),
            dir: self.root.join(url_hash(url)),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Remove every cached resource.
    pub async fn clear_all(&self) -> Result<()> {
        remove_dir_if_present(&self.root).await?;
        info!("cleared cache at {root}", root: self.root.display().to_string());
        Ok(())
    }
}

/// Cache entries belonging to one URL
#[derive(Debug, Clone)]
pub struct ResourceCache {
    url: String,
    dir: PathBuf,
    stats: Arc<Mutex<CacheStats>>,
}

impl ResourceCache {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn namespace_dir(&self, ns: Namespace) -> PathBuf {
        self.dir.join(ns.dir_name())
    }

    #[must_use]
    pub fn entry_path(&self, ns: Namespace, key: &str) -> PathBuf {
        self.namespace_dir(ns)
            .join(format!("{}.{ENTRY_EXTENSION}", file_key(key)))
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.lock().await
    }

    /// Read an entry. Absent or undecodable entries are `None`.
    pub async fn read(&self, ns: Namespace, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(ns, key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(
                    "unreadable cache entry {path}: {error}",
                    path: path.display().to_string(),
                    error: e.to_string()
                );
                return Ok(None);
            }
        };

        match decode_entry(Bytes::from(data)) {
            Ok(entry) => Ok(Some(entry)),
            Err(reason) => {
                warn!(
                    "corrupt cache entry {path}: {reason}",
                    path: path.display().to_string(),
                    reason: reason.as_str()
                );
                self.stats.lock().await.corrupt += 1;
                Ok(None)
            }
        }
    }

    /// Read only the header of an entry.
    pub async fn read_header(&self, ns: Namespace, key: &str) -> Result<Option<EntryHeader>> {
        let path = self.entry_path(ns, key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut prefix = [0u8; 12];
        if file.read_exact(&mut prefix).await.is_err() || &prefix[..8] != MAGIC {
            return Ok(None);
        }
        let header_len = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);
        if header_len > MAX_HEADER_LEN {
            return Ok(None);
        }
        let mut header = vec![0u8; header_len as usize];
        if file.read_exact(&mut header).await.is_err() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&header).ok())
    }

    /// True if the entry exists, is within TTL and matches `validator`.
    pub async fn is_fresh(&self, ns: Namespace, key: &str, validator: &str) -> Result<bool> {
        Ok(self
            .read_header(ns, key)
            .await?
            .is_some_and(|h| h.freshness(now_ms(), validator) == Freshness::Fresh))
    }

    /// Payload usable for `validator`: fresh entries directly, expired but
    /// valid ones after revalidation. Stale entries are deleted.
    pub async fn lookup(&self, ns: Namespace, key: &str, validator: &str) -> Result<Option<Bytes>> {
        let Some(entry) = self.read(ns, key).await? else {
            self.stats.lock().await.misses += 1;
            return Ok(None);
        };

        match entry.freshness(now_ms(), validator) {
            Freshness::Fresh => {
                self.stats.lock().await.hits += 1;
                debug!("cache hit {ns}/{key}", ns: ns.dir_name(), key: key);
                Ok(Some(entry.payload))
            }
            Freshness::Expired => {
                if let Err(e) = self.rewrite_header(ns, key, &entry).await {
                    warn!("failed to revalidate {ns}/{key}: {error}", ns: ns.dir_name(), key: key, error: e.to_string());
                }
                let mut stats = self.stats.lock().await;
                stats.hits += 1;
                stats.revalidations += 1;
                Ok(Some(entry.payload))
            }
            Freshness::Stale => {
                debug!("stale cache entry {ns}/{key}", ns: ns.dir_name(), key: key);
                self.stats.lock().await.misses += 1;
                let _ = tokio::fs::remove_file(self.entry_path(ns, key)).await;
                Ok(None)
            }
        }
    }

    /// Store `payload` atomically, replacing any previous entry.
    pub async fn write(
        &self,
        ns: Namespace,
        key: &str,
        payload: Bytes,
        ttl: Duration,
        validator: &str,
    ) -> Result<()> {
        let header = EntryHeader {
            created_at_ms: now_ms(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            validator: validator.to_string(),
            len: payload.len() as u64,
            sha256: sha256_hex(&payload),
        };
        self.write_entry(ns, key, &header, payload).await?;
        self.stats.lock().await.writes += 1;
        debug!("cached {ns}/{key}", ns: ns.dir_name(), key: key);
        Ok(())
    }

    /// Reset the creation time of an expired entry whose validator still
    /// matches. Returns false when there is nothing to revalidate.
    pub async fn revalidate(&self, ns: Namespace, key: &str) -> Result<bool> {
        let Some(entry) = self.read(ns, key).await? else {
            return Ok(false);
        };
        self.rewrite_header(ns, key, &entry).await?;
        self.stats.lock().await.revalidations += 1;
        Ok(true)
    }

    pub async fn clear(&self, scope: ClearScope) -> Result<()> {
        let target = match scope {
            ClearScope::Namespace(ns) => self.namespace_dir(ns),
            ClearScope::Resource => self.dir.clone(),
        };
        remove_dir_if_present(&target).await?;
        info!("cleared {scope} cache for {url}", scope: format!("{scope:?}"), url: self.url.as_str());
        Ok(())
    }

    /// Record the identity last seen for this resource.
    pub async fn save_identity(&self, identity: &ResourceIdentity, ttl: Duration) -> Result<()> {
        let json = serde_json::to_vec(identity)
            .map_err(|e| RangeError::Io(std::io::Error::other(e)))?;
        self.write(Namespace::Meta, IDENTITY_KEY, Bytes::from(json), ttl, &identity.validator())
            .await
    }

    /// Identity recorded by [`ResourceCache::save_identity`], regardless of age.
    pub async fn load_identity(&self) -> Result<Option<ResourceIdentity>> {
        Ok(self
            .read(Namespace::Meta, IDENTITY_KEY)
            .await?
            .and_then(|entry| serde_json::from_slice(&entry.payload).ok()))
    }

    async fn rewrite_header(&self, ns: Namespace, key: &str, entry: &CacheEntry) -> Result<()> {
        let header = EntryHeader {
            created_at_ms: now_ms(),
            ..entry.header.clone()
        };
        self.write_entry(ns, key, &header, entry.payload.clone()).await
    }

    async fn write_entry(
        &self,
        ns: Namespace,
        key: &str,
        header: &EntryHeader,
        payload: Bytes,
    ) -> Result<()> {
        let dir = self.namespace_dir(ns);
        let path = self.entry_path(ns, key);
        let prefix = encode_prefix(header)?;

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &prefix, &payload))
            .await
            .map_err(|e| RangeError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Directory name for a URL
#[must_use]
pub fn url_hash(url: &str) -> String {
    sha256_hex(url.as_bytes())
}

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Keys that are not plain file names are hashed.
fn file_key(key: &str) -> String {
    let plain = !key.is_empty()
        && key.len() <= MAX_PLAIN_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if plain {
        key.to_string()
    } else {
        sha256_hex(key.as_bytes())
    }
}

fn encode_prefix(header: &EntryHeader) -> Result<Vec<u8>> {
    let json =
        serde_json::to_vec(header).map_err(|e| RangeError::Io(std::io::Error::other(e)))?;
    let len = u32::try_from(json.len())
        .map_err(|_| RangeError::usage("cache entry header too large"))?;
    let mut prefix = Vec::with_capacity(MAGIC.len() + 4 + json.len());
    prefix.extend_from_slice(MAGIC);
    prefix.extend_from_slice(&len.to_le_bytes());
    prefix.extend_from_slice(&json);
    Ok(prefix)
}

fn decode_entry(data: Bytes) -> std::result::Result<CacheEntry, String> {
    if data.len() < MAGIC.len() + 4 || &data[..MAGIC.len()] != MAGIC {
        return Err("bad magic".to_string());
    }
    let header_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let payload_start = 12 + header_len;
    if header_len as u32 > MAX_HEADER_LEN || data.len() < payload_start {
        return Err("truncated header".to_string());
    }
    let header: EntryHeader =
        serde_json::from_slice(&data[12..payload_start]).map_err(|e| format!("bad header: {e}"))?;

    let payload = data.slice(payload_start..);
    if payload.len() as u64 != header.len {
        return Err(format!(
            "length mismatch: header says {}, found {}",
            header.len,
            payload.len()
        ));
    }
    if sha256_hex(&payload) != header.sha256 {
        return Err("checksum mismatch".to_string());
    }
    Ok(CacheEntry { header, payload })
}

fn write_atomic(dir: &Path, path: &Path, prefix: &[u8], payload: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    // Rename fails with PermissionDenied while another process holds the target open.
    (|| persist_once(dir, path, prefix, payload))
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(10))
                .with_max_times(2),
        )
        .sleep(std::thread::sleep)
        .when(|e: &std::io::Error| e.kind() == std::io::ErrorKind::PermissionDenied)
        .call()
}

fn persist_once(dir: &Path, path: &Path, prefix: &[u8], payload: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(prefix)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    _ = tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
