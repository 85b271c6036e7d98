// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Locating, decoding and caching the Parquet footer
//!
//! A Parquet file ends with the thrift-encoded metadata, its length as a
//! little-endian u32, and the magic `PAR1`. The footer is found with one
//! read-ahead of the file tail; a second read is only needed when the
//! metadata is larger than the read-ahead.

use crate::error::{Error, Result};
use crate::stats::StatisticsIndex;
use bytes::Bytes;
use diagnostics::*;
use parquet::file::metadata::{ParquetMetaData, ParquetMetaDataReader};
use rangefs::{Namespace, RemoteReader, ResourceCache};
use std::sync::Arc;
use std::time::Duration;

pub const PARQUET_MAGIC: &[u8; 4] = b"PAR1";
const ENCRYPTED_MAGIC: &[u8; 4] = b"PARE";
const TRAILER_LEN: u64 = 8;

/// Cache key of the raw footer in [`Namespace::Footer`]
pub const FOOTER_KEY: &str = "footer";
/// Cache key of the statistics index in [`Namespace::Stats`]
pub const STATS_KEY: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterOptions {
    pub read_ahead: u64,
    /// Zero disables cache reads and writes
    pub ttl: Duration,
}

impl Default for FooterOptions {
    fn default() -> Self {
        Self {
            read_ahead: 64 * 1024,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Decoded footer plus the statistics derived from it
#[derive(Debug, Clone)]
pub struct LoadedFooter {
    pub metadata: Arc<ParquetMetaData>,
    pub index: StatisticsIndex,
    /// Metadata followed by the 8-byte trailer
    pub footer_bytes: Bytes,
    pub from_cache: bool,
}

/// Length of the metadata announced by the 8-byte trailer.
pub fn decode_trailer(trailer: &[u8]) -> std::result::Result<u64, String> {
    if trailer.len() != TRAILER_LEN as usize {
        return Err(format!("trailer must be 8 bytes, got {}", trailer.len()));
    }
    let magic = &trailer[4..8];
    if magic == ENCRYPTED_MAGIC {
        return Err("encrypted footers are not supported".to_string());
    }
    if magic != PARQUET_MAGIC {
        return Err("missing PAR1 magic".to_string());
    }
    Ok(u64::from(u32::from_le_bytes([
        trailer[0], trailer[1], trailer[2], trailer[3],
    ])))
}

/// Decode footer bytes (metadata followed by the trailer).
pub fn parse_footer(url: &str, footer: &[u8]) -> Result<ParquetMetaData> {
    if (footer.len() as u64) < TRAILER_LEN {
        return Err(Error::footer(url, "footer shorter than trailer"));
    }
    let split = footer.len() - TRAILER_LEN as usize;
    let metadata_len = decode_trailer(&footer[split..]).map_err(|m| Error::footer(url, m))?;
    if metadata_len != split as u64 {
        return Err(Error::footer(
            url,
            format!("trailer announces {metadata_len} bytes of metadata, found {split}"),
        ));
    }
    ParquetMetaDataReader::decode_metadata(&footer[..split])
        .map_err(|e| Error::footer(url, format!("cannot decode metadata: {e}")))
}

/// Load the footer for the version of the file `reader` points at,
/// preferring a cached copy made for the same validator.
pub async fn load(
    reader: &RemoteReader,
    cache: Option<&ResourceCache>,
    options: &FooterOptions,
) -> Result<LoadedFooter> {
    let identity = reader.identity();
    let url = identity.url.as_str();
    let validator = identity.validator();
    let cache = cache.filter(|_| !options.ttl.is_zero());

    if let Some(cache) = cache {
        if let Some(loaded) = load_cached(cache, url, &validator, options.ttl).await? {
            return Ok(loaded);
        }
    }

    let footer_bytes = fetch_footer(reader, options.read_ahead).await?;
    let metadata = Arc::new(parse_footer(url, &footer_bytes)?);
    let index = StatisticsIndex::from_metadata(&metadata, &validator);
    info!(
        "loaded footer of {url}: {row_groups} row groups, {rows} rows",
        url: url,
        row_groups: index.row_group_count(),
        rows: index.num_rows
    );

    if let Some(cache) = cache {
        store(cache, &footer_bytes, &index, options.ttl).await;
        if let Err(e) = cache.save_identity(identity, options.ttl).await {
            warn!("failed to record identity: {error}", error: e.to_string());
        }
    }

    Ok(LoadedFooter {
        metadata,
        index,
        footer_bytes,
        from_cache: false,
    })
}

async fn fetch_footer(reader: &RemoteReader, read_ahead: u64) -> Result<Bytes> {
    let url = reader.identity().url.as_str();
    let size = reader.size();
    if size < TRAILER_LEN + PARQUET_MAGIC.len() as u64 {
        return Err(Error::footer(url, format!("file of {size} bytes is too small")));
    }

    let tail = reader
        .read_tail(read_ahead.max(TRAILER_LEN).min(size))
        .await?;
    let trailer = &tail[tail.len() - TRAILER_LEN as usize..];
    let metadata_len = decode_trailer(trailer).map_err(|m| Error::footer(url, m))?;

    let footer_len = metadata_len + TRAILER_LEN;
    if footer_len + PARQUET_MAGIC.len() as u64 > size {
        return Err(Error::footer(
            url,
            format!("metadata length {metadata_len} exceeds file size {size}"),
        ));
    }

    if footer_len <= tail.len() as u64 {
        Ok(tail.slice(tail.len() - footer_len as usize..))
    } else {
        debug!(
            "footer of {footer_len} bytes exceeds read-ahead, fetching separately",
            footer_len: footer_len
        );
        Ok(reader.read_at(size - footer_len, footer_len).await?)
    }
}

async fn load_cached(
    cache: &ResourceCache,
    url: &str,
    validator: &str,
    ttl: Duration,
) -> Result<Option<LoadedFooter>> {
    let Some(footer_bytes) = cache.lookup(Namespace::Footer, FOOTER_KEY, validator).await? else {
        return Ok(None);
    };
    let metadata = match parse_footer(url, &footer_bytes) {
        Ok(metadata) => Arc::new(metadata),
        Err(e) => {
            warn!("discarding cached footer: {error}", error: e.to_string());
            return Ok(None);
        }
    };

    let cached_index = cache
        .lookup(Namespace::Stats, STATS_KEY, validator)
        .await?
        .and_then(|json| StatisticsIndex::from_json(&json).ok())
        .filter(|index| index.validator == validator);
    let index = match cached_index {
        Some(index) => index,
        None => {
            let index = StatisticsIndex::from_metadata(&metadata, validator);
            store_index(cache, &index, ttl).await;
            index
        }
    };

    debug!("footer of {url} served from cache", url: url);
    Ok(Some(LoadedFooter {
        metadata,
        index,
        footer_bytes,
        from_cache: true,
    }))
}

async fn store(cache: &ResourceCache, footer: &Bytes, index: &StatisticsIndex, ttl: Duration) {
    if let Err(e) = cache
        .write(Namespace::Footer, FOOTER_KEY, footer.clone(), ttl, &index.validator)
        .await
    {
        warn!("failed to cache footer: {error}", error: e.to_string());
    }
    store_index(cache, index, ttl).await;
}

/// Persist the statistics index. Failures only cost a rebuild later.
pub async fn store_index(cache: &ResourceCache, index: &StatisticsIndex, ttl: Duration) {
    let json = match index.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode statistics: {error}", error: e.to_string());
            return;
        }
    };
    if let Err(e) = cache
        .write(Namespace::Stats, STATS_KEY, Bytes::from(json), ttl, &index.validator)
        .await
    {
        warn!("failed to cache statistics: {error}", error: e.to_string());
    }
}
