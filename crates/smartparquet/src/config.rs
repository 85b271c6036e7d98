// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Reader configuration

use crate::error::{Error, Result};
use rangefs::TransportConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default cache directory
pub const CACHE_DIR_ENV: &str = "HTTPCACHEFS_CACHE_DIR";

/// Options for [`crate::SmartParquetReader`]. Durations are in seconds.
///
/// ```yaml
/// retries: 5
/// backoff_factor: 0.25
/// headers:
///   Authorization: Bearer abc
/// cache_ttl: 600
/// partition_column: key
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    pub retries: usize,
    pub backoff_factor: f64,
    pub connect_timeout: f64,
    pub read_timeout: f64,
    pub pool_size: usize,
    pub pool_per_host: usize,
    pub headers: BTreeMap<String, String>,
    pub cache_dir: PathBuf,
    /// Zero disables every cache read and write
    pub cache_ttl: u64,
    /// Column used by [`crate::SmartParquetReader::query`]; detected from
    /// statistics when unset
    pub partition_column: Option<String>,
    pub cache_queries: bool,
    /// Ranges beyond this count in one read are replaced by a full download
    pub max_ranges: usize,
    /// Bytes read from the end of the file when locating the footer
    pub footer_read_ahead: u64,
    pub debug: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_factor: 0.5,
            connect_timeout: 10.0,
            read_timeout: 30.0,
            pool_size: 10,
            pool_per_host: 10,
            headers: BTreeMap::new(),
            cache_dir: default_cache_dir(),
            cache_ttl: 3600,
            partition_column: None,
            cache_queries: true,
            max_ranges: 32,
            footer_read_ahead: 64 * 1024,
            debug: false,
        }
    }
}

/// `$HTTPCACHEFS_CACHE_DIR`, else `httpcachefs` under the system temp dir.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("httpcachefs"),
    }
}

/// Load configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ReaderConfig> {
    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::config(format!(
            "Failed to read config file {}: {e}",
            path.as_ref().display()
        ))
    })?;
    ReaderConfig::from_yaml(&content)
}

impl ReaderConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ReaderConfig = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(Error::config("backoff_factor must be a non-negative number"));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::config(format!("{name} must be positive")));
            }
        }
        if self.pool_size == 0 {
            return Err(Error::config("pool_size must be at least 1"));
        }
        if self.max_ranges == 0 {
            return Err(Error::config("max_ranges must be at least 1"));
        }
        if self.footer_read_ahead < 8 {
            return Err(Error::config("footer_read_ahead must be at least 8 bytes"));
        }
        if self
            .partition_column
            .as_ref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(Error::config("partition_column cannot be empty"));
        }
        self.transport_config().validate()?;
        Ok(())
    }

    /// Settings for the HTTP transport.
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            retries: self.retries,
            backoff_factor: Duration::from_secs_f64(self.backoff_factor.max(0.0)),
            connect_timeout: Duration::from_secs_f64(self.connect_timeout.max(0.001)),
            read_timeout: Duration::from_secs_f64(self.read_timeout.max(0.001)),
            pool_size: self.pool_size,
            pool_per_host: self.pool_per_host,
            headers: self.headers.clone(),
        }
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.cache_ttl > 0
    }
}
