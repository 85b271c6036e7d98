// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for remote byte access

use crate::identity::ByteRange;

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    /// The remote object is absent (404/410). Never retried.
    #[error("Resource not found: {url} (HTTP {status})")]
    ResourceNotFound { url: String, status: u16 },

    /// The server ignores or refuses byte ranges.
    #[error("Range requests not supported by {url}")]
    RangeNotSupported { url: String },

    /// Neither Content-Length nor Content-Range revealed the size.
    #[error("Cannot determine size of {url}")]
    FileSize { url: String },

    /// Transport failure after retries were exhausted, or a permanent
    /// HTTP failure that retrying cannot fix.
    #[error("HTTP range request failed for {url}{} after {attempts} attempt(s): {cause}", fmt_range(.range))]
    HttpRange {
        url: String,
        range: Option<ByteRange>,
        attempts: usize,
        cause: String,
    },

    /// The remote object was replaced after it was probed. Never retried.
    #[error("Resource changed: {url} ({cause})")]
    ResourceChanged { url: String, cause: String },

    /// Misuse of the API: closed transport, out-of-bounds range.
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_range(range: &Option<ByteRange>) -> String {
    match range {
        Some(r) => format!(" [{}]", r),
        None => String::new(),
    }
}

impl RangeError {
    pub fn usage<S: Into<String>>(message: S) -> Self {
        RangeError::Usage(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        RangeError::Config(message.into())
    }

    /// True when the fallback to a full download should be attempted.
    #[must_use]
    pub fn is_range_not_supported(&self) -> bool {
        matches!(self, RangeError::RangeNotSupported { .. })
    }

    #[must_use]
    pub fn is_resource_changed(&self) -> bool {
        matches!(self, RangeError::ResourceChanged { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, RangeError::ResourceNotFound { .. })
    }
}

/// Result type for rangefs operations
pub type Result<T> = std::result::Result<T, RangeError>;
