// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for smartparquet

use rangefs::RangeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport, cache or remote-reader failure
    #[error(transparent)]
    Range(#[from] RangeError),

    /// The footer could not be located or decoded. Never retried.
    #[error("Invalid Parquet footer in {url}: {message}")]
    Footer { url: String, message: String },

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// Failure reported by a row-group materializer
    #[error("Decode error: {0}")]
    Decode(String),

    /// Failure reported by a pluggable SQL engine
    #[error("SQL engine error: {0}")]
    Engine(String),

    /// Misuse of the reader: closed, uninitialized, missing partition column
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn footer<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Error::Footer {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn usage<S: Into<String>>(message: S) -> Self {
        Error::Usage(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Error::Decode(message.into())
    }

    pub fn engine<S: Into<String>>(message: S) -> Self {
        Error::Engine(message.into())
    }

    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Error::Serialization(message.into())
    }

    /// True when the remote object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Range(e) if e.is_not_found())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for smartparquet operations
pub type Result<T> = std::result::Result<T, Error>;
