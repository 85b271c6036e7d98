// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Random access to files behind plain HTTP(S) endpoints.
//!
//! - [`RangeTransport`] issues probes and `Range` requests with retry and a
//!   bounded connection pool.
//! - [`CacheStore`] persists derived payloads on disk, validated by TTL and
//!   by the remote validator (ETag or a weak substitute).
//! - [`RemoteReader`] serves byte ranges from memory or the network and
//!   falls back to one full download when the server ignores ranges.
//!
//! Nothing here knows about file formats.

pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod reader;
pub mod transport;

#[cfg(any(test, feature = "test-server"))]
pub mod testing;

pub use cache::{CacheEntry, CacheStats, CacheStore, ClearScope, Freshness, Namespace, ResourceCache};
pub use config::TransportConfig;
pub use error::{RangeError, Result};
pub use identity::{ByteRange, ContentRange, ResourceIdentity};
pub use reader::{ReaderStats, RemoteReader};
pub use transport::RangeTransport;
