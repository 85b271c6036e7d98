// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Query remote Parquet files without downloading them.
//!
//! [`SmartParquetReader`] reads the footer of a file served over HTTP(S),
//! keeps per row-group min/max statistics, and answers partition lookups
//! and SQL by fetching only the column chunks of row groups that may hold
//! matching rows. Footers, statistics and results are cached on disk and
//! invalidated when the remote ETag (or its weak substitute) changes.
//!
//! ```no_run
//! # async fn example() -> smartparquet::Result<()> {
//! use smartparquet::{ReaderConfig, SmartParquetReader, StatValue};
//!
//! let reader = SmartParquetReader::new("https://example.com/data.parquet", ReaderConfig::default())?;
//! let rows = reader.query(StatValue::Int(65), None).await?;
//! let counts = reader.execute_sql("SELECT name, count(*) FROM data GROUP BY name", true).await?;
//! reader.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod footer;
pub mod predicate;
pub mod pruning;
pub mod reader;
pub mod registry;
pub mod stats;

pub use config::{ReaderConfig, load_config};
pub use decode::{FetchedRowGroups, Materializer, ParquetMaterializer, QueryResult, SparseFile};
pub use engine::{DataFusionEngine, SqlEngine, extract_sql_url};
pub use error::{Error, Result};
pub use footer::LoadedFooter;
pub use predicate::{ColumnPredicate, Constraint, Predicate, SqlAnalysis, analyze, parse_literal};
pub use pruning::select_row_groups;
pub use reader::{Lifecycle, SmartParquetReader, SmartParquetReaderBuilder};
pub use registry::ResourceRegistry;
pub use stats::{ColumnBounds, RowGroupStats, StatValue, StatisticsIndex};

pub use rangefs::{ByteRange, CacheStore, ResourceIdentity};
