// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The query orchestrator
//!
//! A [`SmartParquetReader`] answers partition lookups and SQL against one
//! remote Parquet file. Every operation first re-probes the resource; when
//! its validator changed, the footer, statistics and byte reader are rebuilt
//! before anything is served. Only the row groups whose statistics may match
//! are fetched, and only their projected column chunks.

use crate::config::ReaderConfig;
use crate::decode::{
    FetchedRowGroups, Materializer, ParquetMaterializer, QueryResult, SparseFile, plan_ranges,
};
use crate::engine::{DataFusionEngine, SqlEngine, TABLE_NAME, rewrite_table_reference};
use crate::error::{Error, Result};
use crate::fingerprint::{query_fingerprint, sql_fingerprint};
use crate::footer::{self, FooterOptions, LoadedFooter};
use crate::predicate::{Predicate, analyze};
use crate::pruning::select_row_groups;
use crate::registry::ResourceRegistry;
use crate::stats::{RowGroupStats, StatValue, detect_partition_column};
use arrow::datatypes::SchemaRef;
use diagnostics::*;
use parquet::arrow::arrow_reader::{ArrowReaderMetadata, ArrowReaderOptions};
use rangefs::{
    CacheStore, ClearScope, Namespace, RangeTransport, ReaderStats, RemoteReader, ResourceCache,
    ResourceIdentity,
};
use std::sync::{Arc, Mutex, PoisonError};

/// Where a reader is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// Everything derived from one version of the remote file
#[derive(Debug)]
struct Snapshot {
    identity: ResourceIdentity,
    reader: RemoteReader,
    footer: Arc<LoadedFooter>,
    /// Configured or detected from statistics
    partition_column: Option<String>,
}

impl Snapshot {
    fn validator(&self) -> String {
        self.identity.validator()
    }

    /// Top-level column index of `name`
    fn column_index(&self, name: &str) -> Option<usize> {
        self.footer.index.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug)]
enum State {
    Uninitialized(Arc<RangeTransport>),
    Ready(Arc<Snapshot>),
    Closed,
}

/// Marks a reader `Initializing` until dropped. Unless finished, the reader
/// goes back to `Uninitialized`, also when the initializing future is
/// cancelled.
struct Initializing<'a> {
    reader: &'a SmartParquetReader,
    finished: bool,
}

impl<'a> Initializing<'a> {
    fn start(reader: &'a SmartParquetReader) -> Self {
        reader.set_phase(Lifecycle::Initializing);
        Self {
            reader,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.reader.set_phase(Lifecycle::Ready);
    }
}

impl Drop for Initializing<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.reader.set_phase(Lifecycle::Uninitialized);
        }
    }
}

/// Builder for [`SmartParquetReader`]
#[derive(Debug)]
pub struct SmartParquetReaderBuilder {
    url: String,
    config: ReaderConfig,
    registry: Option<Arc<ResourceRegistry>>,
    materializer: Option<Arc<dyn Materializer>>,
    engine: Option<Arc<dyn SqlEngine>>,
}

impl SmartParquetReaderBuilder {
    #[must_use]
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Share transports and footers through `registry` instead of the
    /// process-wide one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn SqlEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Validate the configuration and acquire a transport. No request is
    /// sent until the first operation.
    pub fn build(self) -> Result<SmartParquetReader> {
        self.config.validate()?;
        let registry = self.registry.unwrap_or_else(ResourceRegistry::shared);
        let transport = registry.transport(&self.url, &self.config.transport_config())?;
        let cache = self
            .config
            .cache_enabled()
            .then(|| CacheStore::new(self.config.cache_dir.clone()).resource(&self.url));

        Ok(SmartParquetReader {
            url: self.url,
            config: self.config,
            registry,
            cache,
            materializer: self
                .materializer
                .unwrap_or_else(|| Arc::new(ParquetMaterializer::default())),
            engine: self.engine.unwrap_or_else(|| Arc::new(DataFusionEngine)),
            state: tokio::sync::Mutex::new(State::Uninitialized(transport)),
            phase: Mutex::new(Lifecycle::Uninitialized),
            inferred_partition: Mutex::new(None),
        })
    }
}

/// Reads one remote Parquet file through range requests and a local cache
#[derive(Debug)]
pub struct SmartParquetReader {
    url: String,
    config: ReaderConfig,
    registry: Arc<ResourceRegistry>,
    /// `None` when the cache TTL is zero
    cache: Option<ResourceCache>,
    materializer: Arc<dyn Materializer>,
    engine: Arc<dyn SqlEngine>,
    state: tokio::sync::Mutex<State>,
    phase: Mutex<Lifecycle>,
    /// Learned from equality predicates in SQL when nothing else is known
    inferred_partition: Mutex<Option<String>>,
}

impl SmartParquetReader {
    #[must_use]
    pub fn builder(url: impl Into<String>) -> SmartParquetReaderBuilder {
        SmartParquetReaderBuilder {
            url: url.into(),
            config: ReaderConfig::default(),
            registry: None,
            materializer: None,
            engine: None,
        }
    }

    pub fn new(url: impl Into<String>, config: ReaderConfig) -> Result<Self> {
        Self::builder(url).config(config).build()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> Option<&ResourceCache> {
        self.cache.as_ref()
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Lifecycle) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Probe the resource and load its footer. Concurrent callers share
    /// one initialization; calling it again only re-checks freshness.
    pub async fn initialize(&self) -> Result<()> {
        _ = self.snapshot().await?;
        Ok(())
    }

    /// Rows whose partition column equals `value`, restricted to `columns`
    /// (all columns when `None`).
    pub async fn query(&self, value: StatValue, columns: Option<&[String]>) -> Result<QueryResult> {
        let snapshot = self.snapshot().await?;
        let column = self.partition_column_of(&snapshot).ok_or_else(|| {
            Error::usage(format!(
                "no partition column configured or detected for {}",
                self.url
            ))
        })?;
        let columns = columns
            .map(|requested| resolve_columns(&snapshot, requested))
            .transpose()?;

        let validator = snapshot.validator();
        let fingerprint = query_fingerprint(&validator, &column, &value, columns.as_deref());
        let use_cache = self.config.cache_queries;
        if use_cache {
            if let Some(hit) = self
                .cached_result(Namespace::Queries, &fingerprint, &validator)
                .await
            {
                return Ok(hit);
            }
        }

        let predicate = Predicate::equality(column.as_str(), value.clone());
        let row_groups = select_row_groups(&snapshot.footer.index, &predicate);
        info!(
            "query {predicate} selected {selected} of {total} row groups",
            predicate: predicate.to_string(),
            selected: row_groups.len(),
            total: snapshot.footer.index.row_group_count()
        );

        let projection = match &columns {
            Some(names) => {
                let mut indices: Vec<usize> = names
                    .iter()
                    .chain(std::iter::once(&column))
                    .filter_map(|c| snapshot.column_index(c))
                    .collect();
                indices.sort_unstable();
                indices.dedup();
                indices
            }
            None => (0..snapshot.footer.index.columns.len()).collect(),
        };

        let mut result = self
            .materialize(&snapshot, row_groups, projection)
            .await?
            .filter_equal(&column, &value)?;
        if let Some(names) = &columns {
            result = result.project(names)?;
        }

        if use_cache {
            self.store_result(Namespace::Queries, &fingerprint, &result, &validator)
                .await;
        }
        Ok(result)
    }

    /// Run `sql` against the file, which is visible as table `data` (or via
    /// `FROM '<url>'` / `FROM {url}`). Only row groups that may satisfy the
    /// WHERE clause are fetched.
    pub async fn execute_sql(&self, sql: &str, cache_result: bool) -> Result<QueryResult> {
        let snapshot = self.snapshot().await?;
        let validator = snapshot.validator();
        let fingerprint = sql_fingerprint(&validator, sql);
        if cache_result {
            if let Some(hit) = self
                .cached_result(Namespace::Sql, &fingerprint, &validator)
                .await
            {
                return Ok(hit);
            }
        }

        let rewritten = rewrite_table_reference(sql);
        let index = &snapshot.footer.index;
        let analysis = analyze(&rewritten, &index.columns);
        self.registry
            .record_equality_columns(&self.url, &analysis.equality_columns);
        if snapshot.partition_column.is_none() {
            if let Some(column) = analysis.inferred_partition_column() {
                let mut inferred = self
                    .inferred_partition
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if inferred.is_none() {
                    debug!("inferred partition column {column}", column: column);
                    *inferred = Some(column.to_string());
                }
            }
        }

        let row_groups = select_row_groups(index, &analysis.predicate);
        info!(
            "SQL predicate {predicate} selected {selected} of {total} row groups",
            predicate: analysis.predicate.to_string(),
            selected: row_groups.len(),
            total: index.row_group_count()
        );

        let projection = match &analysis.columns {
            Some(names) if !names.is_empty() => names
                .iter()
                .filter_map(|c| snapshot.column_index(c))
                .collect(),
            // Row counts still need one column.
            Some(_) => (0..index.columns.len().min(1)).collect(),
            None => (0..index.columns.len()).collect(),
        };

        let input = self.materialize(&snapshot, row_groups, projection).await?;
        let result = self.engine.execute(TABLE_NAME, input, &rewritten).await?;

        if cache_result {
            self.store_result(Namespace::Sql, &fingerprint, &result, &validator)
                .await;
        }
        Ok(result)
    }

    /// Release the reader. Idempotent; later operations fail with a usage
    /// error.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let transport = match std::mem::replace(&mut *state, State::Closed) {
            State::Closed => return,
            State::Uninitialized(transport) => transport,
            State::Ready(snapshot) => Arc::clone(snapshot.reader.transport()),
        };
        self.set_phase(Lifecycle::Closed);
        if self.registry.release(&self.url, &transport) {
            debug!("closed transport for {url}", url: self.url.as_str());
        }
        debug!("closed reader for {url}", url: self.url.as_str());
    }

    /// Statistics of every row group.
    pub async fn row_groups(&self) -> Result<Vec<RowGroupStats>> {
        Ok(self.snapshot().await?.footer.index.row_groups.clone())
    }

    /// Row groups an equality lookup of `value` would fetch.
    pub async fn matching_row_groups(&self, value: &StatValue) -> Result<Vec<usize>> {
        let snapshot = self.snapshot().await?;
        Ok(match self.partition_column_of(&snapshot) {
            Some(column) => select_row_groups(
                &snapshot.footer.index,
                &Predicate::equality(column, value.clone()),
            ),
            None => (0..snapshot.footer.index.row_group_count()).collect(),
        })
    }

    pub async fn partition_column(&self) -> Result<Option<String>> {
        let snapshot = self.snapshot().await?;
        Ok(self.partition_column_of(&snapshot))
    }

    pub async fn identity(&self) -> Result<ResourceIdentity> {
        Ok(self.snapshot().await?.identity.clone())
    }

    /// Arrow schema of the file.
    pub async fn schema(&self) -> Result<SchemaRef> {
        let snapshot = self.snapshot().await?;
        let metadata = ArrowReaderMetadata::try_new(
            Arc::clone(&snapshot.footer.metadata),
            ArrowReaderOptions::new(),
        )?;
        Ok(Arc::clone(metadata.schema()))
    }

    /// Counters of the byte reader for the current version, if loaded.
    pub async fn reader_stats(&self) -> Option<ReaderStats> {
        match &*self.state.lock().await {
            State::Ready(snapshot) => Some(snapshot.reader.stats()),
            _ => None,
        }
    }

    /// Remove every cached entry of this resource.
    pub async fn clear_cache(&self) -> Result<()> {
        self.registry.forget_footer(&self.url);
        if let Some(cache) = &self.cache {
            cache.clear(ClearScope::Resource).await?;
            info!("cleared cache for {url}", url: self.url.as_str());
        }
        Ok(())
    }

    fn partition_column_of(&self, snapshot: &Snapshot) -> Option<String> {
        snapshot.partition_column.clone().or_else(|| {
            self.inferred_partition
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Current snapshot, built on first use and rebuilt when the remote
    /// validator changed. Holding the state lock makes builds single
    /// flight.
    async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let mut state = self.state.lock().await;
        let (transport, current) = match &*state {
            State::Closed => {
                return Err(Error::usage(format!("reader for {} is closed", self.url)));
            }
            State::Uninitialized(transport) => (Arc::clone(transport), None),
            State::Ready(snapshot) => (
                Arc::clone(snapshot.reader.transport()),
                Some(Arc::clone(snapshot)),
            ),
        };

        let Some(current) = current else {
            let mut initializing = Initializing::start(self);
            let identity = transport.probe().await?;
            let snapshot = Arc::new(self.build_snapshot(transport, identity).await?);
            *state = State::Ready(Arc::clone(&snapshot));
            initializing.finish();
            return Ok(snapshot);
        };

        let identity = transport.probe().await?;
        if identity.validator() == current.validator() && identity.size == current.identity.size {
            return Ok(current);
        }
        info!(
            "{url} changed ({old} -> {new}), rebuilding",
            url: self.url.as_str(),
            old: current.validator(),
            new: identity.validator()
        );
        let snapshot = Arc::new(self.build_snapshot(transport, identity).await?);
        *state = State::Ready(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    async fn build_snapshot(
        &self,
        transport: Arc<RangeTransport>,
        identity: ResourceIdentity,
    ) -> Result<Snapshot> {
        let ttl = self.config.cache_ttl();
        let mut reader = RemoteReader::new(transport, identity.clone())
            .with_max_ranges(self.config.max_ranges);
        if let Some(cache) = &self.cache {
            reader = reader.with_cache(cache.clone(), ttl);
        }

        let validator = identity.validator();
        let footer = match self.registry.footer(&self.url, &validator) {
            Some(footer) => footer,
            None => {
                let options = FooterOptions {
                    read_ahead: self.config.footer_read_ahead,
                    ttl,
                };
                let footer = Arc::new(footer::load(&reader, self.cache.as_ref(), &options).await?);
                self.registry.store_footer(&self.url, Arc::clone(&footer));
                footer
            }
        };

        let partition_column = self.resolve_partition_column(&footer).await?;
        Ok(Snapshot {
            identity,
            reader,
            footer,
            partition_column,
        })
    }

    async fn resolve_partition_column(&self, footer: &LoadedFooter) -> Result<Option<String>> {
        let index = &footer.index;
        if let Some(configured) = &self.config.partition_column {
            return index
                .resolve_column(configured)
                .map(|c| Some(c.to_string()))
                .ok_or_else(|| {
                    Error::config(format!(
                        "partition column {configured} not found in {}",
                        self.url
                    ))
                });
        }
        if index.partition_column.is_some() {
            return Ok(index.partition_column.clone());
        }

        let detected =
            detect_partition_column(index, &self.registry.equality_columns(&self.url));
        match &detected {
            Some(column) => {
                info!("detected partition column {column}", column: column.as_str());
                if let Some(cache) = &self.cache {
                    let mut updated = index.clone();
                    updated.partition_column = detected.clone();
                    footer::store_index(cache, &updated, self.config.cache_ttl()).await;
                }
            }
            None => debug!("no partition column detected for {url}", url: self.url.as_str()),
        }
        Ok(detected)
    }

    async fn materialize(
        &self,
        snapshot: &Snapshot,
        row_groups: Vec<usize>,
        projection: Vec<usize>,
    ) -> Result<QueryResult> {
        let metadata = Arc::clone(&snapshot.footer.metadata);
        let ranges = plan_ranges(&metadata, &row_groups, &projection);
        let data = snapshot.reader.read_ranges(&ranges).await?;
        debug!(
            "fetched {count} ranges for {groups} row groups",
            count: ranges.len(),
            groups: row_groups.len()
        );
        let file = SparseFile::from_ranges(snapshot.reader.size(), &ranges, data);
        self.materializer
            .materialize(FetchedRowGroups {
                metadata,
                row_groups,
                projection,
                file,
            })
            .await
    }

    async fn cached_result(&self, ns: Namespace, key: &str, validator: &str) -> Option<QueryResult> {
        let cache = self.cache.as_ref()?;
        let bytes = match cache.lookup(ns, key, validator).await {
            Ok(hit) => hit?,
            Err(e) => {
                warn!("result cache lookup failed: {error}", error: e.to_string());
                return None;
            }
        };
        match QueryResult::from_ipc(&bytes) {
            Ok(result) => {
                info!("{ns} cache hit for {url}", ns: ns.to_string(), url: self.url.as_str());
                Some(result)
            }
            Err(e) => {
                warn!("discarding undecodable cached result: {error}", error: e.to_string());
                None
            }
        }
    }

    async fn store_result(&self, ns: Namespace, key: &str, result: &QueryResult, validator: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let payload = match result.to_ipc() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode result: {error}", error: e.to_string());
                return;
            }
        };
        if let Err(e) = cache
            .write(ns, key, payload, self.config.cache_ttl(), validator)
            .await
        {
            warn!("failed to cache result: {error}", error: e.to_string());
        }
    }
}

/// Map requested names onto schema columns.
fn resolve_columns(snapshot: &Snapshot, requested: &[String]) -> Result<Vec<String>> {
    requested
        .iter()
        .map(|name| {
            snapshot
                .footer
                .index
                .resolve_column(name)
                .map(str::to_string)
                .ok_or_else(|| Error::usage(format!("unknown column {name}")))
        })
        .collect()
}
