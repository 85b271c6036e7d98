// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests against an in-process HTTP server

use arrow::array::{AsArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use rangefs::ByteRange;
use rangefs::testing::MockServer;
use smartparquet::{
    Error, Lifecycle, ReaderConfig, ResourceRegistry, SmartParquetReader, StatValue,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Inclusive key bounds of each row group. Group 3 is wider than the rest
/// and 30..50 and 81..100 fall between groups.
const KEY_GROUPS: [(i64, i64); 10] = [
    (0, 9),
    (10, 19),
    (20, 29),
    (50, 80),
    (100, 109),
    (110, 119),
    (120, 129),
    (130, 139),
    (140, 149),
    (150, 159),
];

const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];

/// Ten row groups with a non-overlapping `key`, and overlapping `name` and
/// `score` columns. `shift` is added to every key.
fn fixture(shift: i64) -> Bytes {
    let schema = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("score", DataType::Float64, false),
    ]));
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema.clone(), None).unwrap();
    for (low, high) in KEY_GROUPS {
        let keys: Vec<i64> = (low..=high).map(|k| k + shift).collect();
        let names: Vec<&str> = (low..=high).map(|k| NAMES[(k % 3) as usize]).collect();
        let scores: Vec<f64> = (low..=high).map(|k| (k % 7) as f64).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(StringArray::from(names)),
                Arc::new(Float64Array::from(scores)),
            ],
        )
        .unwrap();
        writer.write(&batch).unwrap();
        writer.flush().unwrap();
    }
    writer.close().unwrap();
    Bytes::from(buffer)
}

fn test_config(cache_dir: &Path) -> ReaderConfig {
    ReaderConfig {
        cache_dir: cache_dir.to_path_buf(),
        retries: 2,
        backoff_factor: 0.01,
        ..ReaderConfig::default()
    }
}

fn open(url: &str, config: ReaderConfig) -> SmartParquetReader {
    SmartParquetReader::builder(url)
        .config(config)
        .registry(Arc::new(ResourceRegistry::new()))
        .build()
        .unwrap()
}

fn parse_range(header: &str) -> ByteRange {
    let spec = header.strip_prefix("bytes=").unwrap();
    let (start, end) = spec.split_once('-').unwrap();
    ByteRange::from_bounds(start.parse().unwrap(), end.parse::<u64>().unwrap() + 1)
}

fn keys(result: &smartparquet::QueryResult) -> Vec<i64> {
    result
        .batches
        .iter()
        .flat_map(|b| {
            let index = b.schema().index_of("key").unwrap();
            b.column(index)
                .as_primitive::<Int64Type>()
                .values()
                .to_vec()
        })
        .collect()
}

#[tokio::test]
async fn test_partition_lookup_fetches_only_matching_row_group() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ReaderConfig {
        footer_read_ahead: 8,
        ..test_config(dir.path())
    };
    let reader = open(&server.url(), config);

    reader.initialize().await.unwrap();
    assert_eq!(reader.lifecycle(), Lifecycle::Ready);
    assert_eq!(reader.partition_column().await.unwrap().as_deref(), Some("key"));
    let row_groups = reader.row_groups().await.unwrap();
    assert_eq!(row_groups.len(), 10);
    assert_eq!(
        reader.matching_row_groups(&StatValue::Int(65)).await.unwrap(),
        vec![3]
    );

    server.clear_requests().await;
    let result = reader.query(StatValue::Int(65), None).await.unwrap();
    assert_eq!(keys(&result), vec![65]);
    assert_eq!(result.schema.fields().len(), 3);

    let ranges: Vec<ByteRange> = server
        .requests()
        .await
        .iter()
        .filter(|r| r.is_range_get())
        .map(|r| parse_range(r.range.as_deref().unwrap()))
        .collect();
    assert!(!ranges.is_empty());
    for range in ranges {
        assert!(
            row_groups[3].byte_range.contains(&range),
            "{range} outside row group 3 ({})",
            row_groups[3].byte_range
        );
    }

    server.clear_requests().await;
    let empty = reader.query(StatValue::Int(95), None).await.unwrap();
    assert_eq!(empty.num_rows(), 0);
    assert_eq!(server.range_request_count().await, 0);
}

#[tokio::test]
async fn test_projection_limits_columns() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    let columns = vec!["Score".to_string()];
    let result = reader
        .query(StatValue::Int(104), Some(&columns))
        .await
        .unwrap();
    assert_eq!(result.num_rows(), 1);
    assert_eq!(result.schema.fields().len(), 1);
    assert_eq!(result.schema.field(0).name(), "score");
    let score = result.batches[0].column(0).as_primitive::<Float64Type>();
    assert_eq!(score.value(0), (104 % 7) as f64);

    let unknown = vec!["nope".to_string()];
    assert!(matches!(
        reader.query(StatValue::Int(1), Some(&unknown)).await,
        Err(Error::Usage(_))
    ));
}

#[tokio::test]
async fn test_etag_change_within_ttl_refetches() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    assert_eq!(keys(&reader.query(StatValue::Int(65), None).await.unwrap()), vec![65]);
    let before = reader.identity().await.unwrap();
    assert_eq!(before.etag.as_deref(), Some("\"v1\""));

    server.set_content(fixture(1000), Some("\"v2\"")).await;
    server.clear_requests().await;

    let result = reader.query(StatValue::Int(65), None).await.unwrap();
    assert_eq!(result.num_rows(), 0);
    assert!(server.range_request_count().await > 0);

    let after = reader.identity().await.unwrap();
    assert_eq!(after.etag.as_deref(), Some("\"v2\""));
    assert_eq!(
        keys(&reader.query(StatValue::Int(1065), None).await.unwrap()),
        vec![1065]
    );
}

#[tokio::test]
async fn test_concurrent_initialize_fetches_footer_once() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = Arc::new(open(&server.url(), test_config(dir.path())));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let reader = reader.clone();
        _ = tasks.spawn(async move { reader.initialize().await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    // The whole fixture fits in the footer read-ahead.
    assert_eq!(server.range_request_count().await, 1);
    assert_eq!(reader.lifecycle(), Lifecycle::Ready);
}

#[tokio::test]
async fn test_fallback_when_ranges_unsupported() {
    let server = MockServer::start(fixture(0)).await;
    server.disable_ranges().await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    assert_eq!(keys(&reader.query(StatValue::Int(65), None).await.unwrap()), vec![65]);
    assert_eq!(keys(&reader.query(StatValue::Int(125), None).await.unwrap()), vec![125]);
    assert_eq!(server.full_request_count().await, 1);

    let stats = reader.reader_stats().await.unwrap();
    assert_eq!(stats.full_downloads, 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    reader.initialize().await.unwrap();
    reader.close().await;
    reader.close().await;
    assert_eq!(reader.lifecycle(), Lifecycle::Closed);
    assert!(matches!(
        reader.query(StatValue::Int(1), None).await,
        Err(Error::Usage(_))
    ));
    assert!(matches!(reader.initialize().await, Err(Error::Usage(_))));
}

#[tokio::test]
async fn test_sql_with_in_list_and_url_reference() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    let result = reader
        .execute_sql(
            "SELECT key, name FROM data WHERE key IN (5, 65) ORDER BY key",
            false,
        )
        .await
        .unwrap();
    assert_eq!(keys(&result), vec![5, 65]);
    assert_eq!(result.schema.fields().len(), 2);

    let sql = format!("SELECT key FROM '{}' WHERE key > 140 ORDER BY key", server.url());
    let result = reader.execute_sql(&sql, false).await.unwrap();
    assert_eq!(keys(&result), (141..=159).collect::<Vec<_>>());

    let result = reader
        .execute_sql("SELECT count(*) AS n FROM {url} WHERE name = 'beta'", false)
        .await
        .unwrap();
    let n = result.batches[0].column(0).as_primitive::<Int64Type>().value(0);
    assert_eq!(n, 40);
}

#[tokio::test]
async fn test_results_survive_in_cache_across_readers() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();

    let first = open(&server.url(), test_config(dir.path()));
    let expected = first.query(StatValue::Int(65), None).await.unwrap();
    let sql = "SELECT name, count(*) FROM data GROUP BY name ORDER BY name";
    let counted = first.execute_sql(sql, true).await.unwrap();
    first.close().await;

    server.clear_requests().await;
    let second = open(&server.url(), test_config(dir.path()));
    let cached = second.query(StatValue::Int(65), None).await.unwrap();
    assert_eq!(keys(&cached), keys(&expected));
    assert_eq!(cached.schema, expected.schema);
    let recounted = second.execute_sql(sql, true).await.unwrap();
    assert_eq!(recounted.batches, counted.batches);

    // Only identity probes reach the server.
    assert_eq!(server.range_request_count().await, 0);
    assert_eq!(server.full_request_count().await, 0);
}

#[tokio::test]
async fn test_zero_ttl_disables_cache() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ReaderConfig {
        cache_ttl: 0,
        ..test_config(dir.path())
    };
    let reader = open(&server.url(), config);

    assert!(reader.cache().is_none());
    assert_eq!(reader.query(StatValue::Int(3), None).await.unwrap().num_rows(), 1);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_configured_partition_column() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ReaderConfig {
        partition_column: Some("NAME".to_string()),
        ..test_config(dir.path())
    };
    let reader = open(&server.url(), config);

    assert_eq!(reader.partition_column().await.unwrap().as_deref(), Some("name"));
    let result = reader
        .query(StatValue::Utf8("gamma".to_string()), None)
        .await
        .unwrap();
    assert_eq!(result.num_rows(), 41);
    assert!(result.batches.iter().all(|b| {
        b.column(1)
            .as_string::<i32>()
            .iter()
            .all(|v| v == Some("gamma"))
    }));

    let missing = ReaderConfig {
        partition_column: Some("nope".to_string()),
        ..test_config(dir.path())
    };
    let reader = open(&server.url(), missing);
    assert!(matches!(reader.initialize().await, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_missing_resource_is_not_found() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.missing_url(), test_config(dir.path()));

    let err = reader.initialize().await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(reader.lifecycle(), Lifecycle::Uninitialized);
}

#[tokio::test]
async fn test_clear_cache_forces_refetch() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();

    let first = open(&server.url(), test_config(dir.path()));
    first.query(StatValue::Int(12), None).await.unwrap();
    first.clear_cache().await.unwrap();
    first.close().await;

    server.clear_requests().await;
    let second = open(&server.url(), test_config(dir.path()));
    assert_eq!(keys(&second.query(StatValue::Int(12), None).await.unwrap()), vec![12]);
    assert!(server.range_request_count().await > 0);
}

#[tokio::test]
async fn test_cancelled_initialize_leaves_reader_usable() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ReaderConfig {
        backoff_factor: 5.0,
        ..test_config(dir.path())
    };
    let reader = open(&server.url(), config);

    // The first HEAD fails; its retry then sleeps with the state lock held.
    server.fail_next(1).await;
    let cancelled = tokio::time::timeout(
        Duration::from_millis(200),
        reader.query(StatValue::Int(65), None),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(reader.lifecycle(), Lifecycle::Uninitialized);

    assert_eq!(keys(&reader.query(StatValue::Int(65), None).await.unwrap()), vec![65]);
    assert_eq!(reader.lifecycle(), Lifecycle::Ready);
}

#[tokio::test]
async fn test_aborted_query_releases_the_reader() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ReaderConfig {
        backoff_factor: 5.0,
        ..test_config(dir.path())
    };
    let reader = Arc::new(open(&server.url(), config));
    reader.initialize().await.unwrap();

    server.fail_next(1).await;
    let task = {
        let reader = reader.clone();
        tokio::spawn(async move { reader.query(StatValue::Int(125), None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(reader.lifecycle(), Lifecycle::Ready);

    assert_eq!(keys(&reader.query(StatValue::Int(125), None).await.unwrap()), vec![125]);
    reader.close().await;
    assert_eq!(reader.lifecycle(), Lifecycle::Closed);
}

#[tokio::test]
async fn test_close_releases_shared_transport() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let registry = Arc::new(ResourceRegistry::new());
    let open_shared = || {
        SmartParquetReader::builder(server.url())
            .config(config.clone())
            .registry(registry.clone())
            .build()
            .unwrap()
    };
    let first = open_shared();
    let second = open_shared();
    first.initialize().await.unwrap();
    second.initialize().await.unwrap();

    // A handle without a lease of its own.
    let transport = registry
        .transport(&server.url(), &config.transport_config())
        .unwrap();
    assert!(!registry.release(&server.url(), &transport));

    first.close().await;
    assert!(!transport.is_closed());
    assert_eq!(keys(&second.query(StatValue::Int(12), None).await.unwrap()), vec![12]);

    second.close().await;
    assert!(transport.is_closed());
    assert!(registry.live_urls().is_empty());
}

#[tokio::test]
async fn test_sql_comments_change_the_cached_result() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));
    let count = |result: &smartparquet::QueryResult| {
        result.batches[0].column(0).as_primitive::<Int64Type>().value(0)
    };

    let filtered = reader
        .execute_sql("SELECT count(*) AS n FROM data -- first group\nWHERE key < 10", true)
        .await
        .unwrap();
    assert_eq!(count(&filtered), 10);

    let unfiltered = reader
        .execute_sql("SELECT count(*) AS n FROM data -- first group WHERE key < 10", true)
        .await
        .unwrap();
    assert_eq!(count(&unfiltered), 121);

    let respaced = reader
        .execute_sql("select count(*) as n from data /* again */ where key < 10", true)
        .await
        .unwrap();
    assert_eq!(count(&respaced), 10);
}

#[tokio::test]
async fn test_sql_qualified_and_quoted_identifiers() {
    let server = MockServer::start(fixture(0)).await;
    let dir = tempfile::tempdir().unwrap();
    let reader = open(&server.url(), test_config(dir.path()));

    let result = reader
        .execute_sql("SELECT d.key FROM data AS d WHERE d.key = 65", false)
        .await
        .unwrap();
    assert_eq!(keys(&result), vec![65]);

    let result = reader
        .execute_sql("SELECT \"key\" FROM data WHERE data.KEY = 125", false)
        .await
        .unwrap();
    assert_eq!(keys(&result), vec![125]);

    assert!(reader
        .execute_sql("SELECT * FROM data WHERE \"KEY\" = 65", false)
        .await
        .is_err());
}
