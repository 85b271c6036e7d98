// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Turning fetched column chunks into Arrow record batches
//!
//! Only the byte ranges of the selected row groups' projected column chunks
//! are downloaded. [`SparseFile`] presents those pieces to the Parquet
//! reader at their original file offsets; reading anywhere else fails.

use crate::error::{Error, Result};
use crate::stats::StatValue;
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray};
use arrow::compute::kernels::cmp::eq;
use arrow::compute::{cast, filter_record_batch};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
};
use parquet::errors::ParquetError;
use parquet::file::metadata::ParquetMetaData;
use parquet::file::reader::{ChunkReader, Length};
use rangefs::ByteRange;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Column chunks closer than this are fetched as one range
pub const COALESCE_GAP: u64 = 64 * 1024;

/// Rows per decoded batch
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Downloaded pieces of a remote file, addressed by file offset
#[derive(Debug, Clone, Default)]
pub struct SparseFile {
    len: u64,
    pieces: BTreeMap<u64, Bytes>,
}

impl SparseFile {
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            len,
            pieces: BTreeMap::new(),
        }
    }

    /// Pair each range with the bytes fetched for it.
    #[must_use]
    pub fn from_ranges(len: u64, ranges: &[ByteRange], data: Vec<Bytes>) -> Self {
        let mut file = Self::new(len);
        for (range, bytes) in ranges.iter().zip(data) {
            file.insert(range.offset, bytes);
        }
        file
    }

    pub fn insert(&mut self, offset: u64, bytes: Bytes) {
        _ = self.pieces.insert(offset, bytes);
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Bytes held in memory
    #[must_use]
    pub fn loaded_bytes(&self) -> u64 {
        self.pieces.values().map(|b| b.len() as u64).sum()
    }

    fn locate(&self, start: u64) -> Option<(u64, &Bytes)> {
        self.pieces
            .range(..=start)
            .next_back()
            .filter(|(offset, bytes)| start <= **offset + bytes.len() as u64)
            .map(|(offset, bytes)| (*offset, bytes))
    }

    fn slice(&self, start: u64, length: usize) -> Option<Bytes> {
        let (offset, bytes) = self.locate(start)?;
        let begin = usize::try_from(start - offset).ok()?;
        let end = begin.checked_add(length)?;
        (end <= bytes.len()).then(|| bytes.slice(begin..end))
    }
}

impl Length for SparseFile {
    fn len(&self) -> u64 {
        self.len
    }
}

impl ChunkReader for SparseFile {
    type T = bytes::buf::Reader<Bytes>;

    fn get_read(&self, start: u64) -> parquet::errors::Result<Self::T> {
        let (offset, bytes) = self.locate(start).ok_or_else(|| {
            ParquetError::General(format!("offset {start} was not fetched"))
        })?;
        Ok(bytes.slice((start - offset) as usize..).reader())
    }

    fn get_bytes(&self, start: u64, length: usize) -> parquet::errors::Result<Bytes> {
        self.slice(start, length).ok_or_else(|| {
            ParquetError::General(format!(
                "range {start}..{} was not fetched",
                start + length as u64
            ))
        })
    }
}

/// Everything needed to decode a subset of a Parquet file
#[derive(Debug, Clone)]
pub struct FetchedRowGroups {
    pub metadata: Arc<ParquetMetaData>,
    /// Ascending row-group indices
    pub row_groups: Vec<usize>,
    /// Top-level column indices to decode
    pub projection: Vec<usize>,
    pub file: SparseFile,
}

/// Byte ranges holding the projected column chunks of `row_groups`,
/// sorted and coalesced.
#[must_use]
pub fn plan_ranges(
    metadata: &ParquetMetaData,
    row_groups: &[usize],
    projection: &[usize],
) -> Vec<ByteRange> {
    let schema = metadata.file_metadata().schema_descr();
    let mut ranges = Vec::new();
    for &rg in row_groups {
        let Some(row_group) = metadata.row_groups().get(rg) else {
            continue;
        };
        for (leaf, chunk) in row_group.columns().iter().enumerate() {
            if projection.contains(&schema.get_column_root_idx(leaf)) {
                let (offset, length) = chunk.byte_range();
                ranges.push(ByteRange::new(offset, length));
            }
        }
    }
    ByteRange::coalesce(ranges, COALESCE_GAP)
}

/// Decodes fetched row groups into record batches
#[async_trait]
pub trait Materializer: Send + Sync + std::fmt::Debug {
    async fn materialize(&self, fetched: FetchedRowGroups) -> Result<QueryResult>;
}

/// The default [`Materializer`], backed by the `parquet` Arrow reader
#[derive(Debug, Clone)]
pub struct ParquetMaterializer {
    pub batch_size: usize,
}

impl Default for ParquetMaterializer {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[async_trait]
impl Materializer for ParquetMaterializer {
    async fn materialize(&self, fetched: FetchedRowGroups) -> Result<QueryResult> {
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || decode(fetched, batch_size))
            .await
            .map_err(|e| Error::decode(format!("decode task failed: {e}")))?
    }
}

/// Decode synchronously.
pub fn decode(fetched: FetchedRowGroups, batch_size: usize) -> Result<QueryResult> {
    let arrow_metadata =
        ArrowReaderMetadata::try_new(Arc::clone(&fetched.metadata), ArrowReaderOptions::new())?;
    let mask = ProjectionMask::roots(
        fetched.metadata.file_metadata().schema_descr(),
        fetched.projection.iter().copied(),
    );

    let reader = ParquetRecordBatchReaderBuilder::new_with_metadata(fetched.file, arrow_metadata)
        .with_projection(mask)
        .with_row_groups(fetched.row_groups)
        .with_batch_size(batch_size.max(1))
        .build()?;

    let schema = reader.schema();
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(QueryResult { schema, batches })
}

/// Rows returned by a query, with their schema
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl QueryResult {
    #[must_use]
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Keep the rows whose `column` equals `value`. Empty batches are dropped.
    pub fn filter_equal(self, column: &str, value: &StatValue) -> Result<Self> {
        let index = self.schema.index_of(column)?;
        let mut batches = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            let mask = equality_mask(batch.column(index), value)?;
            let filtered = filter_record_batch(batch, &mask)?;
            if filtered.num_rows() > 0 {
                batches.push(filtered);
            }
        }
        Ok(Self {
            schema: self.schema,
            batches,
        })
    }

    /// Restrict to `columns`, in the given order.
    pub fn project(self, columns: &[String]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|c| self.schema.index_of(c))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let schema = Arc::new(self.schema.project(&indices)?);
        let batches = self
            .batches
            .iter()
            .map(|b| b.project(&indices))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { schema, batches })
    }

    /// Encode as an Arrow IPC stream.
    pub fn to_ipc(&self) -> Result<Bytes> {
        let mut buffer = Vec::new();
        let mut writer = StreamWriter::try_new(&mut buffer, self.schema.as_ref())?;
        for batch in &self.batches {
            writer.write(batch)?;
        }
        writer.finish()?;
        drop(writer);
        Ok(Bytes::from(buffer))
    }

    pub fn from_ipc(data: &[u8]) -> Result<Self> {
        let reader = StreamReader::try_new(std::io::Cursor::new(data), None)?;
        let schema = reader.schema();
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { schema, batches })
    }
}

fn literal_array(value: &StatValue) -> ArrayRef {
    match value {
        StatValue::Boolean(b) => Arc::new(BooleanArray::from(vec![*b])),
        StatValue::Int(i) => Arc::new(Int64Array::from(vec![*i])),
        StatValue::Float(f) => Arc::new(Float64Array::from(vec![*f])),
        StatValue::Utf8(s) => Arc::new(StringArray::from(vec![s.as_str()])),
    }
}

/// Rows of `column` equal to `value`. Values that cannot be cast compare
/// as null, so they never match.
fn equality_mask(column: &ArrayRef, value: &StatValue) -> Result<BooleanArray> {
    let literal = literal_array(value);
    let target = match value {
        StatValue::Int(_) if column.data_type().is_floating() => DataType::Float64,
        _ => literal.data_type().clone(),
    };
    let lhs = cast(column, &target)?;
    let rhs = cast(&literal, &target)?;
    Ok(eq(&lhs, &Scalar::new(rhs))?)
}
