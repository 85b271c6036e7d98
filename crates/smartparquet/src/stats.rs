// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per row-group statistics derived from the Parquet footer

use parquet::basic::{ColumnOrder, ConvertedType, LogicalType, SortOrder, Type as PhysicalType};
use parquet::file::metadata::{ParquetMetaData, RowGroupMetaData};
use parquet::file::statistics::Statistics;
use parquet::schema::types::ColumnDescriptor;
use rangefs::ByteRange;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A typed statistics bound or predicate literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StatValue {
    Boolean(bool),
    Int(i64),
    Float(f64),
    Utf8(String),
}

impl StatValue {
    /// Ordering between two values, `None` when they are not comparable.
    /// Integers and floats compare exactly, without rounding the integer.
    #[must_use]
    pub fn compare(&self, other: &StatValue) -> Option<Ordering> {
        match (self, other) {
            (StatValue::Boolean(a), StatValue::Boolean(b)) => Some(a.cmp(b)),
            (StatValue::Int(a), StatValue::Int(b)) => Some(a.cmp(b)),
            (StatValue::Float(a), StatValue::Float(b)) => a.partial_cmp(b),
            (StatValue::Int(a), StatValue::Float(b)) => compare_int_float(*a, *b),
            (StatValue::Float(a), StatValue::Int(b)) => {
                compare_int_float(*b, *a).map(Ordering::reverse)
            }
            (StatValue::Utf8(a), StatValue::Utf8(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }

    /// Render for fingerprints and logs.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            StatValue::Boolean(b) => format!("bool:{b}"),
            StatValue::Int(i) => format!("int:{i}"),
            StatValue::Float(f) => format!("float:{f:?}"),
            StatValue::Utf8(s) => format!("utf8:{s}"),
        }
    }
}

impl std::fmt::Display for StatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatValue::Boolean(b) => write!(f, "{b}"),
            StatValue::Int(i) => write!(f, "{i}"),
            StatValue::Float(v) => write!(f, "{v}"),
            StatValue::Utf8(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for StatValue {
    fn from(value: i64) -> Self {
        StatValue::Int(value)
    }
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        StatValue::Float(value)
    }
}

impl From<bool> for StatValue {
    fn from(value: bool) -> Self {
        StatValue::Boolean(value)
    }
}

impl From<&str> for StatValue {
    fn from(value: &str) -> Self {
        StatValue::Utf8(value.to_string())
    }
}

impl From<String> for StatValue {
    fn from(value: String) -> Self {
        StatValue::Utf8(value)
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn compare_int_float(i: i64, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f >= TWO_POW_63 {
        return Some(Ordering::Less);
    }
    if f < -TWO_POW_63 {
        return Some(Ordering::Greater);
    }
    let whole = f.trunc();
    // In range, so the cast is exact.
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(f - whole)),
        other => Some(other),
    }
}

/// Min/max for one column chunk. A missing bound means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub null_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGroupStats {
    pub index: usize,
    /// Span of the file covered by all of the group's column chunks
    pub byte_range: ByteRange,
    pub row_count: u64,
    /// Statted top-level columns only
    pub columns: BTreeMap<String, ColumnBounds>,
}

impl RowGroupStats {
    #[must_use]
    pub fn bounds(&self, column: &str) -> Option<&ColumnBounds> {
        self.columns.get(column)
    }
}

/// Row-group statistics for one version of a remote file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsIndex {
    /// Validator of the resource version the index was built from
    pub validator: String,
    pub num_rows: u64,
    /// Top-level column names in schema order
    pub columns: Vec<String>,
    pub row_groups: Vec<RowGroupStats>,
    pub partition_column: Option<String>,
}

impl StatisticsIndex {
    /// Extract statistics from decoded footer metadata.
    #[must_use]
    pub fn from_metadata(metadata: &ParquetMetaData, validator: &str) -> Self {
        let schema = metadata.file_metadata().schema_descr();
        let columns = schema
            .root_schema()
            .get_fields()
            .iter()
            .map(|f| f.name().to_string())
            .collect();

        let column_orders: Vec<ColumnOrder> = (0..schema.num_columns())
            .map(|i| metadata.file_metadata().column_order(i))
            .collect();

        let row_groups = metadata
            .row_groups()
            .iter()
            .enumerate()
            .map(|(index, rg)| row_group_stats(index, rg, &column_orders))
            .collect();

        Self {
            validator: validator.to_string(),
            num_rows: u64::try_from(metadata.file_metadata().num_rows()).unwrap_or(0),
            columns,
            row_groups,
            partition_column: None,
        }
    }

    #[must_use]
    pub fn row_group_count(&self) -> usize {
        self.row_groups.len()
    }

    /// Columns with statistics in at least one row group
    #[must_use]
    pub fn statted_columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .row_groups
            .iter()
            .flat_map(|rg| rg.columns.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Schema column matching `name`, ignoring ASCII case when there is no
    /// exact match.
    #[must_use]
    pub fn resolve_column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.as_str() == name)
            .or_else(|| self.columns.iter().find(|c| c.eq_ignore_ascii_case(name)))
            .map(String::as_str)
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn row_group_stats(index: usize, rg: &RowGroupMetaData, orders: &[ColumnOrder]) -> RowGroupStats {
    let mut start = u64::MAX;
    let mut end = 0u64;
    let mut columns = BTreeMap::new();

    for (i, chunk) in rg.columns().iter().enumerate() {
        let (offset, length) = chunk.byte_range();
        start = start.min(offset);
        end = end.max(offset + length);

        let descr = chunk.column_descr();
        if descr.path().parts().len() != 1 {
            continue;
        }
        let order = orders.get(i).copied().unwrap_or(ColumnOrder::UNDEFINED);
        let Some(stats) = chunk.statistics() else {
            continue;
        };
        let (min, max) = bounds(stat_kind(descr, order), stats);
        if min.is_none() && max.is_none() {
            continue;
        }
        _ = columns.insert(
            descr.name().to_string(),
            ColumnBounds {
                min,
                max,
                null_count: stats.null_count_opt(),
            },
        );
    }

    if start == u64::MAX {
        start = 0;
    }
    RowGroupStats {
        index,
        byte_range: ByteRange::from_bounds(start, end),
        row_count: u64::try_from(rg.num_rows()).unwrap_or(0),
        columns,
    }
}

/// How raw statistics of a column are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatKind {
    Bool,
    Signed,
    Unsigned,
    Float,
    Utf8,
    /// Decimals, dates, times, timestamps and binary: literals from SQL
    /// cannot be compared against the raw physical values.
    Unsupported,
}

fn stat_kind(descr: &ColumnDescriptor, order: ColumnOrder) -> StatKind {
    let logical = match descr.logical_type() {
        Some(LogicalType::Integer { is_signed, .. }) => Some(if is_signed {
            StatKind::Signed
        } else {
            StatKind::Unsigned
        }),
        Some(LogicalType::String | LogicalType::Enum | LogicalType::Json) => Some(StatKind::Utf8),
        Some(_) => return StatKind::Unsupported,
        None => None,
    };

    let kind = logical.unwrap_or(match descr.converted_type() {
        ConvertedType::UINT_8
        | ConvertedType::UINT_16
        | ConvertedType::UINT_32
        | ConvertedType::UINT_64 => StatKind::Unsigned,
        ConvertedType::UTF8 | ConvertedType::ENUM | ConvertedType::JSON => StatKind::Utf8,
        ConvertedType::NONE
        | ConvertedType::INT_8
        | ConvertedType::INT_16
        | ConvertedType::INT_32
        | ConvertedType::INT_64 => match descr.physical_type() {
            PhysicalType::BOOLEAN => StatKind::Bool,
            PhysicalType::INT32 | PhysicalType::INT64 => StatKind::Signed,
            PhysicalType::FLOAT | PhysicalType::DOUBLE => StatKind::Float,
            _ => StatKind::Unsupported,
        },
        _ => StatKind::Unsupported,
    });

    // Legacy files without a column order wrote signed min/max for
    // unsigned and string columns.
    match kind {
        StatKind::Unsigned | StatKind::Utf8
            if !matches!(
                order,
                ColumnOrder::TYPE_DEFINED_ORDER(SortOrder::UNSIGNED)
            ) =>
        {
            StatKind::Unsupported
        }
        other => other,
    }
}

fn float_bound(value: f64) -> Option<StatValue> {
    (!value.is_nan()).then_some(StatValue::Float(value))
}

fn bounds(kind: StatKind, stats: &Statistics) -> (Option<StatValue>, Option<StatValue>) {
    match (kind, stats) {
        (StatKind::Bool, Statistics::Boolean(s)) => (
            s.min_opt().map(|v| StatValue::Boolean(*v)),
            s.max_opt().map(|v| StatValue::Boolean(*v)),
        ),
        (StatKind::Signed, Statistics::Int32(s)) => (
            s.min_opt().map(|v| StatValue::Int(i64::from(*v))),
            s.max_opt().map(|v| StatValue::Int(i64::from(*v))),
        ),
        (StatKind::Unsigned, Statistics::Int32(s)) => (
            s.min_opt().map(|v| StatValue::Int(i64::from(*v as u32))),
            s.max_opt().map(|v| StatValue::Int(i64::from(*v as u32))),
        ),
        (StatKind::Signed, Statistics::Int64(s)) => (
            s.min_opt().map(|v| StatValue::Int(*v)),
            s.max_opt().map(|v| StatValue::Int(*v)),
        ),
        (StatKind::Unsigned, Statistics::Int64(s)) => (
            s.min_opt()
                .and_then(|v| i64::try_from(*v as u64).ok())
                .map(StatValue::Int),
            s.max_opt()
                .and_then(|v| i64::try_from(*v as u64).ok())
                .map(StatValue::Int),
        ),
        (StatKind::Float, Statistics::Float(s)) => (
            s.min_opt().and_then(|v| float_bound(f64::from(*v))),
            s.max_opt().and_then(|v| float_bound(f64::from(*v))),
        ),
        (StatKind::Float, Statistics::Double(s)) => (
            s.min_opt().and_then(|v| float_bound(*v)),
            s.max_opt().and_then(|v| float_bound(*v)),
        ),
        (StatKind::Utf8, Statistics::ByteArray(s)) => (
            s.min_opt()
                .and_then(|v| std::str::from_utf8(v.data()).ok())
                .map(|v| StatValue::Utf8(v.to_string())),
            s.max_opt()
                .and_then(|v| std::str::from_utf8(v.data()).ok())
                .map(|v| StatValue::Utf8(v.to_string())),
        ),
        _ => (None, None),
    }
}

/// Pick the column whose row-group intervals never overlap, so that an
/// equality lookup touches a single group.
///
/// Columns that callers have used in equality predicates (`observed`, with
/// use counts) break ties. `None` when no single column stands out.
#[must_use]
pub fn detect_partition_column(
    index: &StatisticsIndex,
    observed: &BTreeMap<String, usize>,
) -> Option<String> {
    if index.row_groups.is_empty() {
        return None;
    }

    let candidates: Vec<String> = index
        .statted_columns()
        .into_iter()
        .filter(|column| is_non_overlapping(index, column))
        .collect();

    match candidates.len() {
        0 => None,
        1 => candidates.into_iter().next(),
        _ => {
            let uses = |c: &String| {
                observed
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case(c))
                    .map(|(_, n)| *n)
                    .sum::<usize>()
            };
            let best = candidates.iter().map(uses).max().unwrap_or(0);
            if best == 0 {
                return None;
            }
            let mut winners = candidates.iter().filter(|c| uses(c) == best);
            match (winners.next(), winners.next()) {
                (Some(winner), None) => Some(winner.clone()),
                _ => None,
            }
        }
    }
}

fn is_non_overlapping(index: &StatisticsIndex, column: &str) -> bool {
    let mut intervals = Vec::with_capacity(index.row_groups.len());
    for rg in &index.row_groups {
        if rg.row_count == 0 {
            continue;
        }
        match rg.bounds(column) {
            Some(ColumnBounds {
                min: Some(min),
                max: Some(max),
                ..
            }) => intervals.push((min, max)),
            _ => return false,
        }
    }

    let mut sorted = Vec::with_capacity(intervals.len());
    for (min, max) in intervals {
        if min.compare(max).is_none() {
            return false;
        }
        sorted.push((min, max));
    }
    let mut failed = false;
    sorted.sort_by(|a, b| {
        a.0.compare(b.0).unwrap_or_else(|| {
            failed = true;
            Ordering::Equal
        })
    });
    if failed {
        return false;
    }
    sorted
        .windows(2)
        .all(|pair| pair[0].1.compare(pair[1].0) == Some(Ordering::Less))
}
