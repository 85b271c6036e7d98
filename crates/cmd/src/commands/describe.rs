// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::CliContext;
use anyhow::Result;
use diagnostics::*;
use smartparquet::{RowGroupStats, SmartParquetReader, StatValue};

/// Describe command - shows the identity, schema and row-group statistics
/// of a remote Parquet file. Only the footer is fetched.
pub async fn describe_command<F>(ctx: &CliContext, url: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    debug!("describe_command called with url {url}", url: url);

    let reader = ctx.open_reader(url)?;
    let result = describe_impl(&reader).await;
    reader.close().await;
    handler(&result?);
    Ok(())
}

async fn describe_impl(reader: &SmartParquetReader) -> Result<String> {
    let identity = reader.identity().await?;
    let schema = reader.schema().await?;
    let partition = reader.partition_column().await?;
    let row_groups = reader.row_groups().await?;
    let total_rows: u64 = row_groups.iter().map(|rg| rg.row_count).sum();

    let mut lines = vec![
        format!("URL: {}", identity.url),
        format!("Size: {} bytes", identity.size),
        format!("Validator: {}", identity.validator()),
        format!(
            "Ranges: {}",
            if identity.accepts_ranges { "supported" } else { "not advertised" }
        ),
        format!("Rows: {total_rows}"),
        format!("Row groups: {}", row_groups.len()),
        format!(
            "Partition column: {}",
            partition.as_deref().unwrap_or("(none)")
        ),
        "Schema:".to_string(),
    ];
    for field in schema.fields() {
        lines.push(format!(
            "  {}: {}{}",
            field.name(),
            field.data_type(),
            if field.is_nullable() { " (nullable)" } else { "" }
        ));
    }
    for rg in &row_groups {
        lines.push(describe_row_group(rg, partition.as_deref()));
    }
    Ok(lines.join("\n"))
}

fn describe_row_group(rg: &RowGroupStats, partition: Option<&str>) -> String {
    let mut line = format!(
        "  row group {}: {} rows, bytes {}",
        rg.index, rg.row_count, rg.byte_range
    );
    if let Some(column) = partition {
        if let Some(bounds) = rg.bounds(column) {
            line.push_str(&format!(
                ", {} [{}, {}]",
                column,
                show_bound(bounds.min.as_ref()),
                show_bound(bounds.max.as_ref())
            ));
        }
    }
    line
}

fn show_bound(value: Option<&StatValue>) -> String {
    value.map_or_else(|| "?".to_string(), ToString::to_string)
}
