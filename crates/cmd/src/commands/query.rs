// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::{CliContext, format_result};
use anyhow::{Result, anyhow};
use diagnostics::*;
use smartparquet::{StatValue, parse_literal};

/// Look up rows whose partition column equals `value`.
///
/// The value is read as a SQL literal (`42`, `1.5`, `true`, `'text'`);
/// anything else is taken as a bare string.
pub async fn query_command<F>(
    ctx: &CliContext,
    url: &str,
    value: &str,
    columns: Option<Vec<String>>,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let value = parse_literal(value).unwrap_or_else(|| StatValue::Utf8(value.to_string()));
    debug!("query_command called with url {url}, value {value}", url: url, value: value.to_string());

    let reader = ctx.open_reader(url)?;
    let result = reader.query(value, columns.as_deref()).await;
    reader.close().await;
    let result = result.map_err(|e| anyhow!("Query failed: {}", e))?;

    handler(&format_result(&result, ctx.format)?);
    Ok(())
}
