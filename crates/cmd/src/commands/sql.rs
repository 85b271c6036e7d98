// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::{CliContext, format_result};
use anyhow::{Result, anyhow};
use diagnostics::*;
use smartparquet::extract_sql_url;

/// Run SQL against a remote file. The table is `data`, `{url}` or the
/// quoted URL itself; without `url` the quoted one in FROM is used.
pub async fn sql_command<F>(
    ctx: &CliContext,
    url: Option<&str>,
    sql: &str,
    cache_result: bool,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let url = match url {
        Some(url) => url.to_string(),
        None => extract_sql_url(sql)
            .ok_or_else(|| anyhow!("No URL given and none quoted in the FROM clause"))?,
    };
    debug!("sql_command called with url {url}: {sql}", url: url.as_str(), sql: sql);

    let reader = ctx.open_reader(&url)?;
    let result = reader.execute_sql(sql, cache_result).await;
    reader.close().await;
    let result = result.map_err(|e| anyhow!("SQL failed: {}", e))?;

    handler(&format_result(&result, ctx.format)?);
    Ok(())
}
