// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::common::CliContext;
use anyhow::{Result, anyhow};
use rangefs::{CacheStore, ClearScope};

/// Remove cached entries for one URL, or the whole cache directory.
pub async fn clear_cache_command<F>(ctx: &CliContext, url: Option<&str>, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let store = CacheStore::new(ctx.config.cache_dir.clone());
    match url {
        Some(url) => {
            store
                .resource(url)
                .clear(ClearScope::Resource)
                .await
                .map_err(|e| anyhow!("Failed to clear cache for {}: {}", url, e))?;
            handler(&format!("Cleared cache for {url}"));
        }
        None => {
            store
                .clear_all()
                .await
                .map_err(|e| anyhow!("Failed to clear cache: {}", e))?;
            handler(&format!("Cleared cache at {}", store.root().display()));
        }
    }
    Ok(())
}
