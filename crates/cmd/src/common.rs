// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Result, anyhow};
use arrow_csv::WriterBuilder;
use clap::ValueEnum;
use smartparquet::{QueryResult, ReaderConfig, ResourceRegistry, SmartParquetReader, load_config};
use std::path::PathBuf;
use std::sync::Arc;

/// How query results are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Csv,
    Count,
}

/// Settings given on the command line, applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub ttl: Option<u64>,
    pub partition_column: Option<String>,
    pub debug: bool,
}

/// Everything a command needs to open readers
#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: ReaderConfig,
    pub format: OutputFormat,
    registry: Arc<ResourceRegistry>,
}

impl CliContext {
    pub fn new(overrides: &ConfigOverrides, format: OutputFormat) -> Result<Self> {
        let mut config = match &overrides.config {
            Some(path) => load_config(path)
                .map_err(|e| anyhow!("Failed to load config {}: {}", path.display(), e))?,
            None => ReaderConfig::default(),
        };
        if let Some(dir) = &overrides.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(ttl) = overrides.ttl {
            config.cache_ttl = ttl;
        }
        if let Some(column) = &overrides.partition_column {
            config.partition_column = Some(column.clone());
        }
        config.debug |= overrides.debug;
        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

        Ok(Self {
            config,
            format,
            registry: Arc::new(ResourceRegistry::new()),
        })
    }

    pub fn with_config(config: ReaderConfig, format: OutputFormat) -> Self {
        Self {
            config,
            format,
            registry: Arc::new(ResourceRegistry::new()),
        }
    }

    pub fn open_reader(&self, url: &str) -> Result<SmartParquetReader> {
        SmartParquetReader::builder(url)
            .config(self.config.clone())
            .registry(Arc::clone(&self.registry))
            .build()
            .map_err(|e| anyhow!("Failed to open {}: {}", url, e))
    }
}

/// Render `result` in `format`.
pub fn format_result(result: &QueryResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => {
            if result.is_empty() {
                return Ok("No results found.".to_string());
            }
            let formatted = arrow::util::pretty::pretty_format_batches(&result.batches)
                .map_err(|e| anyhow!("Failed to format results as table: {}", e))?;
            Ok(formatted.to_string())
        }
        OutputFormat::Csv => {
            let mut buffer = Vec::new();
            {
                let mut writer = WriterBuilder::new().with_header(true).build(&mut buffer);
                for batch in &result.batches {
                    writer
                        .write(batch)
                        .map_err(|e| anyhow!("Failed to write CSV: {}", e))?;
                }
            }
            let text = String::from_utf8(buffer).map_err(|e| anyhow!("CSV output is not UTF-8: {}", e))?;
            Ok(text.trim_end().to_string())
        }
        OutputFormat::Count => Ok(result.num_rows().to_string()),
    }
}

/// Comma separated column list, ignoring blanks.
pub fn parse_columns(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
