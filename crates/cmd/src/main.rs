// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cmd::commands;
use cmd::common::{CliContext, ConfigOverrides, OutputFormat, parse_columns};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "hcfs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Cache directory (default: $HTTPCACHEFS_CACHE_DIR or the system temp dir)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Cache TTL in seconds; 0 disables caching
    #[arg(long, global = true)]
    ttl: Option<u64>,
    /// Column used for partition lookups
    #[arg(short, long, global = true)]
    partition_column: Option<String>,
    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, schema and row-group statistics of a remote file
    Describe {
        url: String,
    },
    /// Fetch rows whose partition column equals a value
    Query {
        url: String,
        /// SQL literal: 42, 1.5, true, 'text'
        value: String,
        /// Comma separated columns to return
        #[arg(short, long)]
        columns: Option<String>,
    },
    /// Run SQL; the table is `data`, `{url}` or the quoted URL
    Sql {
        /// Remote file; taken from FROM '<url>' when omitted
        #[arg(short, long)]
        url: Option<String>,
        sql: String,
        /// Cache the result keyed by the normalized statement
        #[arg(long)]
        cache_result: bool,
    },
    /// Remove cached entries for a URL, or everything
    ClearCache {
        url: Option<String>,
    },
}

#[allow(clippy::print_stdout)]
fn print_output(output: &str) {
    println!("{output}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        config: cli.config,
        cache_dir: cli.cache_dir,
        ttl: cli.ttl,
        partition_column: cli.partition_column,
        debug: cli.debug,
    };
    let ctx = CliContext::new(&overrides, cli.format)?;
    diagnostics::init_with_debug(ctx.config.debug);

    match cli.command {
        Commands::Describe { url } => commands::describe_command(&ctx, &url, print_output).await,
        Commands::Query {
            url,
            value,
            columns,
        } => {
            let columns = columns.as_deref().map(parse_columns);
            commands::query_command(&ctx, &url, &value, columns, print_output).await
        }
        Commands::Sql {
            url,
            sql,
            cache_result,
        } => commands::sql_command(&ctx, url.as_deref(), &sql, cache_result, print_output).await,
        Commands::ClearCache { url } => {
            commands::clear_cache_command(&ctx, url.as_deref(), print_output).await
        }
    }
}
