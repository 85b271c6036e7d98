// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! SQL execution over the fetched subset of a file

use crate::decode::QueryResult;
use crate::error::Result;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::execution::context::SessionContext;
use datafusion::sql::TableReference;
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::keywords::Keyword;
use datafusion::sql::sqlparser::tokenizer::{Token, Tokenizer};
use diagnostics::*;
use std::sync::Arc;

/// Name under which the fetched rows are visible to SQL
pub const TABLE_NAME: &str = "data";

/// Runs SQL against an in-memory table
#[async_trait]
pub trait SqlEngine: Send + Sync + std::fmt::Debug {
    async fn execute(&self, table: &str, input: QueryResult, sql: &str) -> Result<QueryResult>;
}

/// The default [`SqlEngine`], a fresh DataFusion session per statement
#[derive(Debug, Clone, Default)]
pub struct DataFusionEngine;

#[async_trait]
impl SqlEngine for DataFusionEngine {
    async fn execute(&self, table: &str, input: QueryResult, sql: &str) -> Result<QueryResult> {
        let ctx = SessionContext::new();
        let provider = MemTable::try_new(input.schema, vec![input.batches])?;
        _ = ctx.register_table(TableReference::bare(table), Arc::new(provider))?;

        debug!("executing SQL against {table}: {sql}", table: table, sql: sql);
        let df = ctx.sql(sql).await?;
        let schema = Arc::clone(df.schema().inner());
        let batches = df.collect().await?;
        Ok(QueryResult::new(schema, batches))
    }
}

/// Tokens of `sql` as written. Quoted text keeps its escapes, so every
/// token displays back to its source text. `None` when `sql` does not
/// tokenize, e.g. on an unterminated quote.
pub(crate) fn tokenize(sql: &str) -> Option<Vec<Token>> {
    Tokenizer::new(&GenericDialect {}, sql)
        .with_unescape(false)
        .tokenize()
        .ok()
}

fn is_from(token: &Token) -> bool {
    matches!(token, Token::Word(w) if w.keyword == Keyword::FROM && w.quote_style.is_none())
}

/// Token span `[start, end)` of a `'<url>'` or `{url}` table reference
/// following the FROM at `from`. Whitespace and comments in between are
/// skipped.
fn table_reference(tokens: &[Token], from: usize) -> Option<(usize, usize)> {
    let start = (from + 1..tokens.len()).find(|&i| !matches!(tokens[i], Token::Whitespace(_)))?;
    match &tokens[start..] {
        [Token::SingleQuotedString(_), ..] => Some((start, start + 1)),
        [Token::LBrace, Token::Word(w), Token::RBrace, ..]
            if w.quote_style.is_none() && w.value.eq_ignore_ascii_case("url") =>
        {
            Some((start, start + 3))
        }
        _ => None,
    }
}

/// Replace `FROM '<url>'` and `FROM {url}` with the registered table name.
/// String literals and comments are left alone.
#[must_use]
pub fn rewrite_table_reference(sql: &str) -> String {
    let Some(tokens) = tokenize(sql) else {
        return sql.to_string();
    };
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < tokens.len() {
        out.push_str(&tokens[i].to_string());
        if is_from(&tokens[i]) {
            if let Some((start, end)) = table_reference(&tokens, i) {
                for token in &tokens[i + 1..start] {
                    out.push_str(&token.to_string());
                }
                out.push_str(TABLE_NAME);
                i = end;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// URL quoted in the FROM clause, if any.
#[must_use]
pub fn extract_sql_url(sql: &str) -> Option<String> {
    let tokens = tokenize(sql)?;
    tokens
        .iter()
        .enumerate()
        .filter(|(_, token)| is_from(token))
        .filter_map(|(i, _)| table_reference(&tokens, i))
        .find_map(|(start, _)| match &tokens[start] {
            Token::SingleQuotedString(url)
                if url.starts_with("http://") || url.starts_with("https://") =>
            {
                Some(url.clone())
            }
            _ => None,
        })
}
