// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Cache keys for query results
//!
//! Both fingerprints start with the resource validator, so a new version of
//! the remote file never hits results computed from an older one. Every
//! variable part is hashed with its length in front, so no choice of names
//! or values can make two different inputs run together.

use crate::engine::tokenize;
use crate::stats::StatValue;
use datafusion::sql::sqlparser::tokenizer::Token;
use sha2::{Digest, Sha256};

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Key of a partition lookup result.
#[must_use]
pub fn query_fingerprint(
    validator: &str,
    column: &str,
    value: &StatValue,
    columns: Option<&[String]>,
) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, validator.as_bytes());
    update_field(&mut hasher, b"query");
    update_field(&mut hasher, column.as_bytes());
    update_field(&mut hasher, value.canonical().as_bytes());
    match columns {
        Some(columns) => {
            hasher.update((columns.len() as u64).to_le_bytes());
            for name in columns {
                update_field(&mut hasher, name.as_bytes());
            }
        }
        None => hasher.update(u64::MAX.to_le_bytes()),
    }
    format!("{:x}", hasher.finalize())
}

/// Key of a SQL result. Statements differing only in whitespace, comments
/// or the case of unquoted words share a key.
#[must_use]
pub fn sql_fingerprint(validator: &str, sql: &str) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, validator.as_bytes());
    update_field(&mut hasher, b"sql");
    update_field(&mut hasher, normalize_sql(sql).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The statement's tokens joined by single spaces, without comments or a
/// trailing `;`, with unquoted words lowercased. Text that does not
/// tokenize is only trimmed.
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    let Some(tokens) = tokenize(sql) else {
        return sql.trim().to_string();
    };
    let mut significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();
    while matches!(significant.last(), Some(Token::SemiColon)) {
        _ = significant.pop();
    }
    significant
        .into_iter()
        .map(|token| match token {
            Token::Word(w) if w.quote_style.is_none() => w.value.to_lowercase(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
