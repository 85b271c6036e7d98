// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Predicates usable for row-group pruning, and their extraction from SQL
//!
//! Only what can be checked against min/max statistics is kept: equality,
//! IN lists, range comparisons and BETWEEN on plain columns, and OR of such
//! comparisons on a single column. Anything else is dropped, which widens
//! the selection and never narrows it.

use crate::stats::StatValue;
use crate::engine::TABLE_NAME;
use datafusion::sql::sqlparser::ast::{
    BinaryOperator, Expr, Ident, Query, SelectItem, SetExpr, Statement, TableFactor,
    UnaryOperator, Visit, Visitor,
};
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::parser::Parser;
use diagnostics::*;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;

/// Restriction on the values of one column
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Eq(StatValue),
    In(Vec<StatValue>),
    /// Bounds with their inclusiveness; `None` is unbounded
    Range {
        lower: Option<(StatValue, bool)>,
        upper: Option<(StatValue, bool)>,
    },
    /// Satisfied when any member is
    AnyOf(Vec<Constraint>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    pub column: String,
    pub constraint: Constraint,
}

/// What a query requires of the rows it reads
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Predicate {
    /// No usable restriction
    #[default]
    All,
    /// Every member must hold
    Conjunction(Vec<ColumnPredicate>),
}

impl Predicate {
    /// `column = value`
    pub fn equality(column: impl Into<String>, value: impl Into<StatValue>) -> Self {
        Predicate::Conjunction(vec![ColumnPredicate {
            column: column.into(),
            constraint: Constraint::Eq(value.into()),
        }])
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Conjunction(parts) => parts.is_empty(),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Eq(v) => write!(f, "= {v}"),
            Constraint::In(vs) => {
                let items: Vec<String> = vs.iter().map(ToString::to_string).collect();
                write!(f, "IN ({})", items.join(", "))
            }
            Constraint::Range { lower, upper } => {
                match lower {
                    Some((v, true)) => write!(f, "[{v}, ")?,
                    Some((v, false)) => write!(f, "({v}, ")?,
                    None => write!(f, "(-inf, ")?,
                }
                match upper {
                    Some((v, true)) => write!(f, "{v}]"),
                    Some((v, false)) => write!(f, "{v})"),
                    None => write!(f, "+inf)"),
                }
            }
            Constraint::AnyOf(cs) => {
                let items: Vec<String> = cs.iter().map(ToString::to_string).collect();
                write!(f, "any of {{{}}}", items.join(" | "))
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "all"),
            Predicate::Conjunction(parts) => {
                let items: Vec<String> = parts
                    .iter()
                    .map(|p| format!("{} {}", p.column, p.constraint))
                    .collect();
                write!(f, "{}", items.join(" AND "))
            }
        }
    }
}

/// Facts about a SQL statement relevant to fetching
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlAnalysis {
    pub predicate: Predicate,
    /// Schema columns the statement may touch; `None` means all of them
    pub columns: Option<Vec<String>>,
    /// Columns compared with `=` or `IN` in the WHERE clause, in order of
    /// appearance
    pub equality_columns: Vec<String>,
}

impl SqlAnalysis {
    /// First column used with `=` or `IN`
    #[must_use]
    pub fn inferred_partition_column(&self) -> Option<&str> {
        self.equality_columns.first().map(String::as_str)
    }
}

/// Analyze `sql`, resolving identifiers against `fields` (schema column
/// names) the way DataFusion does: unquoted identifiers are lowercased,
/// quoted ones match exactly, and a qualifier must name the table or its
/// alias. Statements that cannot be parsed, or that are not a plain
/// single-table SELECT, yield an unrestricted analysis.
#[must_use]
pub fn analyze(sql: &str, fields: &[String]) -> SqlAnalysis {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!("not pruning, cannot parse SQL: {error}", error: e.to_string());
            return SqlAnalysis::default();
        }
    };
    let [statement] = statements.as_slice() else {
        return SqlAnalysis::default();
    };
    let Statement::Query(query) = statement else {
        return SqlAnalysis::default();
    };

    let mut scan = ScanCollector::default();
    let _ = statement.visit(&mut scan);

    let resolver = ColumnResolver::new(fields, query);
    let columns = if scan.wildcard {
        None
    } else {
        let mut used: BTreeSet<String> = BTreeSet::new();
        for ident in &scan.identifiers {
            used.extend(resolver.touched(ident));
        }
        Some(
            fields
                .iter()
                .filter(|f| used.contains(*f))
                .cloned()
                .collect(),
        )
    };

    // Subqueries read the same table, so it must stay complete.
    let Some(selection) = single_table_selection(query).filter(|_| scan.queries == 1) else {
        return SqlAnalysis {
            predicate: Predicate::All,
            columns,
            equality_columns: Vec::new(),
        };
    };

    let mut conjuncts = Vec::new();
    collect_conjuncts(selection, &resolver, &mut conjuncts);
    let mut equality_columns = Vec::new();
    collect_equality_columns(selection, &resolver, &mut equality_columns);

    SqlAnalysis {
        predicate: if conjuncts.is_empty() {
            Predicate::All
        } else {
            Predicate::Conjunction(conjuncts)
        },
        columns,
        equality_columns,
    }
}

/// Column that `sql` filters on by equality, if any.
#[must_use]
pub fn extract_partition_column(sql: &str, fields: &[String]) -> Option<String> {
    analyze(sql, fields).equality_columns.into_iter().next()
}

fn single_table_selection(query: &Query) -> Option<&Expr> {
    if query.with.is_some() {
        return None;
    }
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return None;
    }
    select.selection.as_ref()
}

/// Counts queries and records identifiers and wildcards anywhere in a
/// statement, subqueries included.
#[derive(Default)]
struct ScanCollector {
    queries: usize,
    wildcard: bool,
    identifiers: Vec<Vec<Ident>>,
}

fn has_wildcard(query: &Query) -> bool {
    match query.body.as_ref() {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(..) | SelectItem::QualifiedWildcard(..)
            )
        }),
        SetExpr::Query(inner) => has_wildcard(inner),
        _ => true,
    }
}

impl Visitor for ScanCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        self.queries += 1;
        self.wildcard |= has_wildcard(query);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        match expr {
            Expr::Identifier(ident) => self.identifiers.push(vec![ident.clone()]),
            Expr::CompoundIdentifier(parts) => self.identifiers.push(parts.clone()),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Identifier text as DataFusion sees it.
fn normalize_ident(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

struct ColumnResolver<'a> {
    fields: &'a [String],
    /// Names that may qualify a column: the table and its alias
    qualifiers: Vec<String>,
}

impl<'a> ColumnResolver<'a> {
    fn new(fields: &'a [String], query: &Query) -> Self {
        let mut qualifiers = vec![TABLE_NAME.to_string()];
        if let SetExpr::Select(select) = query.body.as_ref() {
            if let [table] = select.from.as_slice() {
                if let TableFactor::Table {
                    alias: Some(alias), ..
                } = &table.relation
                {
                    qualifiers.push(normalize_ident(&alias.name));
                }
            }
        }
        Self { fields, qualifiers }
    }

    fn field(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|f| *f == name).cloned()
    }

    /// Schema column named by an identifier path. `col` and `data.col`
    /// resolve; anything else, nested field access included, does not.
    fn resolve(&self, parts: &[Ident]) -> Option<String> {
        match parts {
            [name] => self.field(&normalize_ident(name)),
            [qualifier, name] if self.qualifiers.contains(&normalize_ident(qualifier)) => {
                self.field(&normalize_ident(name))
            }
            _ => None,
        }
    }

    /// Columns an identifier path may read. Field accesses such as
    /// `info.key` or `data.info.key` read their parent column.
    fn touched(&self, parts: &[Ident]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(head) = parts.first() {
            let head = normalize_ident(head);
            if self.qualifiers.contains(&head) {
                out.extend(parts.get(1).and_then(|p| self.field(&normalize_ident(p))));
            }
            out.extend(self.field(&head));
        }
        out
    }

    fn column(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(ident) => self.resolve(std::slice::from_ref(ident)),
            Expr::CompoundIdentifier(parts) => self.resolve(parts),
            Expr::Nested(inner) => self.column(inner),
            _ => None,
        }
    }
}

fn collect_conjuncts(expr: &Expr, resolver: &ColumnResolver<'_>, out: &mut Vec<ColumnPredicate>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, resolver, out);
            collect_conjuncts(right, resolver, out);
        }
        Expr::Nested(inner) => collect_conjuncts(inner, resolver, out),
        other => {
            if let Some(predicate) = column_predicate(other, resolver) {
                out.push(predicate);
            }
        }
    }
}

fn column_predicate(expr: &Expr, resolver: &ColumnResolver<'_>) -> Option<ColumnPredicate> {
    match expr {
        Expr::Nested(inner) => column_predicate(inner, resolver),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let left = column_predicate(left, resolver)?;
            let right = column_predicate(right, resolver)?;
            if left.column != right.column {
                return None;
            }
            let mut members = Vec::new();
            for constraint in [left.constraint, right.constraint] {
                match constraint {
                    Constraint::AnyOf(inner) => members.extend(inner),
                    other => members.push(other),
                }
            }
            Some(ColumnPredicate {
                column: left.column,
                constraint: Constraint::AnyOf(members),
            })
        }
        Expr::BinaryOp { left, op, right } => {
            let (column, value, op) = match (resolver.column(left), literal(right)) {
                (Some(column), Some(value)) => (column, value, op.clone()),
                _ => {
                    let column = resolver.column(right)?;
                    let value = literal(left)?;
                    (column, value, flip(op)?)
                }
            };
            let constraint = match op {
                BinaryOperator::Eq => Constraint::Eq(value),
                BinaryOperator::Lt => Constraint::Range {
                    lower: None,
                    upper: Some((value, false)),
                },
                BinaryOperator::LtEq => Constraint::Range {
                    lower: None,
                    upper: Some((value, true)),
                },
                BinaryOperator::Gt => Constraint::Range {
                    lower: Some((value, false)),
                    upper: None,
                },
                BinaryOperator::GtEq => Constraint::Range {
                    lower: Some((value, true)),
                    upper: None,
                },
                _ => return None,
            };
            Some(ColumnPredicate { column, constraint })
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = resolver.column(expr)?;
            let values = list.iter().map(literal).collect::<Option<Vec<_>>>()?;
            Some(ColumnPredicate {
                column,
                constraint: Constraint::In(values),
            })
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => Some(ColumnPredicate {
            column: resolver.column(expr)?,
            constraint: Constraint::Range {
                lower: Some((literal(low)?, true)),
                upper: Some((literal(high)?, true)),
            },
        }),
        _ => None,
    }
}

/// Operator with its operands swapped: `5 < x` is `x > 5`.
fn flip(op: &BinaryOperator) -> Option<BinaryOperator> {
    Some(match op {
        BinaryOperator::Eq => BinaryOperator::Eq,
        BinaryOperator::Lt => BinaryOperator::Gt,
        BinaryOperator::LtEq => BinaryOperator::GtEq,
        BinaryOperator::Gt => BinaryOperator::Lt,
        BinaryOperator::GtEq => BinaryOperator::LtEq,
        _ => return None,
    })
}

fn collect_equality_columns(expr: &Expr, resolver: &ColumnResolver<'_>, out: &mut Vec<String>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And | BinaryOperator::Or,
            right,
        } => {
            collect_equality_columns(left, resolver, out);
            collect_equality_columns(right, resolver, out);
        }
        Expr::Nested(inner) => collect_equality_columns(inner, resolver, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            ..
        } => {
            if let Some(column) = resolver.column(left) {
                push_unique(out, column);
            }
        }
        Expr::InList {
            expr,
            negated: false,
            ..
        } => {
            if let Some(column) = resolver.column(expr) {
                push_unique(out, column);
            }
        }
        _ => {}
    }
}

fn push_unique(out: &mut Vec<String>, column: String) {
    if !out.contains(&column) {
        out.push(column);
    }
}

/// Literal value of a constant expression.
fn literal(expr: &Expr) -> Option<StatValue> {
    match expr {
        Expr::Nested(inner) => literal(inner),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            StatValue::Int(i) => i.checked_neg().map(StatValue::Int),
            StatValue::Float(f) => Some(StatValue::Float(-f)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => match literal(expr)? {
            v @ (StatValue::Int(_) | StatValue::Float(_)) => Some(v),
            _ => None,
        },
        Expr::Value(value) => parse_literal(&value.to_string()),
        _ => None,
    }
}

/// Parse the SQL rendering of a literal.
pub fn parse_literal(text: &str) -> Option<StatValue> {
    let text = text.trim();
    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Some(StatValue::Utf8(text[1..text.len() - 1].replace("''", "'")));
    }
    if text.eq_ignore_ascii_case("true") {
        return Some(StatValue::Boolean(true));
    }
    if text.eq_ignore_ascii_case("false") {
        return Some(StatValue::Boolean(false));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(StatValue::Int(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(StatValue::Float)
}
