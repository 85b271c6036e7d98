// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Row-group selection from min/max statistics
//!
//! A row group is kept unless its statistics prove that no row in it can
//! satisfy the predicate. Missing statistics, missing bounds and values of
//! incomparable types all keep the group.

use crate::predicate::{ColumnPredicate, Constraint, Predicate};
use crate::stats::{ColumnBounds, RowGroupStats, StatValue, StatisticsIndex};
use std::cmp::Ordering;

/// Indices (ascending) of the row groups that may contain matching rows.
#[must_use]
pub fn select_row_groups(index: &StatisticsIndex, predicate: &Predicate) -> Vec<usize> {
    index
        .row_groups
        .iter()
        .filter(|rg| row_group_may_match(rg, predicate))
        .map(|rg| rg.index)
        .collect()
}

#[must_use]
pub fn row_group_may_match(rg: &RowGroupStats, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::All => true,
        Predicate::Conjunction(parts) => parts.iter().all(|part| part_may_match(rg, part)),
    }
}

fn part_may_match(rg: &RowGroupStats, part: &ColumnPredicate) -> bool {
    match rg.bounds(&part.column) {
        Some(bounds) => constraint_may_match(&part.constraint, bounds),
        None => true,
    }
}

/// True unless `bounds` rule out every value allowed by `constraint`.
#[must_use]
pub fn constraint_may_match(constraint: &Constraint, bounds: &ColumnBounds) -> bool {
    match constraint {
        Constraint::Eq(value) => value_may_match(value, bounds),
        Constraint::In(values) => values.iter().any(|v| value_may_match(v, bounds)),
        Constraint::Range { lower, upper } => {
            let below_lower = match (lower, &bounds.max) {
                (Some((low, inclusive)), Some(max)) => match max.compare(low) {
                    Some(Ordering::Less) => true,
                    Some(Ordering::Equal) => !inclusive,
                    _ => false,
                },
                _ => false,
            };
            let above_upper = match (upper, &bounds.min) {
                (Some((high, inclusive)), Some(min)) => match min.compare(high) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => !inclusive,
                    _ => false,
                },
                _ => false,
            };
            !(below_lower || above_upper)
        }
        Constraint::AnyOf(members) => members.iter().any(|c| constraint_may_match(c, bounds)),
    }
}

fn value_may_match(value: &StatValue, bounds: &ColumnBounds) -> bool {
    let above_min = bounds
        .min
        .as_ref()
        .is_none_or(|min| min.compare(value) != Some(Ordering::Greater));
    let below_max = bounds
        .max
        .as_ref()
        .is_none_or(|max| max.compare(value) != Some(Ordering::Less));
    above_min && below_max
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rangefs::ByteRange;
    use std::collections::BTreeMap;

    fn index_from_values(groups: &[Vec<i64>]) -> StatisticsIndex {
        let row_groups = groups
            .iter()
            .enumerate()
            .map(|(index, values)| {
                let mut columns = BTreeMap::new();
                if let (Some(min), Some(max)) = (values.iter().min(), values.iter().max()) {
                    _ = columns.insert(
                        "key".to_string(),
                        ColumnBounds {
                            min: Some(StatValue::Int(*min)),
                            max: Some(StatValue::Int(*max)),
                            null_count: Some(0),
                        },
                    );
                }
                RowGroupStats {
                    index,
                    byte_range: ByteRange::new(index as u64 * 1000, 1000),
                    row_count: values.len() as u64,
                    columns,
                }
            })
            .collect();
        StatisticsIndex {
            validator: "v".to_string(),
            num_rows: groups.iter().map(|g| g.len() as u64).sum(),
            columns: vec!["key".to_string()],
            row_groups,
            partition_column: Some("key".to_string()),
        }
    }

    fn satisfies(constraint: &Constraint, value: i64) -> bool {
        let v = StatValue::Int(value);
        match constraint {
            Constraint::Eq(c) => c.compare(&v) == Some(Ordering::Equal),
            Constraint::In(cs) => cs.iter().any(|c| c.compare(&v) == Some(Ordering::Equal)),
            Constraint::Range { lower, upper } => {
                let lower_ok = lower.as_ref().is_none_or(|(l, inclusive)| {
                    match v.compare(l) {
                        Some(Ordering::Greater) => true,
                        Some(Ordering::Equal) => *inclusive,
                        _ => false,
                    }
                });
                let upper_ok = upper.as_ref().is_none_or(|(u, inclusive)| {
                    match v.compare(u) {
                        Some(Ordering::Less) => true,
                        Some(Ordering::Equal) => *inclusive,
                        _ => false,
                    }
                });
                lower_ok && upper_ok
            }
            Constraint::AnyOf(cs) => cs.iter().any(|c| satisfies(c, value)),
        }
    }

    fn random_literal(rng: &mut StdRng) -> StatValue {
        if rng.gen_bool(0.3) {
            StatValue::Float(f64::from(rng.gen_range(-50..250)) + 0.5)
        } else {
            StatValue::Int(rng.gen_range(-50..250))
        }
    }

    fn random_constraint(rng: &mut StdRng, depth: usize) -> Constraint {
        match rng.gen_range(0..if depth == 0 { 4 } else { 3 }) {
            0 => Constraint::Eq(StatValue::Int(rng.gen_range(-50..250))),
            1 => Constraint::In(
                (0..rng.gen_range(1..4))
                    .map(|_| StatValue::Int(rng.gen_range(-50..250)))
                    .collect(),
            ),
            2 => Constraint::Range {
                lower: rng
                    .gen_bool(0.7)
                    .then(|| (random_literal(rng), rng.gen_bool(0.5))),
                upper: rng
                    .gen_bool(0.7)
                    .then(|| (random_literal(rng), rng.gen_bool(0.5))),
            },
            _ => Constraint::AnyOf(
                (0..rng.gen_range(1..3))
                    .map(|_| random_constraint(rng, depth + 1))
                    .collect(),
            ),
        }
    }

    #[test]
    fn test_pruning_never_drops_matching_rows() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let groups: Vec<Vec<i64>> = (0..rng.gen_range(1..12))
                .map(|_| {
                    let base = rng.gen_range(-40..200);
                    (0..rng.gen_range(0..20))
                        .map(|_| base + rng.gen_range(0..30))
                        .collect()
                })
                .collect();
            let index = index_from_values(&groups);
            let predicate = Predicate::Conjunction(
                (0..rng.gen_range(1..3))
                    .map(|_| ColumnPredicate {
                        column: "key".to_string(),
                        constraint: random_constraint(&mut rng, 0),
                    })
                    .collect(),
            );
            let selected = select_row_groups(&index, &predicate);

            let Predicate::Conjunction(parts) = &predicate else {
                unreachable!()
            };
            for (i, values) in groups.iter().enumerate() {
                let has_match = values.iter().any(|v| {
                    parts
                        .iter()
                        .all(|p| satisfies(&p.constraint, *v))
                });
                if has_match {
                    assert!(
                        selected.contains(&i),
                        "group {i} {values:?} dropped for {predicate}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_partitioned_lookup_selects_one_group() {
        let groups: Vec<Vec<i64>> = vec![
            (0..10).collect(),
            (10..20).collect(),
            (20..30).collect(),
            (50..81).collect(),
            (100..110).collect(),
        ];
        let index = index_from_values(&groups);
        assert_eq!(select_row_groups(&index, &Predicate::equality("key", 65i64)), vec![3]);
        assert!(select_row_groups(&index, &Predicate::equality("key", 95i64)).is_empty());
        assert_eq!(
            select_row_groups(&index, &Predicate::equality("key", 10i64)),
            vec![1]
        );
    }

    #[test]
    fn test_range_boundaries_are_inclusive_only_when_asked() {
        let index = index_from_values(&[(0..10).collect(), (10..20).collect()]);
        let gt = |v: i64, inclusive: bool| Predicate::Conjunction(vec![ColumnPredicate {
            column: "key".to_string(),
            constraint: Constraint::Range {
                lower: Some((StatValue::Int(v), inclusive)),
                upper: None,
            },
        }]);
        assert_eq!(select_row_groups(&index, &gt(9, true)), vec![0, 1]);
        assert_eq!(select_row_groups(&index, &gt(9, false)), vec![1]);
        assert_eq!(select_row_groups(&index, &gt(19, false)), Vec::<usize>::new());
    }

    #[test]
    fn test_unknown_column_and_incomparable_values_keep_groups() {
        let index = index_from_values(&[(0..10).collect(), (10..20).collect()]);
        assert_eq!(
            select_row_groups(&index, &Predicate::equality("other", 1i64)),
            vec![0, 1]
        );
        assert_eq!(
            select_row_groups(&index, &Predicate::equality("key", "5")),
            vec![0, 1]
        );
        assert_eq!(select_row_groups(&index, &Predicate::All), vec![0, 1]);
    }

    #[test]
    fn test_groups_without_stats_are_kept() {
        let index = index_from_values(&[vec![], (10..20).collect()]);
        assert_eq!(
            select_row_groups(&index, &Predicate::equality("key", 3i64)),
            vec![0]
        );
    }

    #[test]
    fn test_float_literals_against_int_stats() {
        let index = index_from_values(&[(0..10).collect(), (10..20).collect()]);
        let pred = Predicate::Conjunction(vec![ColumnPredicate {
            column: "key".to_string(),
            constraint: Constraint::Range {
                lower: Some((StatValue::Float(9.5), false)),
                upper: Some((StatValue::Float(10.0), true)),
            },
        }]);
        assert_eq!(select_row_groups(&index, &pred), vec![1]);
    }
}
