//! Binary-operator join semantics over instant vectors.
//!
//! Rows from the two operands pair up when their match keys are equal. The
//! match key is the sample's labels minus `__name__`, restricted to the
//! `on (...)` labels or stripped of the `ignoring (...)` labels when a
//! matching clause is present.

use std::collections::{HashMap, HashSet};

use crate::ast::{BinOp, VectorMatchCardinality, VectorMatching};
use crate::error::Error;
use crate::types::{InstantVector, Sample, TagSet, NAME_LABEL};

/// The key a sample matches under. Identical keys on both sides join.
pub fn match_key(labels: &TagSet, matching: Option<&VectorMatching>) -> TagSet {
    labels
        .iter()
        .filter(|(name, _)| name.as_str() != NAME_LABEL)
        .filter(|(name, _)| match matching {
            Some(m) if m.on => m.matching_labels.iter().any(|l| l == *name),
            Some(m) => !m.matching_labels.iter().any(|l| l == *name),
            None => true,
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Apply a binary operator to two scalar values.
///
/// Comparisons yield 1.0/0.0; set operators have no scalar form.
pub fn scalar_binop(op: BinOp, lhs: f64, rhs: f64) -> Result<f64, Error> {
    Ok(match op {
        BinOp::Add => lhs + rhs,
        BinOp::Sub => lhs - rhs,
        BinOp::Mul => lhs * rhs,
        BinOp::Div => lhs / rhs,
        BinOp::Mod => lhs % rhs,
        BinOp::Pow => lhs.powf(rhs),
        BinOp::Eql => bool_value(lhs == rhs),
        BinOp::Neq => bool_value(lhs != rhs),
        BinOp::Gtr => bool_value(lhs > rhs),
        BinOp::Lss => bool_value(lhs < rhs),
        BinOp::Gte => bool_value(lhs >= rhs),
        BinOp::Lte => bool_value(lhs <= rhs),
        BinOp::And | BinOp::Or | BinOp::Unless => {
            return Err(Error::Evaluation(format!(
                "set operator {op} requires vector operands"
            )));
        }
    })
}

fn bool_value(v: bool) -> f64 {
    if v { 1.0 } else { 0.0 }
}

/// Join two instant vectors under a binary operator.
///
/// Default cardinality is one-to-one; a second row with the same match key on
/// either side fails. `group_left`/`group_right` declare the many side and
/// copy the `include` labels from the one side onto each result row.
/// Comparisons filter unless `return_bool` is set, in which case every matched
/// pair yields a 0/1 sample.
pub fn vector_binary(
    op: BinOp,
    lhs: InstantVector,
    rhs: InstantVector,
    return_bool: bool,
    matching: Option<&VectorMatching>,
) -> Result<InstantVector, Error> {
    if op.is_set_operator() {
        return set_operator(op, lhs, rhs, matching);
    }

    let card = matching
        .map(|m| m.card)
        .unwrap_or(VectorMatchCardinality::OneToOne);
    let (many, one, many_is_lhs) = match card {
        VectorMatchCardinality::OneToMany => (rhs, lhs, false),
        _ => (lhs, rhs, true),
    };

    let mut one_side: HashMap<TagSet, Sample> = HashMap::new();
    for sample in one {
        let key = match_key(&sample.labels, matching);
        if one_side.insert(key, sample).is_some() {
            return Err(Error::ManyToMany);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for sample in many {
        let key = match_key(&sample.labels, matching);
        let Some(partner) = one_side.get(&key) else {
            continue;
        };
        if card == VectorMatchCardinality::OneToOne && !seen.insert(key.clone()) {
            return Err(Error::ManyToMany);
        }

        let (l, r) = if many_is_lhs {
            (sample.value, partner.value)
        } else {
            (partner.value, sample.value)
        };
        let value = scalar_binop(op, l, r)?;

        if op.is_comparison() && !return_bool {
            // filter form: the sample passes through untouched
            if value != 0.0 {
                out.push(sample);
            }
            continue;
        }

        let mut labels = match card {
            VectorMatchCardinality::OneToOne => key,
            _ => {
                let mut labels = sample.labels.clone();
                labels.remove(NAME_LABEL);
                labels
            }
        };
        if let Some(m) = matching {
            for name in &m.include {
                match partner.labels.get(name) {
                    Some(v) => {
                        labels.insert(name.clone(), v.clone());
                    }
                    None => {
                        labels.remove(name);
                    }
                }
            }
        }
        out.push(Sample {
            labels,
            timestamp: sample.timestamp,
            value,
        });
    }
    Ok(out)
}

/// `and` keeps left rows with a right match, `unless` keeps left rows
/// without one, `or` adds right rows whose key is absent on the left.
fn set_operator(
    op: BinOp,
    lhs: InstantVector,
    rhs: InstantVector,
    matching: Option<&VectorMatching>,
) -> Result<InstantVector, Error> {
    match op {
        BinOp::And | BinOp::Unless => {
            let rhs_keys: HashSet<TagSet> = rhs
                .iter()
                .map(|s| match_key(&s.labels, matching))
                .collect();
            let keep_matched = op == BinOp::And;
            Ok(lhs
                .into_iter()
                .filter(|s| rhs_keys.contains(&match_key(&s.labels, matching)) == keep_matched)
                .collect())
        }
        BinOp::Or => {
            let lhs_keys: HashSet<TagSet> = lhs
                .iter()
                .map(|s| match_key(&s.labels, matching))
                .collect();
            let mut out = lhs;
            for sample in rhs {
                if !lhs_keys.contains(&match_key(&sample.labels, matching)) {
                    out.push(sample);
                }
            }
            Ok(out)
        }
        _ => Err(Error::Evaluation(format!("{op} is not a set operator"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(pairs: &[(&str, &str)], value: f64) -> Sample {
        Sample {
            labels: labels(pairs),
            timestamp: 0,
            value,
        }
    }

    #[test]
    fn one_to_one_addition_joins_on_shared_labels() {
        let lhs = vec![sample(&[(NAME_LABEL, "a"), ("pod", "x")], 1.0)];
        let rhs = vec![sample(&[(NAME_LABEL, "b"), ("pod", "x")], 2.0)];
        let out = vector_binary(BinOp::Add, lhs, rhs, false, None).unwrap();
        assert_eq!(out, vec![sample(&[("pod", "x")], 3.0)]);
    }

    #[test]
    fn one_to_one_join_across_multiple_keys() {
        let lhs = vec![
            sample(&[("pod", "x")], 1.0),
            sample(&[("pod", "y")], 2.0),
        ];
        let rhs = vec![
            sample(&[("pod", "x")], 10.0),
            sample(&[("pod", "y")], 20.0),
        ];
        let mut out = vector_binary(BinOp::Add, lhs, rhs, false, None).unwrap();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        assert_eq!(
            out,
            vec![
                sample(&[("pod", "x")], 11.0),
                sample(&[("pod", "y")], 22.0),
            ]
        );
    }

    #[test]
    fn duplicate_key_on_either_side_is_many_to_many() {
        let lhs = vec![sample(&[("pod", "x")], 1.0)];
        let rhs = vec![
            sample(&[(NAME_LABEL, "b"), ("pod", "x")], 2.0),
            sample(&[(NAME_LABEL, "c"), ("pod", "x")], 3.0),
        ];
        assert!(matches!(
            vector_binary(BinOp::Add, lhs.clone(), rhs.clone(), false, None),
            Err(Error::ManyToMany)
        ));
        assert!(matches!(
            vector_binary(BinOp::Add, rhs, lhs, false, None),
            Err(Error::ManyToMany)
        ));
    }

    #[test]
    fn on_clause_restricts_the_match_key() {
        let matching = VectorMatching {
            card: VectorMatchCardinality::OneToOne,
            on: true,
            matching_labels: vec!["pod".to_string()],
            include: vec![],
        };
        let lhs = vec![sample(&[("pod", "x"), ("job", "a")], 10.0)];
        let rhs = vec![sample(&[("pod", "x"), ("job", "b")], 4.0)];
        let out = vector_binary(BinOp::Sub, lhs, rhs, false, Some(&matching)).unwrap();
        // with `on`, only the listed labels survive
        assert_eq!(out, vec![sample(&[("pod", "x")], 6.0)]);
    }

    #[test]
    fn ignoring_clause_drops_the_listed_labels() {
        let matching = VectorMatching {
            card: VectorMatchCardinality::OneToOne,
            on: false,
            matching_labels: vec!["mode".to_string()],
            include: vec![],
        };
        let lhs = vec![sample(&[("pod", "x"), ("mode", "idle")], 8.0)];
        let rhs = vec![sample(&[("pod", "x"), ("mode", "user")], 2.0)];
        let out = vector_binary(BinOp::Div, lhs, rhs, false, Some(&matching)).unwrap();
        assert_eq!(out, vec![sample(&[("pod", "x")], 4.0)]);
    }

    #[test]
    fn group_left_copies_include_labels_from_the_one_side() {
        let matching = VectorMatching {
            card: VectorMatchCardinality::ManyToOne,
            on: true,
            matching_labels: vec!["pod".to_string()],
            include: vec!["node".to_string()],
        };
        let lhs = vec![
            sample(&[("pod", "x"), ("container", "c1")], 1.0),
            sample(&[("pod", "x"), ("container", "c2")], 2.0),
        ];
        let rhs = vec![sample(&[("pod", "x"), ("node", "n1")], 10.0)];
        let out = vector_binary(BinOp::Mul, lhs, rhs, false, Some(&matching)).unwrap();
        assert_eq!(
            out,
            vec![
                sample(&[("pod", "x"), ("container", "c1"), ("node", "n1")], 10.0),
                sample(&[("pod", "x"), ("container", "c2"), ("node", "n1")], 20.0),
            ]
        );
    }

    #[test]
    fn comparison_filters_without_bool_and_coerces_with_it() {
        let lhs = vec![
            sample(&[(NAME_LABEL, "m"), ("pod", "x")], 5.0),
            sample(&[(NAME_LABEL, "m"), ("pod", "y")], 1.0),
        ];
        let rhs = vec![
            sample(&[("pod", "x")], 3.0),
            sample(&[("pod", "y")], 3.0),
        ];

        let filtered = vector_binary(BinOp::Gtr, lhs.clone(), rhs.clone(), false, None).unwrap();
        assert_eq!(filtered, vec![lhs[0].clone()]);

        let mut coerced = vector_binary(BinOp::Gtr, lhs, rhs, true, None).unwrap();
        coerced.sort_by(|a, b| a.labels.cmp(&b.labels));
        assert_eq!(
            coerced,
            vec![sample(&[("pod", "x")], 1.0), sample(&[("pod", "y")], 0.0)]
        );
    }

    #[test]
    fn set_operators() {
        let lhs = vec![
            sample(&[("pod", "x")], 1.0),
            sample(&[("pod", "y")], 2.0),
        ];
        let rhs = vec![
            sample(&[("pod", "y")], 9.0),
            sample(&[("pod", "z")], 9.0),
        ];

        let and = vector_binary(BinOp::And, lhs.clone(), rhs.clone(), false, None).unwrap();
        assert_eq!(and, vec![sample(&[("pod", "y")], 2.0)]);

        let unless = vector_binary(BinOp::Unless, lhs.clone(), rhs.clone(), false, None).unwrap();
        assert_eq!(unless, vec![sample(&[("pod", "x")], 1.0)]);

        let or = vector_binary(BinOp::Or, lhs, rhs, false, None).unwrap();
        assert_eq!(
            or,
            vec![
                sample(&[("pod", "x")], 1.0),
                sample(&[("pod", "y")], 2.0),
                sample(&[("pod", "z")], 9.0),
            ]
        );
    }

    #[test]
    fn scalar_set_operator_is_rejected() {
        assert!(matches!(
            scalar_binop(BinOp::And, 1.0, 2.0),
            Err(Error::Evaluation(_))
        ));
    }
}
