//! Grouped reductions over instant vectors.

use std::collections::BTreeMap;

use crate::ast::{AggregateModifier, AggregationOp};
use crate::error::Error;
use crate::types::{InstantVector, Sample, TagSet, NAME_LABEL};

/// Leading scalar/string parameter for the parameterized operators.
#[derive(Debug, Clone, PartialEq)]
pub enum AggParam {
    Number(f64),
    Str(String),
}

/// The labels a sample is grouped under. `by` keeps exactly the listed
/// labels, `without` keeps everything but the listed ones; `__name__` never
/// participates. No modifier collapses everything into a single group.
pub fn grouping_key(labels: &TagSet, modifier: Option<&AggregateModifier>) -> TagSet {
    let Some(modifier) = modifier else {
        return TagSet::new();
    };
    labels
        .iter()
        .filter(|(name, _)| name.as_str() != NAME_LABEL)
        .filter(|(name, _)| {
            let listed = modifier.grouping.iter().any(|l| l == *name);
            listed != modifier.without
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Apply an aggregation operator to an instant vector.
///
/// Reductions emit one sample per group carrying only the grouping-key
/// labels. `topk`/`bottomk` select whole samples instead and keep their
/// original labels.
pub fn aggregate(
    op: AggregationOp,
    modifier: Option<&AggregateModifier>,
    param: Option<&AggParam>,
    vector: InstantVector,
) -> Result<InstantVector, Error> {
    let param = match (op.takes_parameter(), param) {
        (true, Some(p)) => Some(p),
        (true, None) => {
            return Err(Error::Evaluation(format!(
                "aggregation {op} requires a parameter"
            )));
        }
        (false, _) => None,
    };

    // BTreeMap keys keep the output order deterministic.
    let mut groups: BTreeMap<TagSet, Vec<Sample>> = BTreeMap::new();
    for sample in vector {
        let key = grouping_key(&sample.labels, modifier);
        groups.entry(key).or_default().push(sample);
    }

    let mut out = Vec::new();
    for (key, samples) in groups {
        match op {
            AggregationOp::Topk | AggregationOp::Bottomk => {
                let k = number_param(op, param)?;
                let k = if k.is_sign_negative() { 0 } else { k as usize };
                let mut samples = samples;
                samples.sort_by(|a, b| {
                    let ord = a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal);
                    if op == AggregationOp::Topk {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                out.extend(samples.into_iter().take(k));
            }
            AggregationOp::CountValues => {
                let label = string_param(op, param)?;
                let mut buckets: BTreeMap<String, usize> = BTreeMap::new();
                for sample in &samples {
                    *buckets.entry(format_value(sample.value)).or_default() += 1;
                }
                let timestamp = samples[0].timestamp;
                for (rendered, count) in buckets {
                    let mut labels = key.clone();
                    labels.insert(label.to_string(), rendered);
                    out.push(Sample {
                        labels,
                        timestamp,
                        value: count as f64,
                    });
                }
            }
            _ => {
                let value = reduce(op, param, &samples)?;
                out.push(Sample {
                    labels: key,
                    timestamp: samples[0].timestamp,
                    value,
                });
            }
        }
    }
    Ok(out)
}

fn reduce(op: AggregationOp, param: Option<&AggParam>, samples: &[Sample]) -> Result<f64, Error> {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let n = values.len() as f64;
    Ok(match op {
        AggregationOp::Sum => values.iter().sum(),
        AggregationOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationOp::Avg => values.iter().sum::<f64>() / n,
        AggregationOp::Count => n,
        AggregationOp::Group => 1.0,
        AggregationOp::Stddev => variance(&values).sqrt(),
        AggregationOp::Stdvar => variance(&values),
        AggregationOp::Quantile => quantile(number_param(op, param)?, &values),
        AggregationOp::Topk | AggregationOp::Bottomk | AggregationOp::CountValues => {
            return Err(Error::Evaluation(format!("{op} is not a plain reduction")));
        }
    })
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// Linear-interpolation quantile over the sorted values, q clamped to [0, 1].
fn quantile(q: f64, values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = q.clamp(0.0, 1.0);
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

fn number_param(op: AggregationOp, param: Option<&AggParam>) -> Result<f64, Error> {
    match param {
        Some(AggParam::Number(v)) => Ok(*v),
        _ => Err(Error::Evaluation(format!(
            "aggregation {op} requires a scalar parameter"
        ))),
    }
}

fn string_param<'a>(op: AggregationOp, param: Option<&'a AggParam>) -> Result<&'a str, Error> {
    match param {
        Some(AggParam::Str(s)) => Ok(s),
        _ => Err(Error::Evaluation(format!(
            "aggregation {op} requires a string parameter"
        ))),
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
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
            timestamp: 10,
            value,
        }
    }

    fn by(names: &[&str]) -> AggregateModifier {
        AggregateModifier {
            grouping: names.iter().map(|s| s.to_string()).collect(),
            without: false,
        }
    }

    fn input() -> InstantVector {
        vec![
            sample(&[(NAME_LABEL, "m"), ("job", "a"), ("pod", "1")], 1.0),
            sample(&[(NAME_LABEL, "m"), ("job", "a"), ("pod", "2")], 2.0),
            sample(&[(NAME_LABEL, "m"), ("job", "b"), ("pod", "3")], 5.0),
        ]
    }

    #[test]
    fn sum_by_job() {
        let out = aggregate(AggregationOp::Sum, Some(&by(&["job"])), None, input()).unwrap();
        assert_eq!(
            out,
            vec![
                sample(&[("job", "a")], 3.0),
                sample(&[("job", "b")], 5.0),
            ]
        );
    }

    #[test]
    fn without_drops_listed_labels_and_name() {
        let modifier = AggregateModifier {
            grouping: vec!["pod".to_string()],
            without: true,
        };
        let out = aggregate(AggregationOp::Max, Some(&modifier), None, input()).unwrap();
        assert_eq!(
            out,
            vec![
                sample(&[("job", "a")], 2.0),
                sample(&[("job", "b")], 5.0),
            ]
        );
    }

    #[test]
    fn no_modifier_collapses_to_one_group() {
        let out = aggregate(AggregationOp::Count, None, None, input()).unwrap();
        assert_eq!(out, vec![sample(&[], 3.0)]);
    }

    #[test]
    fn avg_and_spread() {
        let vector = vec![
            sample(&[("job", "a")], 2.0),
            sample(&[("job", "a")], 4.0),
            sample(&[("job", "a")], 6.0),
        ];
        let avg = aggregate(AggregationOp::Avg, Some(&by(&["job"])), None, vector.clone()).unwrap();
        assert_eq!(avg[0].value, 4.0);
        let stdvar =
            aggregate(AggregationOp::Stdvar, Some(&by(&["job"])), None, vector.clone()).unwrap();
        assert!((stdvar[0].value - 8.0 / 3.0).abs() < 1e-12);
        let stddev = aggregate(AggregationOp::Stddev, Some(&by(&["job"])), None, vector).unwrap();
        assert!((stddev[0].value - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn topk_keeps_original_sample_labels() {
        let out = aggregate(
            AggregationOp::Topk,
            None,
            Some(&AggParam::Number(2.0)),
            input(),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                sample(&[(NAME_LABEL, "m"), ("job", "b"), ("pod", "3")], 5.0),
                sample(&[(NAME_LABEL, "m"), ("job", "a"), ("pod", "2")], 2.0),
            ]
        );
    }

    #[test]
    fn bottomk_selects_smallest() {
        let out = aggregate(
            AggregationOp::Bottomk,
            None,
            Some(&AggParam::Number(1.0)),
            input(),
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 1.0);
    }

    #[test]
    fn quantile_interpolates_linearly() {
        let vector = vec![
            sample(&[("job", "a")], 0.0),
            sample(&[("job", "a")], 10.0),
        ];
        let out = aggregate(
            AggregationOp::Quantile,
            Some(&by(&["job"])),
            Some(&AggParam::Number(0.5)),
            vector,
        )
        .unwrap();
        assert_eq!(out[0].value, 5.0);
    }

    #[test]
    fn count_values_adds_the_value_label() {
        let vector = vec![
            sample(&[("job", "a")], 2.0),
            sample(&[("job", "a")], 2.0),
            sample(&[("job", "a")], 7.0),
        ];
        let out = aggregate(
            AggregationOp::CountValues,
            Some(&by(&["job"])),
            Some(&AggParam::Str("version".to_string())),
            vector,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![
                sample(&[("job", "a"), ("version", "2")], 2.0),
                sample(&[("job", "a"), ("version", "7")], 1.0),
            ]
        );
    }

    #[test]
    fn missing_parameter_is_an_error() {
        assert!(matches!(
            aggregate(AggregationOp::Topk, None, None, input()),
            Err(Error::Evaluation(_))
        ));
    }
}
