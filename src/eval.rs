//! Expression evaluation.
//!
//! Walks the AST: leaf selectors resolve their storage mapping, compile to a
//! bounded query, fetch through the store and realign; binary, aggregation
//! and unary nodes apply the resolvers over the results. Function calls are
//! recognized and arity-checked for dispatch only; their bodies are not
//! evaluated.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::aggregation::{aggregate, AggParam};
use crate::ast::{function_arity, BinOp, Expr, MatcherOp, UnaryOp, VectorSelector};
use crate::compile::compile;
use crate::config::{ConfigResolver, ResolveParams};
use crate::error::Error;
use crate::matching::{scalar_binop, vector_binary};
use crate::realign::{latest, realign, BucketAgg};
use crate::store::MetricStore;
use crate::types::{InstantVector, RangeVector, TagSet, Window, NAME_LABEL};

pub const DEFAULT_INTERVAL: u64 = 60;

/// What an expression evaluates to.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    String(String),
    Vector(InstantVector),
    Matrix(RangeVector),
}

pub struct Evaluator {
    resolver: Arc<ConfigResolver>,
    store: Arc<dyn MetricStore>,
    /// Grid interval in seconds for realignment and range stepping.
    interval: u64,
}

impl Evaluator {
    pub fn new(resolver: Arc<ConfigResolver>, store: Arc<dyn MetricStore>) -> Self {
        Evaluator {
            resolver,
            store,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Evaluate at a single instant, unix seconds.
    pub async fn eval_instant(&self, expr: &Expr, at: i64) -> Result<Value, Error> {
        self.eval(expr, at).await
    }

    /// Evaluate over `[window.start, window.end]` on the evaluator's grid by
    /// stepping the instant evaluation.
    pub async fn eval_range(&self, expr: &Expr, window: Window) -> Result<RangeVector, Error> {
        self.stepped_range(expr, window, self.interval).await
    }

    async fn stepped_range(
        &self,
        expr: &Expr,
        window: Window,
        step: u64,
    ) -> Result<RangeVector, Error> {
        let step = step.max(1) as i64;
        let mut grouped: std::collections::BTreeMap<TagSet, Vec<(i64, f64)>> = Default::default();
        let mut t = window.start;
        while t <= window.end {
            match self.eval(expr, t).await? {
                Value::Scalar(v) => {
                    grouped.entry(TagSet::new()).or_default().push((t, v));
                }
                Value::Vector(samples) => {
                    for sample in samples {
                        grouped.entry(sample.labels).or_default().push((t, sample.value));
                    }
                }
                Value::String(_) | Value::Matrix(_) => {
                    return Err(Error::Evaluation(
                        "range evaluation requires a scalar- or vector-valued expression"
                            .to_string(),
                    ));
                }
            }
            t += step;
        }
        Ok(grouped
            .into_iter()
            .map(|(labels, points)| crate::types::Series { labels, points })
            .collect())
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        at: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Value, Error>> + Send + 'a>> {
        Box::pin(async move {
            match expr {
                Expr::NumberLiteral(v) => Ok(Value::Scalar(*v)),
                Expr::StringLiteral(s) => Ok(Value::String(s.clone())),
                Expr::Paren(inner) => self.eval(inner, at).await,
                Expr::VectorSelector(vs) => {
                    Ok(Value::Vector(self.eval_selector(vs, at).await?))
                }
                Expr::MatrixSelector(ms) => {
                    let end = at.saturating_sub(clamp_seconds(ms.offset));
                    let window = Window {
                        start: end.saturating_sub(clamp_seconds(ms.range)),
                        end,
                    };
                    let (name, params) = selector_params(&ms.vs)?;
                    let config = self.resolver.resolve(&params)?;
                    let query = compile(&config, &ms.vs.matchers, window, 0)?;
                    let rows = self.store.fetch(&query).await?;
                    let mut series = realign(rows, self.interval, Some(window), BucketAgg::Mean);
                    for s in &mut series {
                        s.labels.insert(NAME_LABEL.to_string(), name.clone());
                    }
                    Ok(Value::Matrix(series))
                }
                Expr::Subquery(sq) => {
                    let end = at.saturating_sub(clamp_seconds(sq.offset));
                    let window = Window {
                        start: end.saturating_sub(clamp_seconds(sq.range)),
                        end,
                    };
                    let step = sq.step.unwrap_or(self.interval);
                    let series = self.stepped_range(&sq.expr, window, step).await?;
                    Ok(Value::Matrix(series))
                }
                Expr::Unary(unary) => {
                    let value = self.eval(&unary.expr, at).await?;
                    apply_unary(unary.op, value)
                }
                Expr::Binary(bin) => {
                    let lhs = self.eval(&bin.lhs, at).await?;
                    let rhs = self.eval(&bin.rhs, at).await?;
                    apply_binary(
                        bin.op,
                        lhs,
                        rhs,
                        bin.return_bool,
                        bin.matching.as_ref(),
                    )
                }
                Expr::Aggregate(agg) => {
                    let param = match agg.params.len() {
                        0 => None,
                        1 => Some(self.eval_agg_param(&agg.params[0], at).await?),
                        n => {
                            return Err(Error::Evaluation(format!(
                                "aggregation {} takes at most one parameter, got {n}",
                                agg.op
                            )));
                        }
                    };
                    let vector = self.expect_vector(&agg.expr, at).await?;
                    Ok(Value::Vector(aggregate(
                        agg.op,
                        agg.modifier.as_ref(),
                        param.as_ref(),
                        vector,
                    )?))
                }
                Expr::Call(call) => {
                    let (min, max) = function_arity(&call.name)
                        .ok_or_else(|| Error::UnsupportedFunction {
                            name: call.name.clone(),
                        })?;
                    let got = call.args.len();
                    let in_range = got >= min && max.map(|m| got <= m).unwrap_or(true);
                    if !in_range {
                        return Err(Error::FunctionArity {
                            name: call.name.clone(),
                            expected: match max {
                                Some(m) if m == min => format!("{min}"),
                                Some(m) => format!("{min} to {m}"),
                                None => format!("at least {min}"),
                            },
                            got,
                        });
                    }
                    // arguments still evaluate so selector problems surface
                    for arg in &call.args {
                        self.eval(arg, at).await?;
                    }
                    Err(Error::UnsupportedFunction {
                        name: call.name.clone(),
                    })
                }
            }
        })
    }

    async fn eval_agg_param(&self, expr: &Expr, at: i64) -> Result<AggParam, Error> {
        match self.eval(expr, at).await? {
            Value::Scalar(v) => Ok(AggParam::Number(v)),
            Value::String(s) => Ok(AggParam::Str(s)),
            _ => Err(Error::Evaluation(
                "aggregation parameter must be a scalar or string".to_string(),
            )),
        }
    }

    async fn expect_vector(&self, expr: &Expr, at: i64) -> Result<InstantVector, Error> {
        match self.eval(expr, at).await? {
            Value::Vector(v) => Ok(v),
            other => Err(Error::Evaluation(format!(
                "expected an instant vector, got {}",
                value_kind(&other)
            ))),
        }
    }

    /// Instant selector: look-behind window ending at `at`, newest sample per
    /// tag-set.
    async fn eval_selector(&self, vs: &VectorSelector, at: i64) -> Result<InstantVector, Error> {
        let (name, params) = selector_params(vs)?;
        let config = self.resolver.resolve(&params)?;
        let window = Window {
            start: at.saturating_sub(clamp_seconds(config.look_behind.as_secs())),
            end: at,
        };
        let query = compile(&config, &vs.matchers, window, vs.offset)?;
        debug!(metric = %name, window_start = window.start, window_end = window.end, "fetching selector");
        let rows = self.store.fetch(&query).await?;
        let mut samples = latest(rows, at.saturating_sub(clamp_seconds(vs.offset)));
        for sample in &mut samples {
            sample
                .labels
                .insert(NAME_LABEL.to_string(), name.clone());
        }
        Ok(samples)
    }
}

/// Seconds as a signed timestamp delta, saturating instead of wrapping.
fn clamp_seconds(seconds: u64) -> i64 {
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

/// Metric name plus the equality matchers, as the resolver's rule context.
fn selector_params(vs: &VectorSelector) -> Result<(String, ResolveParams), Error> {
    let name = vs.name.clone().ok_or(Error::MissingMetricName)?;
    let mut params = ResolveParams::for_metric(&name);
    for matcher in vs.matchers.iter() {
        if matcher.op == MatcherOp::Equal {
            params
                .labels
                .insert(matcher.name.clone(), matcher.value.clone());
        }
    }
    Ok((name, params))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Scalar(_) => "scalar",
        Value::String(_) => "string",
        Value::Vector(_) => "instant vector",
        Value::Matrix(_) => "range vector",
    }
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value, Error> {
    let negate = op == UnaryOp::Minus;
    match value {
        Value::Scalar(v) => Ok(Value::Scalar(if negate { -v } else { v })),
        Value::Vector(mut samples) => {
            for sample in &mut samples {
                sample.labels.remove(NAME_LABEL);
                if negate {
                    sample.value = -sample.value;
                }
            }
            Ok(Value::Vector(samples))
        }
        other => Err(Error::Evaluation(format!(
            "unary {op} is not defined on a {}",
            value_kind(&other)
        ))),
    }
}

fn apply_binary(
    op: BinOp,
    lhs: Value,
    rhs: Value,
    return_bool: bool,
    matching: Option<&crate::ast::VectorMatching>,
) -> Result<Value, Error> {
    match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => Ok(Value::Scalar(scalar_binop(op, l, r)?)),
        (Value::Scalar(l), Value::Vector(v)) => Ok(Value::Vector(scalar_vector(
            op,
            l,
            v,
            true,
            return_bool,
        )?)),
        (Value::Vector(v), Value::Scalar(r)) => Ok(Value::Vector(scalar_vector(
            op,
            r,
            v,
            false,
            return_bool,
        )?)),
        (Value::Vector(l), Value::Vector(r)) => Ok(Value::Vector(vector_binary(
            op,
            l,
            r,
            return_bool,
            matching,
        )?)),
        (l, r) => Err(Error::Evaluation(format!(
            "operator {op} is not defined between a {} and a {}",
            value_kind(&l),
            value_kind(&r)
        ))),
    }
}

/// Broadcast a scalar across an instant vector.
fn scalar_vector(
    op: BinOp,
    scalar: f64,
    vector: InstantVector,
    scalar_on_left: bool,
    return_bool: bool,
) -> Result<InstantVector, Error> {
    if op.is_set_operator() {
        return Err(Error::Evaluation(format!(
            "set operator {op} requires vector operands on both sides"
        )));
    }
    let mut out = Vec::with_capacity(vector.len());
    for sample in vector {
        let (l, r) = if scalar_on_left {
            (scalar, sample.value)
        } else {
            (sample.value, scalar)
        };
        let value = scalar_binop(op, l, r)?;
        if op.is_comparison() && !return_bool {
            if value != 0.0 {
                out.push(sample);
            }
            continue;
        }
        let mut sample = sample;
        sample.labels.remove(NAME_LABEL);
        sample.value = value;
        out.push(sample);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreDefaults;
    use crate::parser::parse;
    use crate::store::MemoryStore;
    use crate::types::StoreRow;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn evaluator() -> (Evaluator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(ConfigResolver::new(StoreDefaults::default()));
        let eval = Evaluator::new(resolver, Arc::clone(&store) as Arc<dyn MetricStore>)
            .with_interval(60);
        (eval, store)
    }

    fn seed_metric(store: &MemoryStore) {
        // default config maps metric name -> table name
        store.insert_all(
            "metric",
            vec![
                StoreRow {
                    timestamp: 900,
                    value: 1.0,
                    tags: tags(&[("job", "a"), ("pod", "1")]),
                },
                StoreRow {
                    timestamp: 950,
                    value: 2.0,
                    tags: tags(&[("job", "a"), ("pod", "2")]),
                },
                StoreRow {
                    timestamp: 940,
                    value: 5.0,
                    tags: tags(&[("job", "b"), ("pod", "3")]),
                },
                // stale point for pod 1, superseded at t=900
                StoreRow {
                    timestamp: 800,
                    value: 9.0,
                    tags: tags(&[("job", "a"), ("pod", "1")]),
                },
            ],
        );
    }

    #[tokio::test]
    async fn instant_selector_takes_latest_per_tag_set() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse("metric").unwrap();
        let Value::Vector(mut samples) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected vector");
        };
        samples.sort_by(|a, b| a.labels.cmp(&b.labels));
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[0].labels.get(NAME_LABEL).map(String::as_str), Some("metric"));
    }

    #[tokio::test]
    async fn offset_shifts_the_instant() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse(r#"metric{pod="1"} offset 3m"#).unwrap();
        // at 1000 with 180s offset, the t=900 point is in the future
        let Value::Vector(samples) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 9.0);
    }

    #[tokio::test]
    async fn sum_by_job_end_to_end() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse("sum by (job) (metric)").unwrap();
        let Value::Vector(samples) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels, tags(&[("job", "a")]));
        assert_eq!(samples[0].value, 3.0);
        assert_eq!(samples[1].labels, tags(&[("job", "b")]));
        assert_eq!(samples[1].value, 5.0);
    }

    #[tokio::test]
    async fn scalar_broadcast_drops_the_metric_name() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse(r#"metric{job="b"} * 2"#).unwrap();
        let Value::Vector(samples) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 10.0);
        assert!(!samples[0].labels.contains_key(NAME_LABEL));
    }

    #[tokio::test]
    async fn vector_comparison_filters() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse("metric > 1.5").unwrap();
        let Value::Vector(samples) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected vector");
        };
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&2.0) && values.contains(&5.0));
    }

    #[tokio::test]
    async fn scalar_arithmetic() {
        let (eval, _) = evaluator();
        let expr = parse("2 + 3 * 4").unwrap();
        assert_eq!(
            eval.eval_instant(&expr, 0).await.unwrap(),
            Value::Scalar(14.0)
        );
        let expr = parse("-2 ^ 2").unwrap();
        assert_eq!(
            eval.eval_instant(&expr, 0).await.unwrap(),
            Value::Scalar(-4.0)
        );
    }

    #[tokio::test]
    async fn functions_dispatch_but_do_not_evaluate() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse("rate(metric[5m])").unwrap();
        assert!(matches!(
            eval.eval_instant(&expr, 1000).await,
            Err(Error::UnsupportedFunction { ref name }) if name == "rate"
        ));

        let expr = parse("clamp_max(metric)").unwrap();
        assert!(matches!(
            eval.eval_instant(&expr, 1000).await,
            Err(Error::FunctionArity { got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn matrix_selector_realignment() {
        let (eval, store) = evaluator();
        store.insert_all(
            "metric",
            vec![
                StoreRow {
                    timestamp: 840,
                    value: 0.0,
                    tags: tags(&[("job", "a")]),
                },
                StoreRow {
                    timestamp: 960,
                    value: 120.0,
                    tags: tags(&[("job", "a")]),
                },
            ],
        );
        let expr = parse("metric[5m]").unwrap();
        let Value::Matrix(series) = eval.eval_instant(&expr, 1000).await.unwrap() else {
            panic!("expected matrix");
        };
        assert_eq!(series.len(), 1);
        assert_eq!(
            series[0].points,
            vec![(840, 0.0), (900, 60.0), (960, 120.0)]
        );
    }

    #[tokio::test]
    async fn range_evaluation_steps_the_grid() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse(r#"metric{pod="3"}"#).unwrap();
        let series = eval
            .eval_range(&expr, Window { start: 940, end: 1060 })
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points.len(), 3);
        assert!(series[0].points.iter().all(|(_, v)| *v == 5.0));
    }

    #[tokio::test]
    async fn regex_matcher_fails_at_compile_time() {
        let (eval, store) = evaluator();
        seed_metric(&store);
        let expr = parse(r#"metric{job=~"a.*"}"#).unwrap();
        assert!(matches!(
            eval.eval_instant(&expr, 1000).await,
            Err(Error::UnsupportedOperator { .. })
        ));
    }
}
