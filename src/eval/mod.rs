mod aggregation;
mod binary;
mod functions;
mod histogram;
mod range_functions;
mod value;

use crate::backend::{AggregationKind, Bucket, BucketSpec, BucketStats};
use crate::common::types::{Sample, Timestamp};
use crate::common::{duration_millis, gcd, system_time_to_millis};
use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::labels::Labels;
use crate::leaf::{LeafRequest, LeafResolver, ResolvedSeries, Selector};
use crate::pool::QueryPools;
use ahash::AHashMap;
use futures::future::{try_join, BoxFuture};
use promql_parser::parser::{
    AggregateExpr, AtModifier, BinaryExpr, Call, Expr, MatrixSelector, Offset, SubqueryExpr,
    VectorSelector,
};
use std::sync::Arc;

pub use aggregation::*;
pub use binary::*;
pub use functions::*;
pub use histogram::*;
pub use range_functions::*;
pub use value::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        mod binary_tests;
        mod aggregation_tests;
        mod eval_tests;
        mod functions_tests;
    }
}

/// The timestamps an expression is evaluated at. `step` is the spacing of `times` (the
/// query or subquery step); an instant query has a single time.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRange {
    pub times: Vec<Timestamp>,
    pub step: i64,
    pub instant: bool,
}

impl EvalRange {
    pub fn instant(time: Timestamp) -> Self {
        EvalRange {
            times: vec![time],
            step: 0,
            instant: true,
        }
    }

    /// Every `step` from `start` up to and including `end`.
    pub fn range(start: Timestamp, end: Timestamp, step: i64) -> EngineResult<Self> {
        if step <= 0 {
            return Err(EngineError::parse(
                "zero or negative query resolution step widths are not accepted. Try a positive integer",
            ));
        }
        if end < start {
            return Err(EngineError::parse("end timestamp must not be before start time"));
        }
        let times = (0..)
            .map(|i: i64| start + i * step)
            .take_while(|t| *t <= end)
            .collect();
        Ok(EvalRange {
            times,
            step,
            instant: false,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Walks a PromQL AST, resolving selectors through the leaf resolver.
pub struct Evaluator<'a> {
    resolver: &'a LeafResolver,
    pools: &'a QueryPools,
    lookback_delta: i64,
    default_step: i64,
    query_start: Timestamp,
    query_end: Timestamp,
    instant_query: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        resolver: &'a LeafResolver,
        pools: &'a QueryPools,
        settings: &EngineSettings,
        query_start: Timestamp,
        query_end: Timestamp,
        instant_query: bool,
    ) -> Self {
        Evaluator {
            resolver,
            pools,
            lookback_delta: duration_millis(settings.lookback_delta).max(1),
            default_step: duration_millis(settings.default_step).max(1),
            query_start,
            query_end,
            instant_query,
        }
    }

    // recursive, so the future has to be boxed
    pub fn eval<'b>(&'b self, expr: &'b Expr, range: &'b EvalRange) -> BoxFuture<'b, EngineResult<Value>> {
        Box::pin(async move {
            match expr {
                Expr::NumberLiteral(lit) => Ok(Value::Scalar(vec![lit.val; range.len()])),
                Expr::StringLiteral(lit) => Ok(Value::String(lit.val.clone())),
                Expr::Paren(paren) => self.eval(&paren.expr, range).await,
                Expr::Unary(unary) => negate(self.eval(&unary.expr, range).await?),
                Expr::Binary(binary) => self.eval_binary_expr(binary, range).await,
                Expr::Aggregate(aggregate) => self.eval_aggregate(aggregate, range).await,
                Expr::Call(call) => self.eval_call(call, range).await,
                Expr::VectorSelector(vs) => self.eval_vector_selector(vs, range).await,
                Expr::MatrixSelector(ms) => {
                    let resolution = if range.instant {
                        self.default_step
                    } else {
                        range.step
                    };
                    let interval = gcd(duration_millis(ms.range), resolution);
                    let matrix = self
                        .eval_matrix_selector(ms, range, AggregationKind::Sampling, interval)
                        .await?;
                    Ok(Value::Matrix(matrix))
                }
                Expr::Subquery(sq) => {
                    let matrix = self.eval_subquery(sq, range, AggregationKind::Sampling).await?;
                    Ok(Value::Matrix(matrix))
                }
                Expr::Extension(_) => Err(EngineError::parse("unsupported expression extension")),
            }
        })
    }

    /// Applies `@` and `offset` to every evaluation time.
    fn effective_times(
        &self,
        range: &EvalRange,
        offset: Option<&Offset>,
        at: Option<&AtModifier>,
    ) -> Vec<Timestamp> {
        let pinned = at.map(|at| match at {
            AtModifier::At(time) => system_time_to_millis(*time),
            AtModifier::Start => self.query_start,
            AtModifier::End => self.query_end,
        });
        let shift = match offset {
            Some(Offset::Pos(d)) => duration_millis(*d),
            Some(Offset::Neg(d)) => -duration_millis(*d),
            None => 0,
        };
        range
            .times
            .iter()
            .map(|t| pinned.unwrap_or(*t) - shift)
            .collect()
    }

    async fn resolve(&self, request: LeafRequest) -> EngineResult<Vec<ResolvedSeries>> {
        self.pools.leaf.run(self.resolver.resolve(&request)).await?
    }

    /// Each step takes the latest sample of the bucket `[t - w, t)`, where `w` is the
    /// lookback delta for instant queries and the step otherwise.
    async fn eval_vector_selector(&self, vs: &VectorSelector, range: &EvalRange) -> EngineResult<Value> {
        let selector = Arc::new(Selector::from_vector_selector(vs)?);
        let times = self.effective_times(range, vs.offset.as_ref(), vs.at.as_ref());
        let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) else {
            return Ok(Value::Vector(Vec::new()));
        };
        let window = if range.instant || range.step <= 0 {
            self.lookback_delta
        } else {
            range.step
        };

        let series = self
            .resolve(LeafRequest {
                selector,
                start: min - window,
                end: *max,
                bucket: BucketSpec {
                    kind: AggregationKind::Sampling,
                    interval: window,
                    anchor: min - window,
                },
            })
            .await?;

        let steps = times
            .iter()
            .map(|t| {
                let key = t - window;
                series
                    .iter()
                    .filter_map(|s| {
                        let idx = s.buckets.binary_search_by_key(&key, |b| b.timestamp).ok()?;
                        let sample = s.buckets[idx].stats.last_sample()?;
                        Some(StepSample::new(s.labels.clone(), sample.value))
                    })
                    .collect()
            })
            .collect();
        Ok(Value::Vector(steps))
    }

    async fn eval_matrix_selector(
        &self,
        ms: &MatrixSelector,
        range: &EvalRange,
        kind: AggregationKind,
        interval: i64,
    ) -> EngineResult<RangeVector> {
        let range_ms = duration_millis(ms.range);
        let selector = Arc::new(Selector::from_vector_selector(&ms.vs)?);
        let times = self.effective_times(range, ms.vs.offset.as_ref(), ms.vs.at.as_ref());
        let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) else {
            return Ok(RangeVector {
                series: Vec::new(),
                range: range_ms,
                times,
            });
        };
        let start = min - range_ms;
        let series = self
            .resolve(LeafRequest {
                selector,
                start,
                end: *max,
                bucket: BucketSpec {
                    kind,
                    interval: interval.max(1),
                    anchor: start,
                },
            })
            .await?;
        Ok(RangeVector {
            series: series
                .into_iter()
                .map(|s| RangeSeries::new(s.labels, s.buckets))
                .collect(),
            range: range_ms,
            times,
        })
    }

    /// Evaluates the inner expression at every multiple of the subquery step inside the
    /// outer windows; each result sample becomes a single-sample bucket.
    async fn eval_subquery(
        &self,
        sq: &SubqueryExpr,
        range: &EvalRange,
        kind: AggregationKind,
    ) -> EngineResult<RangeVector> {
        let range_ms = duration_millis(sq.range);
        let step = sq
            .step
            .map(duration_millis)
            .unwrap_or(self.default_step)
            .max(1);
        let times = self.effective_times(range, sq.offset.as_ref(), sq.at.as_ref());
        let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) else {
            return Ok(RangeVector {
                series: Vec::new(),
                range: range_ms,
                times,
            });
        };

        let start = min - range_ms;
        let mut first = start.div_euclid(step) * step;
        if first < start {
            first += step;
        }
        let inner = EvalRange {
            times: (0..)
                .map(|i: i64| first + i * step)
                .take_while(|t| t < max)
                .collect(),
            step,
            instant: false,
        };
        let steps = self.eval(&sq.expr, &inner).await?.into_vector("subquery")?;

        let mut index: AHashMap<u64, usize> = AHashMap::new();
        let mut series: Vec<(Arc<Labels>, Vec<Bucket>)> = Vec::new();
        for (t, vector) in inner.times.iter().zip(steps) {
            for sample in vector {
                let idx = *index.entry(sample.labels.hash_all()).or_insert_with(|| {
                    series.push((sample.labels.clone(), Vec::new()));
                    series.len() - 1
                });
                series[idx].1.push(Bucket {
                    timestamp: *t,
                    stats: BucketStats::from_sample(kind, Sample::new(*t, sample.value)),
                });
            }
        }
        Ok(RangeVector {
            series: series
                .into_iter()
                .map(|(labels, buckets)| RangeSeries::new(labels, buckets))
                .collect(),
            range: range_ms,
            times,
        })
    }

    /// Range-vector argument of a range function. One bucket per window for instant
    /// evaluation, otherwise buckets of `gcd(range, step)` shared by overlapping windows.
    async fn eval_range_argument(
        &self,
        expr: &Expr,
        range: &EvalRange,
        func: RangeFunction,
    ) -> EngineResult<RangeVector> {
        let kind = func.aggregation_kind();
        let mut expr = expr;
        while let Expr::Paren(paren) = expr {
            expr = &paren.expr;
        }
        match expr {
            Expr::MatrixSelector(ms) => {
                let range_ms = duration_millis(ms.range);
                let interval = if range.instant || range.step <= 0 {
                    range_ms
                } else {
                    gcd(range_ms, range.step)
                };
                self.eval_matrix_selector(ms, range, kind, interval).await
            }
            Expr::Subquery(sq) => self.eval_subquery(sq, range, kind).await,
            other => {
                let got = match other {
                    Expr::NumberLiteral(_) => "scalar",
                    Expr::StringLiteral(_) => "string",
                    _ => "instant vector",
                };
                Err(EngineError::parse(format!(
                    "expected type range vector in call to function \"{}\", got {got}",
                    func.name()
                )))
            }
        }
    }

    async fn eval_binary_expr(&self, binary: &BinaryExpr, range: &EvalRange) -> EngineResult<Value> {
        let op = BinaryOp::from_token(binary.op)?;
        let matching = VectorMatching::from_modifier(binary.modifier.as_ref());
        let (lhs, rhs) = try_join(self.eval(&binary.lhs, range), self.eval(&binary.rhs, range)).await?;
        eval_binary(op, lhs, rhs, &matching)
    }

    async fn eval_aggregate(&self, aggregate: &AggregateExpr, range: &EvalRange) -> EngineResult<Value> {
        let op = AggregateOp::from_token(aggregate.op)?;
        let grouping = Grouping::from_modifier(aggregate.modifier.as_ref());
        let params = match (&aggregate.param, op.takes_param()) {
            (Some(param), true) => {
                let context = format!("aggregation parameter of {}", op.as_str());
                Some(self.eval(param, range).await?.into_scalar(&context)?)
            }
            _ => None,
        };
        let steps = self
            .eval(&aggregate.expr, range)
            .await?
            .into_vector(&format!("aggregation expression of {}", op.as_str()))?;

        let result = steps
            .into_iter()
            .enumerate()
            .map(|(i, vector)| {
                let param = params.as_ref().and_then(|p| p.get(i).copied());
                aggregate_step(op, vector, &grouping, param)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Value::Vector(result))
    }

    async fn eval_call(&self, call: &Call, range: &EvalRange) -> EngineResult<Value> {
        let name = call.func.name;
        let func = Function::from_name(name)?;
        let args = &call.args.args;
        func.check_arity(name, args.len())?;
        let context = format!("call to function \"{name}\"");

        let value = match func {
            Function::Time => Value::Scalar(eval_time(&range.times)),
            Function::Math(math) => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                Value::Vector(eval_math(math, steps))
            }
            Function::Range(range_func) => {
                let matrix = self.eval_range_argument(&args[0], range, range_func).await?;
                Value::Vector(eval_range_function(range_func, &matrix)?)
            }
            Function::Sort | Function::SortDesc => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                Value::Vector(eval_sort(
                    name,
                    func == Function::SortDesc,
                    self.instant_query,
                    steps,
                )?)
            }
            Function::Scalar => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                Value::Scalar(eval_scalar(steps))
            }
            Function::Vector => {
                let values = self.eval(&args[0], range).await?.into_scalar(&context)?;
                Value::Vector(eval_vector(values))
            }
            Function::HistogramQuantile => {
                let (phi, buckets) =
                    try_join(self.eval(&args[0], range), self.eval(&args[1], range)).await?;
                let phis = phi.into_scalar(&context)?;
                let steps = buckets.into_vector(&context)?;
                Value::Vector(histogram_quantile(&phis, steps))
            }
            Function::Clamp | Function::ClampMin | Function::ClampMax => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                let first = self.eval(&args[1], range).await?.into_scalar(&context)?;
                let value = match func {
                    Function::Clamp => {
                        let upper = self.eval(&args[2], range).await?.into_scalar(&context)?;
                        eval_clamp(steps, Some(&first), Some(&upper))
                    }
                    Function::ClampMin => eval_clamp(steps, Some(&first), None),
                    _ => eval_clamp(steps, None, Some(&first)),
                };
                Value::Vector(value)
            }
            Function::LabelReplace => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                let mut strings = Vec::with_capacity(4);
                for arg in &args[1..] {
                    strings.push(self.eval(arg, range).await?.into_string(&context)?);
                }
                Value::Vector(eval_label_replace(
                    steps,
                    &strings[0],
                    &strings[1],
                    &strings[2],
                    &strings[3],
                )?)
            }
            Function::LabelJoin => {
                let steps = self.eval(&args[0], range).await?.into_vector(&context)?;
                let mut strings = Vec::with_capacity(args.len() - 1);
                for arg in &args[1..] {
                    strings.push(self.eval(arg, range).await?.into_string(&context)?);
                }
                Value::Vector(eval_label_join(steps, &strings[0], &strings[1], &strings[2..])?)
            }
        };
        Ok(value)
    }
}

fn negate(value: Value) -> EngineResult<Value> {
    match value {
        Value::Scalar(values) => Ok(Value::Scalar(values.into_iter().map(|v| -v).collect())),
        Value::Vector(steps) => Ok(Value::Vector(
            steps
                .into_iter()
                .map(|vector| {
                    vector
                        .into_iter()
                        .map(|s| StepSample::new(drop_metric_name(&s.labels), -s.value))
                        .collect()
                })
                .collect(),
        )),
        other => Err(EngineError::parse(format!(
            "unary expression only allowed on expressions of type scalar or instant vector, got {}",
            other.type_name()
        ))),
    }
}
