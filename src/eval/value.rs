use crate::backend::Bucket;
use crate::common::types::Timestamp;
use crate::error::{EngineError, EngineResult};
use crate::labels::Labels;
use crate::series::get_window_bounds;
use ahash::AHashSet;
use std::sync::Arc;

/// One element of an instant vector at a single evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSample {
    pub labels: Arc<Labels>,
    pub value: f64,
}

impl StepSample {
    pub fn new(labels: Arc<Labels>, value: f64) -> Self {
        StepSample { labels, value }
    }
}

pub type InstantVector = Vec<StepSample>;

/// Buckets of one series inside a range vector.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSeries {
    pub labels: Arc<Labels>,
    pub buckets: Vec<Bucket>,
    keys: Vec<Timestamp>,
}

impl RangeSeries {
    pub fn new(labels: Arc<Labels>, buckets: Vec<Bucket>) -> Self {
        let keys = buckets.iter().map(|b| b.timestamp).collect();
        RangeSeries {
            labels,
            buckets,
            keys,
        }
    }

    /// Buckets whose key lies in `[start, end)`.
    pub fn window(&self, start: Timestamp, end: Timestamp) -> &[Bucket] {
        &self.buckets[get_window_bounds(&self.keys, start, end)]
    }
}

/// A range vector: per-series buckets plus, for every evaluation step, the time its
/// window ends at (offset and `@` already applied).
#[derive(Debug, Clone, PartialEq)]
pub struct RangeVector {
    pub series: Vec<RangeSeries>,
    pub range: i64,
    pub times: Vec<Timestamp>,
}

impl RangeVector {
    pub fn window_of<'a>(&self, series: &'a RangeSeries, step: usize) -> &'a [Bucket] {
        let end = self.times[step];
        series.window(end - self.range, end)
    }
}

/// Result of evaluating an expression over every step of an evaluation range. Scalars and
/// instant vectors hold one entry per step.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Vec<f64>),
    Vector(Vec<InstantVector>),
    Matrix(RangeVector),
    String(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Vector(_) => "instant vector",
            Value::Matrix(_) => "range vector",
            Value::String(_) => "string",
        }
    }

    pub fn into_vector(self, context: &str) -> EngineResult<Vec<InstantVector>> {
        match self {
            Value::Vector(steps) => Ok(steps),
            other => Err(EngineError::parse(format!(
                "expected type instant vector in {context}, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn into_string(self, context: &str) -> EngineResult<String> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(EngineError::parse(format!(
                "expected type string in {context}, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn into_scalar(self, context: &str) -> EngineResult<Vec<f64>> {
        match self {
            Value::Scalar(values) => Ok(values),
            other => Err(EngineError::parse(format!(
                "expected type scalar in {context}, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Fails when two elements of one step carry identical label sets.
pub fn check_unique_labelsets(vector: &[StepSample]) -> EngineResult<()> {
    if vector.len() < 2 {
        return Ok(());
    }
    let mut seen = AHashSet::with_capacity(vector.len());
    for sample in vector {
        if !seen.insert(sample.labels.hash_all()) {
            return Err(EngineError::execution(
                "vector cannot contain metrics with the same labelset",
            ));
        }
    }
    Ok(())
}

/// Drops the metric name, reusing the label set when there is none.
pub fn drop_metric_name(labels: &Arc<Labels>) -> Arc<Labels> {
    if labels.metric_name().is_some() {
        Arc::new(labels.without_metric_name())
    } else {
        labels.clone()
    }
}
