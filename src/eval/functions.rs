use super::range_functions::RangeFunction;
use super::value::{check_unique_labelsets, drop_metric_name, InstantVector, StepSample};
use crate::common::types::Timestamp;
use crate::error::{EngineError, EngineResult};
use crate::labels::Labels;
use regex::Regex;
use std::cmp::Ordering;
use std::sync::Arc;

/// Element-wise math over an instant vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Abs,
    Ceil,
    Floor,
    Exp,
    Sqrt,
    Ln,
    Log2,
    Log10,
}

impl MathFunction {
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            MathFunction::Abs => value.abs(),
            MathFunction::Ceil => value.ceil(),
            MathFunction::Floor => value.floor(),
            MathFunction::Exp => value.exp(),
            MathFunction::Sqrt => value.sqrt(),
            MathFunction::Ln => value.ln(),
            MathFunction::Log2 => value.log2(),
            MathFunction::Log10 => value.log10(),
        }
    }
}

/// Every function call the evaluator understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Function {
    Math(MathFunction),
    Range(RangeFunction),
    Sort,
    SortDesc,
    Time,
    Scalar,
    Vector,
    HistogramQuantile,
    Clamp,
    ClampMin,
    ClampMax,
    LabelReplace,
    LabelJoin,
}

impl Function {
    pub fn from_name(name: &str) -> EngineResult<Self> {
        let func = match name {
            "abs" => Function::Math(MathFunction::Abs),
            "ceil" => Function::Math(MathFunction::Ceil),
            "floor" => Function::Math(MathFunction::Floor),
            "exp" => Function::Math(MathFunction::Exp),
            "sqrt" => Function::Math(MathFunction::Sqrt),
            "ln" => Function::Math(MathFunction::Ln),
            "log2" => Function::Math(MathFunction::Log2),
            "log10" => Function::Math(MathFunction::Log10),
            "sort" => Function::Sort,
            "sort_desc" => Function::SortDesc,
            "time" => Function::Time,
            "scalar" => Function::Scalar,
            "vector" => Function::Vector,
            "histogram_quantile" => Function::HistogramQuantile,
            "clamp" => Function::Clamp,
            "clamp_min" => Function::ClampMin,
            "clamp_max" => Function::ClampMax,
            "label_replace" => Function::LabelReplace,
            "label_join" => Function::LabelJoin,
            other => match RangeFunction::from_name(other) {
                Some(range) => Function::Range(range),
                None => {
                    return Err(EngineError::parse(format!(
                        "unsupported function \"{other}\""
                    )))
                }
            },
        };
        Ok(func)
    }

    /// Smallest and largest accepted argument count; `None` when variadic.
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::Time => (0, Some(0)),
            Function::HistogramQuantile | Function::ClampMin | Function::ClampMax => (2, Some(2)),
            Function::Clamp => (3, Some(3)),
            Function::LabelReplace => (5, Some(5)),
            Function::LabelJoin => (3, None),
            _ => (1, Some(1)),
        }
    }

    pub fn check_arity(&self, name: &str, count: usize) -> EngineResult<()> {
        let (min, max) = self.arity();
        let expected = match max {
            Some(max) if count > max || count < min => format!("{max}"),
            None if count < min => format!("at least {min}"),
            _ => return Ok(()),
        };
        Err(EngineError::parse(format!(
            "expected {expected} argument(s) in call to \"{name}\", got {count}"
        )))
    }
}

pub fn eval_math(func: MathFunction, steps: Vec<InstantVector>) -> Vec<InstantVector> {
    steps
        .into_iter()
        .map(|vector| {
            vector
                .into_iter()
                .map(|s| StepSample::new(drop_metric_name(&s.labels), func.apply(s.value)))
                .collect()
        })
        .collect()
}

/// `sort`/`sort_desc`. Only instant queries have a meaningful order; NaN sorts last in
/// both directions.
pub fn eval_sort(
    name: &str,
    descending: bool,
    instant_query: bool,
    mut steps: Vec<InstantVector>,
) -> EngineResult<Vec<InstantVector>> {
    if !instant_query {
        return Err(EngineError::RequestShape(format!(
            "'{name}' can not be used in the query_range requests."
        )));
    }
    for vector in steps.iter_mut() {
        vector.sort_by(|a, b| match (a.value.is_nan(), b.value.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.value.partial_cmp(&b.value).unwrap_or(Ordering::Equal);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        });
    }
    Ok(steps)
}

/// `time()`: evaluation timestamp in seconds.
pub fn eval_time(times: &[Timestamp]) -> Vec<f64> {
    times.iter().map(|t| *t as f64 / 1000.0).collect()
}

/// `scalar(v)`: the single element's value, NaN otherwise.
pub fn eval_scalar(steps: Vec<InstantVector>) -> Vec<f64> {
    steps
        .into_iter()
        .map(|vector| match vector.as_slice() {
            [only] => only.value,
            _ => f64::NAN,
        })
        .collect()
}

/// `vector(s)`: one label-less element per step.
pub fn eval_vector(values: Vec<f64>) -> Vec<InstantVector> {
    let labels = Arc::new(Labels::empty());
    values
        .into_iter()
        .map(|value| vec![StepSample::new(labels.clone(), value)])
        .collect()
}

/// `clamp`, `clamp_min` and `clamp_max`. A missing bound is unbounded; a step whose lower
/// bound exceeds its upper one is empty.
pub fn eval_clamp(
    steps: Vec<InstantVector>,
    lower: Option<&[f64]>,
    upper: Option<&[f64]>,
) -> Vec<InstantVector> {
    let bound = |bounds: Option<&[f64]>, i: usize, unbounded: f64| {
        bounds.map_or(unbounded, |b| b.get(i).copied().unwrap_or(f64::NAN))
    };
    steps
        .into_iter()
        .enumerate()
        .map(|(i, vector)| {
            let lo = bound(lower, i, f64::NEG_INFINITY);
            let hi = bound(upper, i, f64::INFINITY);
            if lo > hi {
                return Vec::new();
            }
            vector
                .into_iter()
                .map(|s| {
                    let value = if s.value.is_nan() || lo.is_nan() || hi.is_nan() {
                        f64::NAN
                    } else {
                        s.value.min(hi).max(lo)
                    };
                    StepSample::new(drop_metric_name(&s.labels), value)
                })
                .collect()
        })
        .collect()
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_destination(func: &str, dst: &str) -> EngineResult<()> {
    if is_valid_label_name(dst) {
        Ok(())
    } else {
        Err(EngineError::parse(format!("invalid destination label name in {func}(): {dst}")))
    }
}

/// Sets `dst` to `value`, removing it when `value` is empty.
fn set_label(labels: &Labels, dst: &str, value: &str) -> Labels {
    if value.is_empty() {
        labels.without(dst)
    } else {
        labels.with(dst, value)
    }
}

/// Applies `relabel` to every element, failing when a step ends up with duplicate label sets.
fn relabel_steps(
    steps: Vec<InstantVector>,
    relabel: impl Fn(&Labels) -> Option<Labels>,
) -> EngineResult<Vec<InstantVector>> {
    let mut result = Vec::with_capacity(steps.len());
    for vector in steps {
        let vector: InstantVector = vector
            .into_iter()
            .map(|s| match relabel(&*s.labels) {
                Some(labels) => StepSample::new(Arc::new(labels), s.value),
                None => s,
            })
            .collect();
        check_unique_labelsets(&vector)?;
        result.push(vector);
    }
    Ok(result)
}

/// `label_replace(v, dst, replacement, src, regex)`. The regex is anchored at both ends;
/// elements whose `src` value does not match are passed through.
pub fn eval_label_replace(
    steps: Vec<InstantVector>,
    dst: &str,
    replacement: &str,
    src: &str,
    pattern: &str,
) -> EngineResult<Vec<InstantVector>> {
    let regex = Regex::new(&format!("^(?s:{pattern})$")).map_err(|e| {
        EngineError::parse(format!("invalid regular expression in label_replace(): {pattern}: {e}"))
    })?;
    check_destination("label_replace", dst)?;
    relabel_steps(steps, |labels| {
        let captures = regex.captures(labels.get(src).unwrap_or(""))?;
        let mut value = String::new();
        captures.expand(replacement, &mut value);
        Some(set_label(labels, dst, &value))
    })
}

/// `label_join(v, dst, separator, src...)`.
pub fn eval_label_join(
    steps: Vec<InstantVector>,
    dst: &str,
    separator: &str,
    sources: &[String],
) -> EngineResult<Vec<InstantVector>> {
    check_destination("label_join", dst)?;
    for src in sources {
        if !is_valid_label_name(src) {
            return Err(EngineError::parse(format!("invalid source label name in label_join(): {src}")));
        }
    }
    relabel_steps(steps, |labels| {
        let value = sources
            .iter()
            .map(|src| labels.get(src).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(separator);
        Some(set_label(labels, dst, &value))
    })
}
