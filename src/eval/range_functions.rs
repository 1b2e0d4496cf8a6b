use super::value::{check_unique_labelsets, drop_metric_name, InstantVector, RangeVector, StepSample};
use crate::backend::{AggregationKind, Bucket, BucketStats};
use crate::common::types::{Sample, Timestamp};
use crate::error::EngineResult;

/// Functions taking a range vector, each evaluated from the bucket aggregates of its window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RangeFunction {
    Rate,
    Increase,
    Irate,
    Delta,
    Changes,
    AvgOverTime,
    SumOverTime,
    MinOverTime,
    MaxOverTime,
    CountOverTime,
}

impl RangeFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        use RangeFunction::*;
        let func = match name {
            "rate" => Rate,
            "increase" => Increase,
            "irate" => Irate,
            "delta" => Delta,
            "changes" => Changes,
            "avg_over_time" => AvgOverTime,
            "sum_over_time" => SumOverTime,
            "min_over_time" => MinOverTime,
            "max_over_time" => MaxOverTime,
            "count_over_time" => CountOverTime,
            _ => return None,
        };
        Some(func)
    }

    pub const fn name(&self) -> &'static str {
        use RangeFunction::*;
        match self {
            Rate => "rate",
            Increase => "increase",
            Irate => "irate",
            Delta => "delta",
            Changes => "changes",
            AvgOverTime => "avg_over_time",
            SumOverTime => "sum_over_time",
            MinOverTime => "min_over_time",
            MaxOverTime => "max_over_time",
            CountOverTime => "count_over_time",
        }
    }

    /// The per-bucket aggregate the backend must compute for this function.
    pub const fn aggregation_kind(&self) -> AggregationKind {
        use RangeFunction::*;
        match self {
            Rate | Increase => AggregationKind::Rate,
            Irate => AggregationKind::Irate,
            Delta => AggregationKind::Delta,
            Changes => AggregationKind::Changes,
            AvgOverTime | SumOverTime | MinOverTime | MaxOverTime | CountOverTime => {
                AggregationKind::Stats
            }
        }
    }

    /// Value over the buckets of one window `[start, end)`. `None` when the window holds
    /// too few samples.
    pub fn eval_window(&self, buckets: &[Bucket], start: Timestamp, end: Timestamp) -> Option<f64> {
        if buckets.is_empty() {
            return None;
        }
        use RangeFunction::*;
        match self {
            Rate => extrapolated_rate(buckets, start, end, true, true),
            Increase => extrapolated_rate(buckets, start, end, true, false),
            Delta => extrapolated_rate(buckets, start, end, false, false),
            Irate => instant_rate(buckets),
            Changes => Some(changes(buckets)),
            AvgOverTime | SumOverTime | MinOverTime | MaxOverTime | CountOverTime => {
                self.over_time(buckets)
            }
        }
    }

    fn over_time(&self, buckets: &[Bucket]) -> Option<f64> {
        let mut count: u64 = 0;
        let mut sum = 0.0;
        let mut min = f64::NAN;
        let mut max = f64::NAN;
        for bucket in buckets {
            match bucket.stats {
                BucketStats::Stats {
                    count: n,
                    sum: s,
                    min: lo,
                    max: hi,
                } => {
                    count += n;
                    sum += s;
                    if min.is_nan() || lo < min {
                        min = lo;
                    }
                    if max.is_nan() || hi > max {
                        max = hi;
                    }
                }
                _ => {
                    let sample = bucket.stats.last_sample()?;
                    count += 1;
                    sum += sample.value;
                    if min.is_nan() || sample.value < min {
                        min = sample.value;
                    }
                    if max.is_nan() || sample.value > max {
                        max = sample.value;
                    }
                }
            }
        }
        if count == 0 {
            return None;
        }
        let value = match self {
            RangeFunction::SumOverTime => sum,
            RangeFunction::AvgOverTime => sum / count as f64,
            RangeFunction::MinOverTime => min,
            RangeFunction::MaxOverTime => max,
            _ => count as f64,
        };
        Some(value)
    }
}

/// First and last sample of a window with the counter correction accumulated across it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WindowEnds {
    first: Sample,
    last: Sample,
    correction: f64,
    count: u64,
}

fn bucket_ends(stats: &BucketStats) -> Option<WindowEnds> {
    let ends = match stats {
        BucketStats::Range {
            first,
            last,
            correction,
            count,
        } => WindowEnds {
            first: *first,
            last: *last,
            correction: *correction,
            count: *count,
        },
        BucketStats::Changes {
            first, last, count, ..
        } => WindowEnds {
            first: *first,
            last: *last,
            correction: 0.0,
            count: *count,
        },
        other => {
            let sample = other.last_sample()?;
            WindowEnds {
                first: sample,
                last: sample,
                correction: 0.0,
                count: 1,
            }
        }
    };
    Some(ends)
}

/// Joins consecutive buckets. A bucket starting below the previous bucket's last value is a
/// counter reset between the two.
fn window_ends(buckets: &[Bucket], counter: bool) -> Option<WindowEnds> {
    let mut iter = buckets.iter().filter_map(|b| bucket_ends(&b.stats));
    let mut acc = iter.next()?;
    if !counter {
        acc.correction = 0.0;
    }
    for next in iter {
        if counter {
            acc.correction += next.correction;
            if next.first.value < acc.last.value {
                acc.correction += acc.last.value;
            }
        }
        acc.last = next.last;
        acc.count += next.count;
    }
    Some(acc)
}

/// Prometheus extrapolated rate over `[range_start, range_end)`.
fn extrapolated_rate(
    buckets: &[Bucket],
    range_start: Timestamp,
    range_end: Timestamp,
    is_counter: bool,
    is_rate: bool,
) -> Option<f64> {
    let ends = window_ends(buckets, is_counter)?;
    if ends.count < 2 {
        return None;
    }

    let mut result = ends.last.value - ends.first.value + ends.correction;
    let sampled_interval = (ends.last.timestamp - ends.first.timestamp) as f64 / 1000.0;
    if sampled_interval <= 0.0 {
        return None;
    }
    let mut duration_to_start = (ends.first.timestamp - range_start) as f64 / 1000.0;
    let duration_to_end = (range_end - ends.last.timestamp) as f64 / 1000.0;
    let average_between_samples = sampled_interval / (ends.count - 1) as f64;

    // a counter cannot extrapolate below zero
    if is_counter && result > 0.0 && ends.first.value >= 0.0 {
        let duration_to_zero = sampled_interval * (ends.first.value / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let threshold = average_between_samples * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        average_between_samples / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        average_between_samples / 2.0
    };

    result *= extrapolate_to / sampled_interval;
    if is_rate {
        result /= (range_end - range_start) as f64 / 1000.0;
    }
    Some(result)
}

/// Per-second rate between the last two samples of the window.
fn instant_rate(buckets: &[Bucket]) -> Option<f64> {
    let mut samples: Vec<Sample> = Vec::with_capacity(2);
    for bucket in buckets.iter().rev() {
        match &bucket.stats {
            BucketStats::Recent { last, previous, .. } => {
                samples.push(*last);
                if let Some(previous) = previous {
                    samples.push(*previous);
                }
            }
            other => samples.extend(other.last_sample()),
        }
        if samples.len() >= 2 {
            break;
        }
    }
    if samples.len() < 2 {
        return None;
    }
    let (last, previous) = (samples[0], samples[1]);
    let interval = (last.timestamp - previous.timestamp) as f64 / 1000.0;
    if interval <= 0.0 {
        return None;
    }
    let delta = if last.value < previous.value {
        // counter reset
        last.value
    } else {
        last.value - previous.value
    };
    Some(delta / interval)
}

fn changes(buckets: &[Bucket]) -> f64 {
    let mut total = 0.0;
    let mut prev_last: Option<f64> = None;
    for bucket in buckets {
        let Some(ends) = bucket_ends(&bucket.stats) else {
            continue;
        };
        if let BucketStats::Changes { changes, .. } = bucket.stats {
            total += changes;
        }
        if let Some(prev) = prev_last {
            if prev != ends.first.value && !(prev.is_nan() && ends.first.value.is_nan()) {
                total += 1.0;
            }
        }
        prev_last = Some(ends.last.value);
    }
    total
}

/// Applies `func` to every series of `range` at every step.
pub fn eval_range_function(func: RangeFunction, range: &RangeVector) -> EngineResult<Vec<InstantVector>> {
    let labels: Vec<_> = range.series.iter().map(|s| drop_metric_name(&s.labels)).collect();
    let mut steps = Vec::with_capacity(range.times.len());
    for (step, end) in range.times.iter().enumerate() {
        let start = end - range.range;
        let mut vector = Vec::new();
        for (series, labels) in range.series.iter().zip(labels.iter()) {
            let window = range.window_of(series, step);
            if let Some(value) = func.eval_window(window, start, *end) {
                vector.push(StepSample::new(labels.clone(), value));
            }
        }
        check_unique_labelsets(&vector)?;
        steps.push(vector);
    }
    Ok(steps)
}
