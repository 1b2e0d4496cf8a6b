use super::AggregationKind;
use crate::common::types::{Sample, Timestamp};
use crate::error::{EngineError, EngineResult};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Per-bucket result of the value aggregation, normalized by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketStats {
    /// Latest sample of the bucket
    Sample(Sample),
    /// First and last sample. For counters `correction` holds the sum of the values lost
    /// to resets inside the bucket.
    Range {
        first: Sample,
        last: Sample,
        correction: f64,
        count: u64,
    },
    /// Last two samples of the bucket
    Recent {
        last: Sample,
        previous: Option<Sample>,
        count: u64,
    },
    Changes {
        first: Sample,
        last: Sample,
        changes: f64,
        count: u64,
    },
    Stats {
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
}

impl BucketStats {
    /// A bucket holding exactly one sample, shaped for `kind`.
    pub fn from_sample(kind: AggregationKind, sample: Sample) -> Self {
        match kind {
            AggregationKind::Sampling => BucketStats::Sample(sample),
            AggregationKind::Rate | AggregationKind::Delta => BucketStats::Range {
                first: sample,
                last: sample,
                correction: 0.0,
                count: 1,
            },
            AggregationKind::Irate => BucketStats::Recent {
                last: sample,
                previous: None,
                count: 1,
            },
            AggregationKind::Changes => BucketStats::Changes {
                first: sample,
                last: sample,
                changes: 0.0,
                count: 1,
            },
            AggregationKind::Stats => BucketStats::Stats {
                count: 1,
                sum: sample.value,
                min: sample.value,
                max: sample.value,
            },
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            BucketStats::Sample(_) => 1,
            BucketStats::Range { count, .. }
            | BucketStats::Recent { count, .. }
            | BucketStats::Changes { count, .. }
            | BucketStats::Stats { count, .. } => *count,
        }
    }

    /// Latest sample of the bucket, where the kind carries one.
    pub fn last_sample(&self) -> Option<Sample> {
        match self {
            BucketStats::Sample(sample) => Some(*sample),
            BucketStats::Range { last, .. }
            | BucketStats::Recent { last, .. }
            | BucketStats::Changes { last, .. } => Some(*last),
            BucketStats::Stats { .. } => None,
        }
    }

    /// Combines the reports of two shards for the same series and bucket. Shards hold
    /// disjoint documents, so additive quantities add up and boundary samples are picked by
    /// timestamp. A boundary reset or change is only counted when one half ends before the
    /// other starts; interleaved halves keep just the per-shard counts.
    pub fn merge(self, other: BucketStats) -> EngineResult<BucketStats> {
        use BucketStats::*;
        let merged = match (self, other) {
            (Sample(a), Sample(b)) => Sample(pick_latest(a, b)),
            (
                Range {
                    first: f1,
                    last: l1,
                    correction: c1,
                    count: n1,
                },
                Range {
                    first: f2,
                    last: l2,
                    correction: c2,
                    count: n2,
                },
            ) => {
                let ((ef, el), (lf, ll)) = if f1.timestamp <= f2.timestamp {
                    ((f1, l1), (f2, l2))
                } else {
                    ((f2, l2), (f1, l1))
                };
                let mut correction = c1 + c2;
                // a reset between the halves is only visible when they do not interleave
                if el.timestamp < lf.timestamp && lf.value < el.value {
                    correction += el.value;
                }
                Range {
                    first: ef,
                    last: pick_latest(el, ll),
                    correction,
                    count: n1 + n2,
                }
            }
            (
                Recent {
                    last: l1,
                    previous: p1,
                    count: n1,
                },
                Recent {
                    last: l2,
                    previous: p2,
                    count: n2,
                },
            ) => {
                let mut samples: Vec<crate::common::types::Sample> =
                    [Some(l1), p1, Some(l2), p2].into_iter().flatten().collect();
                samples.sort_by_key(|s| s.timestamp);
                samples.dedup_by_key(|s| s.timestamp);
                let last = samples.pop().unwrap_or(l1);
                Recent {
                    last,
                    previous: samples.pop(),
                    count: n1 + n2,
                }
            }
            (
                Changes {
                    first: f1,
                    last: l1,
                    changes: c1,
                    count: n1,
                },
                Changes {
                    first: f2,
                    last: l2,
                    changes: c2,
                    count: n2,
                },
            ) => {
                let ((ef, el), (lf, ll)) = if f1.timestamp <= f2.timestamp {
                    ((f1, l1), (f2, l2))
                } else {
                    ((f2, l2), (f1, l1))
                };
                let mut changes = c1 + c2;
                if el.timestamp < lf.timestamp && lf.value != el.value {
                    changes += 1.0;
                }
                Changes {
                    first: ef,
                    last: pick_latest(el, ll),
                    changes,
                    count: n1 + n2,
                }
            }
            (
                Stats {
                    count: n1,
                    sum: s1,
                    min: lo1,
                    max: hi1,
                },
                Stats {
                    count: n2,
                    sum: s2,
                    min: lo2,
                    max: hi2,
                },
            ) => Stats {
                count: n1 + n2,
                sum: s1 + s2,
                min: lo1.min(lo2),
                max: hi1.max(hi2),
            },
            (a, b) => {
                return Err(EngineError::backend(format!(
                    "cannot merge buckets of different kinds: {a:?} and {b:?}"
                )))
            }
        };
        Ok(merged)
    }
}

/// Later timestamp wins; on equal timestamps the larger value wins.
pub fn pick_latest(a: Sample, b: Sample) -> Sample {
    match a.timestamp.cmp(&b.timestamp) {
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Equal => {
            if b.value > a.value || a.value.is_nan() {
                b
            } else {
                a
            }
        }
    }
}

/// One date-histogram bucket. `timestamp` is the bucket key (its start).
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub timestamp: Timestamp,
    pub stats: BucketStats,
}

/// Buckets of one series as reported by one shard, ordered by key.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSeries {
    pub key: String,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    timed_out: bool,
    #[serde(default)]
    error: Option<JsonValue>,
    #[serde(rename = "_shards", default)]
    shards: Option<ShardsInfo>,
    #[serde(default)]
    aggregations: Option<Aggregations>,
}

#[derive(Debug, Deserialize)]
struct ShardsInfo {
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    failures: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct Aggregations {
    series: BucketList<SeriesBucket>,
}

#[derive(Debug, Deserialize)]
struct BucketList<B> {
    #[serde(default = "Vec::new")]
    buckets: Vec<B>,
}

#[derive(Debug, Deserialize)]
struct SeriesBucket {
    key: String,
    #[serde(default)]
    time: Option<BucketList<TimeBucket>>,
}

#[derive(Debug, Deserialize)]
struct TimeBucket {
    key: Timestamp,
    #[serde(default)]
    doc_count: u64,
    #[serde(default)]
    value: Option<RawValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawValue {
    value: Option<f64>,
    timestamp: Option<Timestamp>,
    first_value: Option<f64>,
    first_timestamp: Option<Timestamp>,
    last_value: Option<f64>,
    last_timestamp: Option<Timestamp>,
    previous_value: Option<f64>,
    previous_timestamp: Option<Timestamp>,
    counter_correction: Option<f64>,
    changes: Option<f64>,
    count: Option<u64>,
    min: Option<f64>,
    max: Option<f64>,
    sum: Option<f64>,
}

fn required<T>(field: Option<T>, name: &str, kind: AggregationKind) -> EngineResult<T> {
    field.ok_or_else(|| {
        EngineError::backend(format!("malformed backend response: {kind} bucket without `{name}`"))
    })
}

impl RawValue {
    fn sample(&self, kind: AggregationKind) -> EngineResult<Sample> {
        Ok(Sample::new(
            required(self.timestamp, "timestamp", kind)?,
            required(self.value, "value", kind)?,
        ))
    }

    fn first(&self, kind: AggregationKind) -> EngineResult<Sample> {
        Ok(Sample::new(
            required(self.first_timestamp, "first_timestamp", kind)?,
            required(self.first_value, "first_value", kind)?,
        ))
    }

    fn last(&self, kind: AggregationKind) -> EngineResult<Sample> {
        Ok(Sample::new(
            required(self.last_timestamp, "last_timestamp", kind)?,
            required(self.last_value, "last_value", kind)?,
        ))
    }

    /// `None` for an empty stats bucket.
    fn into_stats(self, kind: AggregationKind, doc_count: u64) -> EngineResult<Option<BucketStats>> {
        let stats = match kind {
            AggregationKind::Sampling => BucketStats::Sample(self.sample(kind)?),
            AggregationKind::Rate | AggregationKind::Delta => BucketStats::Range {
                first: self.first(kind)?,
                last: self.last(kind)?,
                correction: if kind == AggregationKind::Rate {
                    self.counter_correction.unwrap_or(0.0)
                } else {
                    0.0
                },
                count: self.count.unwrap_or(doc_count),
            },
            AggregationKind::Irate => {
                let previous = match (self.previous_timestamp, self.previous_value) {
                    (Some(t), Some(v)) => Some(Sample::new(t, v)),
                    _ => None,
                };
                BucketStats::Recent {
                    last: self.last(kind)?,
                    previous,
                    count: self.count.unwrap_or(doc_count),
                }
            }
            AggregationKind::Changes => BucketStats::Changes {
                first: self.first(kind)?,
                last: self.last(kind)?,
                changes: self.changes.unwrap_or(0.0),
                count: self.count.unwrap_or(doc_count),
            },
            AggregationKind::Stats => {
                let count = self.count.unwrap_or(doc_count);
                if count == 0 {
                    return Ok(None);
                }
                BucketStats::Stats {
                    count,
                    sum: required(self.sum, "sum", kind)?,
                    min: required(self.min, "min", kind)?,
                    max: required(self.max, "max", kind)?,
                }
            }
        };
        Ok(Some(stats))
    }
}

fn parse_envelope(response: JsonValue) -> EngineResult<SearchResponse> {
    let parsed: SearchResponse = serde_json::from_value(response)?;
    if let Some(error) = &parsed.error {
        return Err(EngineError::backend(format!("search failed: {error}")));
    }
    if parsed.timed_out {
        return Err(EngineError::backend("search timed out on the backend"));
    }
    if let Some(shards) = &parsed.shards {
        if shards.failed > 0 {
            let reason = shards
                .failures
                .first()
                .map(|f| f.to_string())
                .unwrap_or_default();
            return Err(EngineError::backend(format!(
                "{} shard(s) failed: {reason}",
                shards.failed
            )));
        }
    }
    Ok(parsed)
}

/// Parses an aggregation response into per-series bucket lists.
pub fn parse_aggregation_response(
    response: JsonValue,
    kind: AggregationKind,
) -> EngineResult<Vec<ShardSeries>> {
    let parsed = parse_envelope(response)?;
    let Some(aggregations) = parsed.aggregations else {
        return Ok(Vec::new());
    };

    let mut result = Vec::with_capacity(aggregations.series.buckets.len());
    for series in aggregations.series.buckets {
        let time_buckets = series.time.map(|t| t.buckets).unwrap_or_default();
        let mut buckets = Vec::with_capacity(time_buckets.len());
        for tb in time_buckets {
            if tb.doc_count == 0 {
                continue;
            }
            let raw = tb.value.unwrap_or_default();
            if let Some(stats) = raw.into_stats(kind, tb.doc_count)? {
                buckets.push(Bucket {
                    timestamp: tb.key,
                    stats,
                });
            }
        }
        buckets.sort_by_key(|b| b.timestamp);
        result.push(ShardSeries {
            key: series.key,
            buckets,
        });
    }
    Ok(result)
}

/// Series keys of one identity page, in response order.
pub fn parse_series_keys(response: JsonValue) -> EngineResult<Vec<String>> {
    let parsed = parse_envelope(response)?;
    Ok(parsed
        .aggregations
        .map(|a| a.series.buckets.into_iter().map(|b| b.key).collect())
        .unwrap_or_default())
}
