use super::value::{InstantVector, StepSample};
use crate::common::BUCKET_LABEL;
use crate::labels::Signature;
use ahash::AHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
struct HistogramBucket {
    upper_bound: f64,
    count: f64,
}

/// `histogram_quantile(φ, v)` at every step. `phis` holds φ per step.
pub fn histogram_quantile(phis: &[f64], steps: Vec<InstantVector>) -> Vec<InstantVector> {
    let le = [BUCKET_LABEL.to_string()];
    steps
        .into_iter()
        .zip(phis.iter())
        .map(|(vector, phi)| {
            let mut index: AHashMap<Signature, usize> = AHashMap::new();
            let mut groups: Vec<(StepSample, Vec<HistogramBucket>)> = Vec::new();
            for sample in vector {
                let Some(upper_bound) = sample
                    .labels
                    .get(BUCKET_LABEL)
                    .and_then(parse_upper_bound)
                else {
                    continue;
                };
                let sig = sample.labels.signature(&le, true);
                let bucket = HistogramBucket {
                    upper_bound,
                    count: sample.value,
                };
                match index.get(&sig) {
                    Some(idx) => groups[*idx].1.push(bucket),
                    None => {
                        let labels = Arc::new(sample.labels.drop_names(&le));
                        index.insert(sig, groups.len());
                        groups.push((StepSample::new(labels, f64::NAN), vec![bucket]));
                    }
                }
            }
            groups
                .into_iter()
                .map(|(mut sample, buckets)| {
                    sample.value = bucket_quantile(*phi, buckets);
                    sample
                })
                .collect()
        })
        .collect()
}

fn parse_upper_bound(value: &str) -> Option<f64> {
    match value {
        "+Inf" | "Inf" | "inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok(),
    }
}

fn bucket_quantile(phi: f64, mut buckets: Vec<HistogramBucket>) -> f64 {
    if phi.is_nan() {
        return f64::NAN;
    }
    if phi < 0.0 {
        return f64::NEG_INFINITY;
    }
    if phi > 1.0 {
        return f64::INFINITY;
    }
    buckets.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
    match buckets.last() {
        Some(last) if last.upper_bound == f64::INFINITY => {}
        _ => return f64::NAN,
    }
    coalesce(&mut buckets);
    ensure_monotonic(&mut buckets);
    if buckets.len() < 2 {
        return f64::NAN;
    }

    let observations = buckets[buckets.len() - 1].count;
    if observations == 0.0 {
        return f64::NAN;
    }
    let mut rank = phi * observations;
    let search_len = buckets.len() - 1;
    let b = buckets[..search_len]
        .iter()
        .position(|bucket| bucket.count >= rank)
        .unwrap_or(search_len);

    if b == buckets.len() - 1 {
        return buckets[buckets.len() - 2].upper_bound;
    }
    if b == 0 && buckets[0].upper_bound <= 0.0 {
        return buckets[0].upper_bound;
    }
    let bucket_end = buckets[b].upper_bound;
    let mut bucket_start = 0.0;
    let mut count = buckets[b].count;
    if b > 0 {
        bucket_start = buckets[b - 1].upper_bound;
        count -= buckets[b - 1].count;
        rank -= buckets[b - 1].count;
    }
    bucket_start + (bucket_end - bucket_start) * (rank / count)
}

/// Sums buckets sharing an upper bound. Expects `buckets` sorted.
fn coalesce(buckets: &mut Vec<HistogramBucket>) {
    buckets.dedup_by(|next, prev| {
        if next.upper_bound == prev.upper_bound {
            prev.count += next.count;
            true
        } else {
            false
        }
    });
}

/// Bucket counts are cumulative; a lower count after a higher one is raised to it.
fn ensure_monotonic(buckets: &mut [HistogramBucket]) {
    let mut max = f64::NEG_INFINITY;
    for bucket in buckets.iter_mut() {
        if bucket.count > max {
            max = bucket.count;
        } else if bucket.count < max {
            bucket.count = max;
        }
    }
}
