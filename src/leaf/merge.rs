use crate::backend::{Bucket, ShardSeries};
use crate::error::EngineResult;
use std::collections::BTreeMap;

/// Merges two bucket lists ordered by timestamp. Buckets present in both are combined with
/// the per-kind rule of [`crate::backend::BucketStats::merge`].
pub fn merge_buckets(
    dest: &mut Vec<Bucket>,
    left: impl Iterator<Item = Bucket>,
    right: impl Iterator<Item = Bucket>,
) -> EngineResult<()> {
    let mut left_iter = left.peekable();
    let mut right_iter = right.peekable();

    if left_iter.peek().is_none() {
        dest.extend(right_iter);
        return Ok(());
    } else if right_iter.peek().is_none() {
        dest.extend(left_iter);
        return Ok(());
    }

    loop {
        let merged = match (left_iter.peek(), right_iter.peek()) {
            (Some(l), Some(r)) => {
                if l.timestamp == r.timestamp {
                    match (left_iter.next(), right_iter.next()) {
                        (Some(l), Some(r)) => Some(Bucket {
                            timestamp: l.timestamp,
                            stats: l.stats.merge(r.stats)?,
                        }),
                        _ => None,
                    }
                } else if l.timestamp < r.timestamp {
                    left_iter.next()
                } else {
                    right_iter.next()
                }
            }
            (Some(_), None) => left_iter.next(),
            (None, Some(_)) => right_iter.next(),
            (None, None) => None,
        };
        if let Some(merged) = merged {
            dest.push(merged);
        } else {
            break;
        }
    }
    Ok(())
}

/// Combines the per-shard responses of one resolution into one bucket list per series
/// key, ordered by key. `parts` must be in request order so that the result does not depend
/// on which shard answered first.
pub fn merge_shard_series(parts: Vec<Vec<ShardSeries>>) -> EngineResult<Vec<ShardSeries>> {
    let mut by_key: BTreeMap<String, Vec<Bucket>> = BTreeMap::new();
    for part in parts {
        for series in part {
            match by_key.remove(&series.key) {
                None => {
                    by_key.insert(series.key, series.buckets);
                }
                Some(existing) => {
                    let mut merged = Vec::with_capacity(existing.len().max(series.buckets.len()));
                    merge_buckets(&mut merged, existing.into_iter(), series.buckets.into_iter())?;
                    by_key.insert(series.key, merged);
                }
            }
        }
    }
    Ok(by_key
        .into_iter()
        .map(|(key, buckets)| ShardSeries { key, buckets })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AggregationKind, BucketStats};
    use crate::common::types::Sample;
    use crate::series::test_utils::generate_random_samples;

    const INTERVAL: i64 = 10_000;

    fn sampling_buckets(samples: &[Sample]) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = Vec::new();
        for sample in samples {
            let key = sample.timestamp.div_euclid(INTERVAL) * INTERVAL;
            let stats = BucketStats::from_sample(AggregationKind::Sampling, *sample);
            match buckets.last_mut() {
                Some(last) if last.timestamp == key => {
                    last.stats = last.stats.clone().merge(stats).unwrap();
                }
                _ => buckets.push(Bucket { timestamp: key, stats }),
            }
        }
        buckets
    }

    fn split(samples: &[Sample], shards: usize) -> Vec<Vec<Sample>> {
        let mut parts = vec![Vec::new(); shards];
        for (i, sample) in samples.iter().enumerate() {
            parts[i % shards].push(*sample);
        }
        parts
    }

    #[test]
    fn test_merged_shards_match_unsplit_series() {
        let a = generate_random_samples(7, 0, 3_000, 200);
        let b = generate_random_samples(11, 0, 4_000, 50);

        let mut parts: Vec<Vec<ShardSeries>> = split(&a, 3)
            .into_iter()
            .map(|samples| {
                vec![ShardSeries {
                    key: "a".to_string(),
                    buckets: sampling_buckets(&samples),
                }]
            })
            .collect();
        parts[1].insert(
            0,
            ShardSeries {
                key: "b".to_string(),
                buckets: sampling_buckets(&b),
            },
        );

        let merged = merge_shard_series(parts.clone()).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "a");
        assert_eq!(merged[0].buckets, sampling_buckets(&a));
        assert_eq!(merged[1].key, "b");
        assert_eq!(merged[1].buckets, sampling_buckets(&b));

        parts.reverse();
        assert_eq!(merge_shard_series(parts).unwrap(), merged);
    }

    #[test]
    fn test_merge_buckets_with_empty_side() {
        let buckets = sampling_buckets(&generate_random_samples(3, 0, 1_000, 30));
        let mut dest = Vec::new();
        merge_buckets(&mut dest, std::iter::empty(), buckets.clone().into_iter()).unwrap();
        assert_eq!(dest, buckets);
    }
}
