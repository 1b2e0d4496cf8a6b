use super::SingleFlightMap;
use crate::common::types::Timestamp;
use crate::error::EngineResult;
use crate::labels::Labels;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Identifier of a series, derived from its label key.
pub type Tsid = u64;

pub fn tsid_for_key(key: &str) -> Tsid {
    xxh3_64(key.as_bytes())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesIdentity {
    pub key: String,
    pub tsid: Tsid,
    pub labels: Arc<Labels>,
}

/// Series known for one selector, and the time window they were resolved over.
#[derive(Debug, Clone, Default)]
pub struct TsidEntry {
    /// Ordered by key
    pub series: BTreeMap<String, SeriesIdentity>,
    /// Resolved window `[start, end)`
    pub coverage: (Timestamp, Timestamp),
    pub refreshed_at: Timestamp,
    pub full_refreshed_at: Timestamp,
}

impl TsidEntry {
    pub fn keys(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn by_tsid(&self, tsid: Tsid) -> Option<&SeriesIdentity> {
        self.series.values().find(|s| s.tsid == tsid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    UseCache,
    /// Resolve `[start, end)` and replace the entry
    Full { start: Timestamp, end: Timestamp },
    /// Resolve `[start, end)` and add the result to the entry
    Extend { start: Timestamp, end: Timestamp },
}

#[derive(Debug, Clone, Copy)]
pub struct TsidRefreshPolicy {
    pub full_refresh_interval: i64,
    pub tail_tolerance: i64,
}

impl TsidRefreshPolicy {
    /// Decides how to serve a request for `[start, end)` at wall clock `now`.
    pub fn plan(&self, entry: Option<&TsidEntry>, start: Timestamp, end: Timestamp, now: Timestamp) -> RefreshPlan {
        let Some(entry) = entry else {
            return RefreshPlan::Full { start, end };
        };
        if now - entry.full_refreshed_at >= self.full_refresh_interval {
            return RefreshPlan::Full { start, end };
        }

        let (cached_start, cached_end) = entry.coverage;
        let before = start < cached_start;
        let after = end > cached_end;
        match (before, after) {
            (false, false) => RefreshPlan::UseCache,
            (true, true) => RefreshPlan::Full { start, end },
            (true, false) => RefreshPlan::Extend {
                start,
                end: cached_start,
            },
            (false, true) => {
                // the cached window reaches close enough to "now"
                if now - cached_end <= self.tail_tolerance {
                    RefreshPlan::UseCache
                } else {
                    RefreshPlan::Extend {
                        start: cached_end,
                        end,
                    }
                }
            }
        }
    }
}

/// Selector identity -> resolved series, refreshed fully or incrementally.
pub struct TsidCache {
    entries: SingleFlightMap<TsidEntry>,
    policy: TsidRefreshPolicy,
}

impl TsidCache {
    pub fn new(policy: TsidRefreshPolicy) -> Self {
        TsidCache {
            entries: SingleFlightMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> TsidRefreshPolicy {
        self.policy
    }

    /// Returns the series of `key` covering `[start, end)`. `fetch` resolves the label sets
    /// of the series with data in a window and is only called when the entry must change.
    pub async fn resolve<F, Fut>(
        &self,
        key: &str,
        start: Timestamp,
        end: Timestamp,
        now: Timestamp,
        fetch: F,
    ) -> EngineResult<Arc<TsidEntry>>
    where
        F: FnOnce(Timestamp, Timestamp) -> Fut,
        Fut: Future<Output = EngineResult<Vec<(String, Labels)>>>,
    {
        let policy = self.policy;
        self.entries
            .get_or_refresh(
                key,
                |entry| policy.plan(Some(entry), start, end, now) == RefreshPlan::UseCache,
                |previous| async move {
                    let plan = policy.plan(previous.as_deref(), start, end, now);
                    debug!(key, ?plan, "refreshing series identities");
                    match (plan, previous) {
                        (RefreshPlan::Extend { start: from, end: to }, Some(previous)) => {
                            let found = fetch(from, to).await?;
                            let mut entry = TsidEntry::clone(&previous);
                            insert_all(&mut entry, found);
                            entry.coverage = (entry.coverage.0.min(from), entry.coverage.1.max(to));
                            entry.refreshed_at = now;
                            Ok(entry)
                        }
                        (RefreshPlan::Full { start: from, end: to }, _) | (RefreshPlan::Extend { start: from, end: to }, None) => {
                            let found = fetch(from, to).await?;
                            let mut entry = TsidEntry {
                                coverage: (from, to),
                                refreshed_at: now,
                                full_refreshed_at: now,
                                ..Default::default()
                            };
                            insert_all(&mut entry, found);
                            Ok(entry)
                        }
                        // accepted by a concurrent refresh between the checks
                        (RefreshPlan::UseCache, Some(previous)) => Ok(TsidEntry::clone(&previous)),
                        (RefreshPlan::UseCache, None) => Ok(TsidEntry::default()),
                    }
                },
            )
            .await
    }

    pub fn peek(&self, key: &str) -> Option<Arc<TsidEntry>> {
        self.entries.peek(key)
    }
}

fn insert_all(entry: &mut TsidEntry, found: Vec<(String, Labels)>) {
    for (key, labels) in found {
        let tsid = tsid_for_key(&key);
        entry.series.insert(
            key.clone(),
            SeriesIdentity {
                key,
                tsid,
                labels: Arc::new(labels),
            },
        );
    }
}
