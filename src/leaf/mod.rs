mod merge;

use crate::backend::{
    build_aggregation_body, build_series_page_body, parse_aggregation_response, parse_series_keys,
    Bucket, BucketSpec, LogGroupFilters, SearchBackend, SeriesQuery, ShardSearchRequest,
    ShardSeries,
};
use crate::cache::{ShardCache, TsidCache, TsidEntry, TsidRefreshPolicy};
use crate::common::types::Timestamp;
use crate::common::{current_time_millis, duration_millis, METRIC_NAME_LABEL};
use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::labels::{matches_all, parse_label_key, LabelMatcher, Labels, MatchOp};
use crate::pool::QueryPools;
use promql_parser::parser::VectorSelector;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub use merge::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
    }
}

/// Metric name plus label matchers of one vector selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub metric: String,
    /// Sorted; may contain `__name__` matchers, which are checked against the metric name
    pub matchers: Vec<LabelMatcher>,
}

impl Selector {
    pub fn new(metric: &str, mut matchers: Vec<LabelMatcher>) -> Self {
        matchers.sort_by(|a, b| {
            (a.name.as_str(), a.op.as_str(), a.value.as_str()).cmp(&(
                b.name.as_str(),
                b.op.as_str(),
                b.value.as_str(),
            ))
        });
        Selector {
            metric: metric.to_string(),
            matchers,
        }
    }

    pub fn from_vector_selector(vs: &VectorSelector) -> EngineResult<Self> {
        if !vs.matchers.or_matchers.is_empty() {
            return Err(EngineError::parse("'or' label matchers are not supported"));
        }
        let matchers = vs
            .matchers
            .matchers
            .iter()
            .map(LabelMatcher::try_from)
            .collect::<EngineResult<Vec<_>>>()?;

        let metric = match &vs.name {
            Some(name) => name.clone(),
            None => matchers
                .iter()
                .find(|m| m.name == METRIC_NAME_LABEL && m.op == MatchOp::Equal)
                .map(|m| m.value.clone())
                .ok_or_else(|| EngineError::parse("vector selector must contain a metric name"))?,
        };
        if metric.is_empty() {
            return Err(EngineError::parse("vector selector must contain a metric name"));
        }
        Ok(Selector::new(&metric, matchers))
    }

    /// False when a `__name__` matcher excludes the metric itself.
    fn name_matches(&self) -> bool {
        self.matchers
            .iter()
            .filter(|m| m.name == METRIC_NAME_LABEL)
            .all(|m| m.matches_value(&self.metric))
    }

    fn cache_key(&self, filters: &LogGroupFilters) -> String {
        let matchers: Vec<String> = self.matchers.iter().map(|m| m.to_string()).collect();
        let must: Vec<String> = filters.must_filters.iter().map(|f| f.to_string()).collect();
        format!(
            "{}{{{}}}|{}|{}",
            self.metric,
            matchers.join(","),
            filters.index_patterns.join(","),
            must.join(",")
        )
    }
}

/// One selector occurrence to resolve over `[start, end)`.
#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub selector: Arc<Selector>,
    pub start: Timestamp,
    pub end: Timestamp,
    pub bucket: BucketSpec,
}

/// Buckets of one series after merging every shard, with its resolved labels
/// (metric name included).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSeries {
    pub labels: Arc<Labels>,
    pub buckets: Vec<Bucket>,
}

/// Series key filter of one batched aggregation request.
#[derive(Debug, Clone, PartialEq)]
enum KeyBatch {
    All,
    Only(Vec<String>),
    /// Everything except the keys already known
    Unseen(Vec<String>),
}

impl KeyBatch {
    fn only(&self) -> Option<&[String]> {
        match self {
            KeyBatch::Only(keys) => Some(keys),
            _ => None,
        }
    }

    fn unseen(&self) -> Option<&[String]> {
        match self {
            KeyBatch::Unseen(keys) => Some(keys),
            _ => None,
        }
    }
}

pub struct LeafResolver {
    backend: Arc<dyn SearchBackend>,
    shard_cache: ShardCache,
    tsid_cache: TsidCache,
    pools: QueryPools,
    settings: Arc<EngineSettings>,
}

impl LeafResolver {
    pub fn new(backend: Arc<dyn SearchBackend>, settings: Arc<EngineSettings>, pools: QueryPools) -> Self {
        let shard_cache = ShardCache::new(
            backend.clone(),
            settings.shard_refresh_interval,
            pools.data_view.clone(),
        );
        let tsid_cache = TsidCache::new(TsidRefreshPolicy {
            full_refresh_interval: duration_millis(settings.full_refresh_interval),
            tail_tolerance: duration_millis(settings.tail_tolerance),
        });
        LeafResolver {
            backend,
            shard_cache,
            tsid_cache,
            pools,
            settings,
        }
    }

    pub fn shard_cache(&self) -> &ShardCache {
        &self.shard_cache
    }

    pub fn tsid_cache(&self) -> &TsidCache {
        &self.tsid_cache
    }

    async fn resolve_filters(&self, selector: &Selector) -> EngineResult<Option<LogGroupFilters>> {
        if !selector.name_matches() {
            return Ok(None);
        }
        let filters = self
            .pools
            .data_view
            .run(self.backend.resolve_filters(&selector.metric))
            .await??;
        Ok(filters.filter(|f| !f.index_patterns.is_empty()))
    }

    fn key_labels(&self, selector: &Selector, key: &str) -> EngineResult<Labels> {
        let labels = parse_label_key(key, &self.settings.fields.label_prefix)?;
        Ok(labels.with(METRIC_NAME_LABEL, &selector.metric))
    }

    /// Series identities of `selector` with data in `[start, end)`, served from the tsid
    /// cache when it covers the window.
    async fn identities(
        &self,
        selector: &Selector,
        filters: &LogGroupFilters,
        start: Timestamp,
        end: Timestamp,
    ) -> EngineResult<Arc<TsidEntry>> {
        let key = selector.cache_key(filters);
        self.tsid_cache
            .resolve(&key, start, end, current_time_millis(), |from, to| async move {
                let keys = self.fetch_series_keys(selector, filters, from, to).await?;
                keys.into_iter()
                    .map(|k| {
                        let labels = self.key_labels(selector, &k)?;
                        Ok((k, labels))
                    })
                    .collect::<EngineResult<Vec<_>>>()
            })
            .await
    }

    async fn fetch_series_keys(
        &self,
        selector: &Selector,
        filters: &LogGroupFilters,
        start: Timestamp,
        end: Timestamp,
    ) -> EngineResult<Vec<String>> {
        let fields = &self.settings.fields;
        let page_size = self.settings.series_page_size.max(1);
        let query = SeriesQuery {
            metric: &selector.metric,
            matchers: &selector.matchers,
            must_filters: &filters.must_filters,
            start,
            end,
            series_keys: None,
            excluded_keys: None,
        };

        let mut keys = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let request = ShardSearchRequest {
                indices: filters.index_patterns.clone(),
                shard: None,
                body: build_series_page_body(&query, after.as_deref(), page_size, fields),
            };
            let response = self
                .pools
                .data_view
                .run(self.backend.execute_shard_aggregation(&request))
                .await??;
            let page = parse_series_keys(response)?;
            let full_page = page.len() >= page_size;
            after = page.last().cloned();
            keys.extend(page);
            if !full_page || after.is_none() {
                break;
            }
        }
        debug!(metric = %selector.metric, start, end, count = keys.len(), "resolved series keys");
        Ok(keys)
    }

    /// Splits the known series keys so that no request asks for more than the configured
    /// number of points or series. When the entry was served without covering `end`, one
    /// more batch picks up the series it has not seen.
    fn plan_batches(&self, entry: &TsidEntry, bucket_count: usize, end: Timestamp) -> Vec<KeyBatch> {
        let series_count = entry.series.len();
        let per_batch = (self.settings.max_query_points / bucket_count.max(1))
            .min(self.settings.max_search_series_size)
            .max(1);
        if series_count <= per_batch {
            return vec![KeyBatch::All];
        }
        let keys = entry.keys();
        let mut batches: Vec<KeyBatch> = keys
            .chunks(per_batch)
            .map(|chunk| KeyBatch::Only(chunk.to_vec()))
            .collect();
        if entry.coverage.1 < end {
            batches.push(KeyBatch::Unseen(keys));
        }
        batches
    }

    /// Resolves one selector into per-series buckets, one backend request per shard.
    #[tracing::instrument(skip_all, fields(metric = %request.selector.metric, kind = %request.bucket.kind))]
    pub async fn resolve(&self, request: &LeafRequest) -> EngineResult<Vec<ResolvedSeries>> {
        let selector = request.selector.as_ref();
        if request.start >= request.end {
            return Ok(Vec::new());
        }
        let Some(filters) = self.resolve_filters(selector).await? else {
            debug!("no index patterns for metric");
            return Ok(Vec::new());
        };

        let mut targets: Vec<(String, u32)> = Vec::new();
        for pattern in filters.index_patterns.iter() {
            let entry = self.shard_cache.shards(pattern).await?;
            for index in entry.shards.iter() {
                for shard in 0..index.primaries {
                    targets.push((index.index_name.clone(), shard));
                }
            }
        }
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let identities = self
            .identities(selector, &filters, request.start, request.end)
            .await?;

        let interval = request.bucket.interval.max(1);
        let bucket_count = ((request.end - request.start + interval - 1) / interval) as usize;
        let batches = self.plan_batches(&identities, bucket_count, request.end);
        let series_size = self
            .settings
            .max_search_series_size
            .max(identities.series.len())
            .max(1);

        let mut tasks: JoinSet<(usize, EngineResult<Vec<ShardSeries>>)> = JoinSet::new();
        let mut submitted = 0;
        for batch in batches.iter() {
            let query = SeriesQuery {
                metric: &selector.metric,
                matchers: &selector.matchers,
                must_filters: &filters.must_filters,
                start: request.start,
                end: request.end,
                series_keys: batch.only(),
                excluded_keys: batch.unseen(),
            };
            let size = batch.only().map_or(series_size, |b| b.len().max(1));
            let body = build_aggregation_body(&query, &request.bucket, size, &self.settings.fields);

            for (index, shard) in targets.iter() {
                let search = ShardSearchRequest {
                    indices: vec![index.clone()],
                    shard: Some(*shard),
                    body: body.clone(),
                };
                let backend = self.backend.clone();
                let kind = request.bucket.kind;
                let seq = submitted;
                self.pools
                    .shard
                    .submit(&mut tasks, async move {
                        let result = match backend.execute_shard_aggregation(&search).await {
                            Ok(response) => parse_aggregation_response(response, kind),
                            Err(err) => Err(err),
                        };
                        (seq, result)
                    })
                    .await?;
                submitted += 1;
            }
        }
        debug!(requests = submitted, batches = batches.len(), "submitted shard aggregations");

        let mut parts: Vec<(usize, Vec<ShardSeries>)> = Vec::with_capacity(submitted);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((seq, Ok(series))) => parts.push((seq, series)),
                Ok((_, Err(err))) => {
                    error!("shard aggregation failed: {err}");
                    return Err(err);
                }
                Err(err) if err.is_cancelled() => return Err(EngineError::Canceled),
                Err(err) => return Err(EngineError::Internal(format!("shard task failed: {err}"))),
            }
        }
        parts.sort_by_key(|(seq, _)| *seq);
        let merged = merge_shard_series(parts.into_iter().map(|(_, p)| p).collect())?;

        self.attach_labels(selector, &identities, merged)
    }

    fn attach_labels(
        &self,
        selector: &Selector,
        identities: &TsidEntry,
        merged: Vec<ShardSeries>,
    ) -> EngineResult<Vec<ResolvedSeries>> {
        let total = merged.len();
        let unkeyed = merged.iter().filter(|s| s.key.is_empty()).count();
        if total > 0 && unkeyed == total {
            return Err(EngineError::Internal(format!(
                "no series of {} carries a label key",
                selector.metric
            )));
        }
        if unkeyed > 0 {
            warn!(metric = %selector.metric, dropped = unkeyed, "dropping buckets without a label key");
        }

        let mut result = Vec::with_capacity(total - unkeyed);
        for series in merged.into_iter().filter(|s| !s.key.is_empty()) {
            let labels = match identities.series.get(&series.key) {
                Some(identity) => identity.labels.clone(),
                None => Arc::new(self.key_labels(selector, &series.key)?),
            };
            if !matches_all(&selector.matchers, &labels) {
                continue;
            }
            result.push(ResolvedSeries {
                labels,
                buckets: series.buckets,
            });
        }
        Ok(result)
    }

    /// Label sets of the series matching `selector` with data in `[start, end)`.
    pub async fn series(&self, selector: &Selector, start: Timestamp, end: Timestamp) -> EngineResult<Vec<Arc<Labels>>> {
        let Some(filters) = self.resolve_filters(selector).await? else {
            return Ok(Vec::new());
        };
        let identities = self.identities(selector, &filters, start, end).await?;
        Ok(identities
            .series
            .values()
            .filter(|s| !s.key.is_empty() && matches_all(&selector.matchers, &s.labels))
            .map(|s| s.labels.clone())
            .collect())
    }
}
