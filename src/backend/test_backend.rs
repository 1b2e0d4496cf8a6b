use super::{IndexShards, LogGroupFilters, SearchBackend, ShardSearchRequest};
use crate::common::types::{Sample, Timestamp};
use crate::config::FieldSettings;
use crate::error::{EngineError, EngineResult};
use crate::labels::{format_label_key, Labels};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct TestDocument {
    metric: String,
    labels: Labels,
    key: String,
    timestamp: Timestamp,
    value: f64,
}

/// In-memory backend that interprets the request bodies the engine generates against
/// documents stored per (index, shard). Testing only.
pub(crate) struct TestBackend {
    fields: FieldSettings,
    filters: Mutex<HashMap<String, LogGroupFilters>>,
    /// index name -> shards -> documents
    indices: Mutex<BTreeMap<String, Vec<Vec<TestDocument>>>>,
    failure: Mutex<Option<EngineError>>,
    delay: Mutex<Option<Duration>>,
    pub filter_calls: AtomicUsize,
    pub shard_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub requests: Mutex<Vec<ShardSearchRequest>>,
}

impl TestBackend {
    pub fn new() -> Self {
        TestBackend {
            fields: FieldSettings::default(),
            filters: Mutex::new(HashMap::new()),
            indices: Mutex::new(BTreeMap::new()),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            filter_calls: AtomicUsize::new(0),
            shard_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Registers a metric living under the given index patterns.
    pub fn with_metric(self, metric: &str, patterns: &[&str]) -> Self {
        self.filters.lock().unwrap().insert(
            metric.to_string(),
            LogGroupFilters {
                index_patterns: patterns.iter().map(|p| p.to_string()).collect(),
                must_filters: Vec::new(),
            },
        );
        self
    }

    pub fn with_index(self, name: &str, primaries: u32) -> Self {
        self.indices
            .lock()
            .unwrap()
            .insert(name.to_string(), vec![Vec::new(); primaries as usize]);
        self
    }

    pub fn add_sample(&self, index: &str, shard: u32, metric: &str, labels: &[(&str, &str)], timestamp: Timestamp, value: f64) {
        let labels = Labels::from_pairs(labels);
        let key = format_label_key(&labels, &self.fields.label_prefix);
        let mut indices = self.indices.lock().unwrap();
        let shards = indices.get_mut(index).expect("unknown test index");
        shards[shard as usize].push(TestDocument {
            metric: metric.to_string(),
            labels,
            key,
            timestamp,
            value,
        });
    }

    pub fn add_samples(&self, index: &str, shard: u32, metric: &str, labels: &[(&str, &str)], samples: &[Sample]) {
        for sample in samples {
            self.add_sample(index, shard, metric, labels, sample.timestamp, sample.value);
        }
    }

    pub fn fail_with(&self, err: Option<EngineError>) {
        *self.failure.lock().unwrap() = err;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn matching_indices(&self, pattern: &str) -> Vec<String> {
        let indices = self.indices.lock().unwrap();
        indices
            .keys()
            .filter(|name| match pattern.strip_suffix('*') {
                Some(prefix) => name.starts_with(prefix),
                None => name.as_str() == pattern,
            })
            .cloned()
            .collect()
    }

    fn collect_documents(&self, request: &ShardSearchRequest) -> Vec<TestDocument> {
        let mut names: Vec<String> = request
            .indices
            .iter()
            .flat_map(|p| self.matching_indices(p))
            .collect();
        names.sort();
        names.dedup();

        let indices = self.indices.lock().unwrap();
        let mut docs = Vec::new();
        for name in names {
            let Some(shards) = indices.get(&name) else {
                continue;
            };
            for (id, shard) in shards.iter().enumerate() {
                if request.shard.map_or(true, |s| s as usize == id) {
                    docs.extend(shard.iter().cloned());
                }
            }
        }
        docs
    }

    fn doc_matches(&self, clause: &JsonValue, doc: &TestDocument) -> bool {
        let Some((kind, body)) = clause.as_object().and_then(|o| o.iter().next()) else {
            return true;
        };
        match kind.as_str() {
            "bool" => {
                let all = |name: &str| {
                    body.get(name)
                        .and_then(|v| v.as_array())
                        .map(|list| list.iter().all(|c| self.doc_matches(c, doc)))
                        .unwrap_or(true)
                };
                let none = body
                    .get("must_not")
                    .and_then(|v| v.as_array())
                    .map(|list| !list.iter().any(|c| self.doc_matches(c, doc)))
                    .unwrap_or(true);
                let should = body
                    .get("should")
                    .and_then(|v| v.as_array())
                    .map(|list| list.is_empty() || list.iter().any(|c| self.doc_matches(c, doc)))
                    .unwrap_or(true);
                all("filter") && all("must") && none && should
            }
            "exists" => {
                let field = body["field"].as_str().unwrap_or_default();
                if let Some(metric) = field.strip_prefix(&self.fields.metric_prefix) {
                    doc.metric == metric
                } else if let Some(label) = field.strip_prefix(&self.fields.label_prefix) {
                    doc.labels.contains(label)
                } else {
                    false
                }
            }
            "range" => {
                let Some((field, bounds)) = body.as_object().and_then(|o| o.iter().next()) else {
                    return false;
                };
                if field == &self.fields.timestamp {
                    let ts = doc.timestamp;
                    let check = |op: &str, f: fn(i64, i64) -> bool| {
                        bounds.get(op).and_then(|v| v.as_i64()).map(|b| f(ts, b)).unwrap_or(true)
                    };
                    check("gte", |a, b| a >= b)
                        && check("gt", |a, b| a > b)
                        && check("lt", |a, b| a < b)
                        && check("lte", |a, b| a <= b)
                } else if field == &self.fields.labels_key {
                    bounds
                        .get("gt")
                        .and_then(|v| v.as_str())
                        .map(|after| doc.key.as_str() > after)
                        .unwrap_or(true)
                } else {
                    false
                }
            }
            "term" | "regexp" => {
                let Some((field, expected)) = body.as_object().and_then(|o| o.iter().next()) else {
                    return false;
                };
                let expected = expected.as_str().unwrap_or_default();
                let Some(value) = self.label_value(field, doc) else {
                    return false;
                };
                if kind == "term" {
                    value == expected
                } else {
                    regex::Regex::new(&format!("^(?:{expected})$"))
                        .map(|re| re.is_match(value))
                        .unwrap_or(false)
                }
            }
            "terms" => {
                let Some((field, values)) = body.as_object().and_then(|o| o.iter().next()) else {
                    return false;
                };
                let candidate = if field == &self.fields.labels_key {
                    Some(doc.key.as_str())
                } else {
                    self.label_value(field, doc)
                };
                let values = values.as_array().cloned().unwrap_or_default();
                candidate
                    .map(|c| values.iter().any(|v| v.as_str() == Some(c)))
                    .unwrap_or(false)
            }
            "match_all" => true,
            _ => false,
        }
    }

    fn label_value<'a>(&self, field: &str, doc: &'a TestDocument) -> Option<&'a str> {
        let name = field
            .strip_prefix(&self.fields.label_prefix)?
            .strip_suffix(&self.fields.keyword_suffix)?;
        doc.labels.get(name)
    }

    fn aggregate(&self, body: &JsonValue, docs: Vec<TestDocument>) -> JsonValue {
        let series_agg = &body["aggs"]["series"];
        let size = series_agg["terms"]["size"].as_u64().unwrap_or(10) as usize;

        let mut by_key: BTreeMap<String, Vec<TestDocument>> = BTreeMap::new();
        for doc in docs {
            by_key.entry(doc.key.clone()).or_default().push(doc);
        }

        let time_agg = series_agg.get("aggs").and_then(|a| a.get("time"));
        let buckets: Vec<JsonValue> = by_key
            .into_iter()
            .take(size)
            .map(|(key, mut docs)| {
                docs.sort_by_key(|d| d.timestamp);
                let mut bucket = json!({ "key": key, "doc_count": docs.len() });
                if let Some(time_agg) = time_agg {
                    bucket["time"] = json!({ "buckets": histogram(time_agg, &docs) });
                }
                bucket
            })
            .collect();

        json!({
            "took": 1,
            "timed_out": false,
            "_shards": { "total": 1, "successful": 1, "failed": 0 },
            "aggregations": { "series": { "buckets": buckets } }
        })
    }
}

fn parse_millis(value: &JsonValue) -> i64 {
    value
        .as_str()
        .and_then(|s| s.strip_suffix("ms"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn histogram(time_agg: &JsonValue, docs: &[TestDocument]) -> Vec<JsonValue> {
    let spec = &time_agg["date_histogram"];
    let interval = parse_millis(&spec["fixed_interval"]).max(1);
    let offset = parse_millis(&spec["offset"]);

    let mut buckets: BTreeMap<i64, Vec<Sample>> = BTreeMap::new();
    for doc in docs {
        let key = (doc.timestamp - offset).div_euclid(interval) * interval + offset;
        buckets
            .entry(key)
            .or_default()
            .push(Sample::new(doc.timestamp, doc.value));
    }

    let value_agg = time_agg["aggs"]["value"].as_object().and_then(|o| o.keys().next().cloned());
    buckets
        .into_iter()
        .map(|(key, samples)| {
            let value = value_agg
                .as_deref()
                .map(|kind| compute_value(kind, &samples))
                .unwrap_or(JsonValue::Null);
            json!({ "key": key, "doc_count": samples.len(), "value": value })
        })
        .collect()
}

fn compute_value(kind: &str, samples: &[Sample]) -> JsonValue {
    let first = samples[0];
    let last = samples[samples.len() - 1];
    let count = samples.len();
    match kind {
        "sampling" => {
            let latest = samples
                .iter()
                .filter(|s| s.timestamp == last.timestamp)
                .fold(last, |acc, s| if s.value > acc.value { *s } else { acc });
            json!({ "value": latest.value, "timestamp": latest.timestamp })
        }
        "rate_sampling" | "delta_sampling" => {
            let mut correction = 0.0;
            if kind == "rate_sampling" {
                for pair in samples.windows(2) {
                    if pair[1].value < pair[0].value {
                        correction += pair[0].value;
                    }
                }
            }
            json!({
                "first_value": first.value,
                "first_timestamp": first.timestamp,
                "last_value": last.value,
                "last_timestamp": last.timestamp,
                "counter_correction": correction,
                "count": count
            })
        }
        "irate_sampling" => {
            let mut value = json!({
                "last_value": last.value,
                "last_timestamp": last.timestamp,
                "count": count
            });
            if count > 1 {
                let previous = samples[count - 2];
                value["previous_value"] = json!(previous.value);
                value["previous_timestamp"] = json!(previous.timestamp);
            }
            value
        }
        "changes_sampling" => {
            let changes = samples.windows(2).filter(|p| p[0].value != p[1].value).count();
            json!({
                "changes": changes,
                "first_value": first.value,
                "first_timestamp": first.timestamp,
                "last_value": last.value,
                "last_timestamp": last.timestamp,
                "count": count
            })
        }
        "stats" => {
            let sum: f64 = samples.iter().map(|s| s.value).sum();
            let min = samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
            let max = samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);
            json!({ "count": count, "min": min, "max": max, "avg": sum / count as f64, "sum": sum })
        }
        _ => JsonValue::Null,
    }
}

#[async_trait]
impl SearchBackend for TestBackend {
    async fn resolve_filters(&self, metric: &str) -> EngineResult<Option<LogGroupFilters>> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.filters.lock().unwrap().get(metric).cloned())
    }

    async fn load_shard_count(&self, index_pattern: &str) -> EngineResult<Vec<IndexShards>> {
        self.shard_calls.fetch_add(1, Ordering::SeqCst);
        let names = self.matching_indices(index_pattern);
        let indices = self.indices.lock().unwrap();
        Ok(names
            .into_iter()
            .map(|name| {
                let primaries = indices.get(&name).map(|s| s.len() as u32).unwrap_or(0);
                IndexShards::new(name, primaries)
            })
            .collect())
    }

    async fn execute_shard_aggregation(&self, request: &ShardSearchRequest) -> EngineResult<JsonValue> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }

        let docs: Vec<TestDocument> = self
            .collect_documents(request)
            .into_iter()
            .filter(|doc| self.doc_matches(&request.body["query"], doc))
            .collect();
        Ok(self.aggregate(&request.body, docs))
    }
}
