use super::AggregationKind;
use crate::common::types::Timestamp;
use crate::common::METRIC_NAME_LABEL;
use crate::config::FieldSettings;
use crate::labels::{LabelMatcher, MatchOp};
use serde_json::{json, Value as JsonValue};

/// Name of the terms aggregation over series keys.
pub const SERIES_AGG: &str = "series";
/// Name of the date histogram under each series bucket.
pub const TIME_AGG: &str = "time";
/// Name of the value aggregation under each time bucket.
pub const VALUE_AGG: &str = "value";

/// Selection of documents shared by every request issued for one selector.
#[derive(Debug, Clone, Copy)]
pub struct SeriesQuery<'a> {
    pub metric: &'a str,
    pub matchers: &'a [LabelMatcher],
    pub must_filters: &'a [JsonValue],
    /// Inclusive
    pub start: Timestamp,
    /// Exclusive
    pub end: Timestamp,
    /// Restricts the request to these series keys (batched resolution)
    pub series_keys: Option<&'a [String]>,
    /// Leaves these series keys out
    pub excluded_keys: Option<&'a [String]>,
}

/// Shape of the date histogram requested per series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub kind: AggregationKind,
    /// Bucket width in milliseconds
    pub interval: i64,
    /// Any bucket key; all keys are congruent to it modulo `interval`
    pub anchor: Timestamp,
}

impl BucketSpec {
    pub fn offset(&self) -> i64 {
        self.anchor.rem_euclid(self.interval)
    }
}

fn label_field(fields: &FieldSettings, name: &str) -> String {
    format!("{}{}{}", fields.label_prefix, name, fields.keyword_suffix)
}

fn label_exists(fields: &FieldSettings, name: &str) -> JsonValue {
    json!({ "exists": { "field": format!("{}{}", fields.label_prefix, name) } })
}

pub fn metric_field(fields: &FieldSettings, metric: &str) -> String {
    format!("{}{}", fields.metric_prefix, metric)
}

/// The `query` section: metric existence, time range, label matchers, external filters.
pub fn build_query_clause(query: &SeriesQuery, fields: &FieldSettings) -> JsonValue {
    let mut filter = vec![
        json!({ "exists": { "field": metric_field(fields, query.metric) } }),
        json!({
            "range": {
                fields.timestamp.as_str(): {
                    "gte": query.start,
                    "lt": query.end,
                    "format": "epoch_millis"
                }
            }
        }),
    ];
    let mut must_not = Vec::new();

    for matcher in query.matchers.iter().filter(|m| m.name != METRIC_NAME_LABEL) {
        let field = label_field(fields, &matcher.name);
        match &matcher.op {
            MatchOp::Equal if matcher.value.is_empty() => {
                must_not.push(label_exists(fields, &matcher.name))
            }
            MatchOp::Equal => filter.push(json!({ "term": { field: matcher.value } })),
            MatchOp::NotEqual if matcher.value.is_empty() => {
                filter.push(label_exists(fields, &matcher.name))
            }
            MatchOp::NotEqual => must_not.push(json!({ "term": { field: matcher.value } })),
            MatchOp::RegexMatch(_) => {
                let regexp = json!({ "regexp": { field: matcher.value } });
                if matcher.matches_empty() {
                    filter.push(json!({
                        "bool": {
                            "should": [
                                regexp,
                                { "bool": { "must_not": [label_exists(fields, &matcher.name)] } }
                            ],
                            "minimum_should_match": 1
                        }
                    }));
                } else {
                    filter.push(regexp);
                }
            }
            MatchOp::RegexNoMatch(_) => {
                if !matcher.matches_empty() {
                    filter.push(label_exists(fields, &matcher.name));
                }
                must_not.push(json!({ "regexp": { field: matcher.value } }));
            }
        }
    }

    if let Some(keys) = query.series_keys {
        filter.push(json!({ "terms": { fields.labels_key.as_str(): keys } }));
    }
    if let Some(keys) = query.excluded_keys {
        must_not.push(json!({ "terms": { fields.labels_key.as_str(): keys } }));
    }
    filter.extend(query.must_filters.iter().cloned());

    let mut bool_query = serde_json::Map::new();
    bool_query.insert("filter".to_string(), JsonValue::Array(filter));
    if !must_not.is_empty() {
        bool_query.insert("must_not".to_string(), JsonValue::Array(must_not));
    }
    json!({ "bool": bool_query })
}

fn value_aggregation(kind: AggregationKind, metric: &str, fields: &FieldSettings) -> JsonValue {
    let field = metric_field(fields, metric);
    match kind {
        AggregationKind::Stats => json!({ "stats": { "field": field } }),
        other => json!({
            other.as_str(): {
                "field": field,
                "timestamp_field": fields.timestamp
            }
        }),
    }
}

/// Terms over series keys, then a date histogram, then the per-bucket value aggregation.
pub fn build_aggregation_body(
    query: &SeriesQuery,
    bucket: &BucketSpec,
    series_size: usize,
    fields: &FieldSettings,
) -> JsonValue {
    json!({
        "size": 0,
        "query": build_query_clause(query, fields),
        "aggs": {
            SERIES_AGG: {
                "terms": {
                    "field": fields.labels_key,
                    "size": series_size,
                    "order": { "_key": "asc" }
                },
                "aggs": {
                    TIME_AGG: {
                        "date_histogram": {
                            "field": fields.timestamp,
                            "fixed_interval": format!("{}ms", bucket.interval),
                            "offset": format!("{}ms", bucket.offset()),
                            "min_doc_count": 1,
                            "order": { "_key": "asc" }
                        },
                        "aggs": {
                            VALUE_AGG: value_aggregation(bucket.kind, query.metric, fields)
                        }
                    }
                }
            }
        }
    })
}

/// One page of series keys ordered ascending, strictly after `after`.
pub fn build_series_page_body(
    query: &SeriesQuery,
    after: Option<&str>,
    page_size: usize,
    fields: &FieldSettings,
) -> JsonValue {
    let mut clause = build_query_clause(query, fields);
    if let Some(after) = after {
        if let Some(filter) = clause
            .get_mut("bool")
            .and_then(|b| b.get_mut("filter"))
            .and_then(|f| f.as_array_mut())
        {
            filter.push(json!({ "range": { fields.labels_key.as_str(): { "gt": after } } }));
        }
    }
    json!({
        "size": 0,
        "query": clause,
        "aggs": {
            SERIES_AGG: {
                "terms": {
                    "field": fields.labels_key,
                    "size": page_size,
                    "order": { "_key": "asc" }
                }
            }
        }
    })
}
