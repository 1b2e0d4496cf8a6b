mod dsl;
mod response;

use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

pub use dsl::*;
pub use response::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        mod test_backend;
        pub(crate) use test_backend::*;
    }
}

/// Index patterns and extra filter clauses a metric's documents live under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogGroupFilters {
    pub index_patterns: Vec<String>,
    /// Raw backend clauses added to the `filter` section of every request
    #[serde(default)]
    pub must_filters: Vec<JsonValue>,
}

/// One concrete index behind a pattern and its number of primary shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexShards {
    pub index_name: String,
    pub primaries: u32,
}

impl IndexShards {
    pub fn new<S: Into<String>>(index_name: S, primaries: u32) -> Self {
        IndexShards {
            index_name: index_name.into(),
            primaries,
        }
    }
}

/// A single search request. With `shard` set the request is routed to exactly that
/// primary shard of `indices`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardSearchRequest {
    pub indices: Vec<String>,
    pub shard: Option<u32>,
    pub body: JsonValue,
}

impl ShardSearchRequest {
    pub fn preference(&self) -> Option<String> {
        self.shard.map(|id| format!("_shards:{id}"))
    }
}

/// The value aggregation computed per date-histogram bucket. Each kind has its own
/// combination rule when two shards report the same bucket of the same series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationKind {
    /// Latest sample in the bucket (gauge value)
    Sampling,
    /// First/last sample plus in-bucket counter correction
    Rate,
    /// Last two samples in the bucket
    Irate,
    /// First/last sample without counter semantics
    Delta,
    /// First/last sample plus the number of value changes inside the bucket
    Changes,
    /// count/sum/min/max of the samples in the bucket
    Stats,
}

impl AggregationKind {
    pub const fn as_str(&self) -> &'static str {
        use AggregationKind::*;
        match self {
            Sampling => "sampling",
            Rate => "rate_sampling",
            Irate => "irate_sampling",
            Delta => "delta_sampling",
            Changes => "changes_sampling",
            Stats => "stats",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capabilities the engine needs from the search backend and its metadata services.
/// Implementations own transport, authentication and retries.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Index patterns and filters for a metric. `None` when the metric is unknown.
    async fn resolve_filters(&self, metric: &str) -> EngineResult<Option<LogGroupFilters>>;

    /// Concrete indices behind a pattern with their primary shard counts.
    async fn load_shard_count(&self, index_pattern: &str) -> EngineResult<Vec<IndexShards>>;

    /// Executes one search and returns the raw response document.
    async fn execute_shard_aggregation(&self, request: &ShardSearchRequest) -> EngineResult<JsonValue>;
}
