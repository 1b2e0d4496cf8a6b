use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "promql-docstore.toml";
pub const ENV_PREFIX: &str = "PROMQL__";

/// Sizes of the bounded worker pools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Concurrent leaf-selector resolutions within one query
    pub leaf: usize,
    /// Concurrent per-shard aggregation requests
    pub shard: usize,
    /// Concurrent top-level queries submitted as a batch
    pub batch: usize,
    /// Concurrent filter, shard-list and series-identity lookups
    pub data_view: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            leaf: 16,
            shard: 64,
            batch: 8,
            data_view: 16,
        }
    }
}

/// Document field layout of the metric indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSettings {
    pub timestamp: String,
    /// Keyword field holding the canonical label string of a series
    pub labels_key: String,
    pub metric_prefix: String,
    pub label_prefix: String,
    /// Appended to label fields in term and regexp clauses
    pub keyword_suffix: String,
}

impl Default for FieldSettings {
    fn default() -> Self {
        Self {
            timestamp: "@timestamp".to_string(),
            labels_key: "__labels_str".to_string(),
            metric_prefix: "metrics.".to_string(),
            label_prefix: "labels.".to_string(),
            keyword_suffix: ".keyword".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Step used for range queries that omit one
    #[serde(with = "humantime_serde")]
    pub default_step: Duration,
    /// Window an instant vector selector looks back for its latest sample
    #[serde(with = "humantime_serde")]
    pub lookback_delta: Duration,
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Age after which a tsid cache entry is fully re-resolved
    #[serde(with = "humantime_serde")]
    pub full_refresh_interval: Duration,
    /// A cached window ending less than this before "now" still serves requests reaching "now"
    #[serde(with = "humantime_serde")]
    pub tail_tolerance: Duration,
    #[serde(with = "humantime_serde")]
    pub shard_refresh_interval: Duration,
    /// Size of the backend terms aggregation over series keys
    pub max_search_series_size: usize,
    /// Upper bound of series * buckets requested in one aggregation
    pub max_query_points: usize,
    pub series_page_size: usize,
    pub pools: PoolSettings,
    pub fields: FieldSettings,
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_step: Duration::from_secs(60),
            lookback_delta: Duration::from_secs(5 * 60),
            query_timeout: Duration::from_secs(120),
            full_refresh_interval: Duration::from_secs(24 * 60 * 60),
            tail_tolerance: Duration::from_secs(10 * 60),
            shard_refresh_interval: Duration::from_secs(30 * 60),
            max_search_series_size: 10_000,
            max_query_points: 10_000_000,
            series_page_size: 10_000,
            pools: PoolSettings::default(),
            fields: FieldSettings::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment().extract().map_err(Box::new)
    }

    /// Defaults, then the config file, then `PROMQL__`-prefixed environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(EngineSettings::default()))
            .merge(Toml::file(CONFIG_FILE_NAME))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

static GLOBAL_SETTINGS: LazyLock<EngineSettings> = LazyLock::new(|| {
    EngineSettings::load().unwrap_or_else(|err| {
        tracing::warn!("failed to load settings, using defaults: {err}");
        EngineSettings::default()
    })
});

pub fn get_global_settings() -> &'static EngineSettings {
    &GLOBAL_SETTINGS
}
