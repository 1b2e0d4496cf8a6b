mod params;
mod result;

use crate::backend::SearchBackend;
use crate::common::async_runtime::{block_on, init_runtime};
use crate::common::types::Timestamp;
use crate::config::{get_global_settings, EngineSettings};
use crate::error::{EngineError, EngineResult};
use crate::eval::{EvalRange, Evaluator};
use crate::labels::Labels;
use crate::leaf::{LeafResolver, Selector};
use crate::logging::init_tracing;
use crate::pool::QueryPools;
use ahash::AHashSet;
use futures::future::join_all;
use promql_parser::parser::{self, Expr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub use params::*;
pub use result::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
    }
}

/// Entry point: parses PromQL, evaluates it against the search backend and shapes the
/// result.
pub struct QueryEngine {
    resolver: LeafResolver,
    pools: QueryPools,
    settings: Arc<EngineSettings>,
}

impl QueryEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, settings: EngineSettings) -> Self {
        let settings = Arc::new(settings);
        let pools = QueryPools::new(&settings.pools);
        let resolver = LeafResolver::new(backend, settings.clone(), pools.clone());
        QueryEngine {
            resolver,
            pools,
            settings,
        }
    }

    /// Engine over the process-wide settings, with logging and the shared runtime
    /// initialized.
    pub fn from_global_settings(backend: Arc<dyn SearchBackend>) -> Self {
        let settings = get_global_settings().clone();
        init_tracing(&settings.log_filter);
        init_runtime();
        Self::new(backend, settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &LeafResolver {
        &self.resolver
    }

    pub fn pools(&self) -> &QueryPools {
        &self.pools
    }

    pub async fn instant_query(&self, query: &str, time: Timestamp) -> EngineResult<QueryData> {
        self.execute(&QueryRequest::instant(query, time)).await
    }

    pub async fn range_query(
        &self,
        query: &str,
        start: Timestamp,
        end: Timestamp,
        step: i64,
    ) -> EngineResult<QueryData> {
        self.execute(&QueryRequest::range(query, start, end, step)).await
    }

    /// Runs one request under its timeout (the configured one when it has none). Timing
    /// out drops the evaluation and with it every in-flight shard request.
    #[tracing::instrument(skip_all, fields(query = %request.query))]
    pub async fn execute(&self, request: &QueryRequest) -> EngineResult<QueryData> {
        let timeout = request.timeout.unwrap_or(self.settings.query_timeout);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.evaluate(request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout("expression evaluation".to_string())),
        };
        match &result {
            Ok(data) => debug!(
                result_type = data.result_type(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query done"
            ),
            Err(err) => warn!(error = %err, error_type = %err.error_type(), "query failed"),
        }
        result
    }

    async fn evaluate(&self, request: &QueryRequest) -> EngineResult<QueryData> {
        let expr = parser::parse(&request.query).map_err(EngineError::Parse)?;
        match request.kind {
            QueryKind::Instant { time } => {
                let evaluator =
                    Evaluator::new(&self.resolver, &self.pools, &self.settings, time, time, true);
                let value = evaluator.eval(&expr, &EvalRange::instant(time)).await?;
                shape_instant(value, time)
            }
            QueryKind::Range { start, end, step } => {
                validate_range(start, end, step)?;
                let start = align_start(start, step);
                let range = EvalRange::range(start, end, step)?;
                let evaluator =
                    Evaluator::new(&self.resolver, &self.pools, &self.settings, start, end, false);
                let value = evaluator.eval(&expr, &range).await?;
                shape_range(value, &range.times)
            }
        }
    }

    /// Runs several requests concurrently, bounded by the batch pool. Results are in
    /// request order.
    pub async fn execute_batch(&self, requests: &[QueryRequest]) -> Vec<EngineResult<QueryData>> {
        let runs = requests
            .iter()
            .map(|request| async move { self.pools.batch.run(self.execute(request)).await? });
        join_all(runs).await
    }

    /// Label sets of the series matching any of `matchers` with data in `[start, end)`,
    /// sorted and deduplicated.
    pub async fn series(
        &self,
        matchers: &[&str],
        start: Timestamp,
        end: Timestamp,
    ) -> EngineResult<Vec<Arc<Labels>>> {
        let mut seen = AHashSet::new();
        let mut result = Vec::new();
        for matcher in matchers {
            let selector = match parser::parse(matcher).map_err(EngineError::Parse)? {
                Expr::VectorSelector(vs) => Selector::from_vector_selector(&vs)?,
                _ => {
                    return Err(EngineError::parse(format!(
                        "invalid parameter \"match[]\": {matcher:?} is not a series selector"
                    )))
                }
            };
            for labels in self.resolver.series(&selector, start, end).await? {
                if seen.insert(labels.hash_all()) {
                    result.push(labels);
                }
            }
        }
        result.sort();
        Ok(result)
    }

    /// HTTP status and JSON body for a request.
    pub async fn respond(&self, request: &QueryRequest) -> (u16, serde_json::Value) {
        to_response(&self.execute(request).await)
    }

    /// Synchronous [`QueryEngine::execute`] on the shared runtime. Must not be called from
    /// inside an async context.
    pub fn execute_blocking(&self, request: &QueryRequest) -> EngineResult<QueryData> {
        block_on(self.execute(request))
    }

    pub fn instant_query_blocking(&self, query: &str, time: Timestamp) -> EngineResult<QueryData> {
        self.execute_blocking(&QueryRequest::instant(query, time))
    }

    pub fn range_query_blocking(
        &self,
        query: &str,
        start: Timestamp,
        end: Timestamp,
        step: i64,
    ) -> EngineResult<QueryData> {
        self.execute_blocking(&QueryRequest::range(query, start, end, step))
    }
}
