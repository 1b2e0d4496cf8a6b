use super::SingleFlightMap;
use crate::backend::{IndexShards, SearchBackend};
use crate::error::EngineResult;
use crate::pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ShardEntry {
    pub shards: Vec<IndexShards>,
    pub loaded_at: Instant,
}

impl ShardEntry {
    /// Number of per-shard requests a query against this pattern fans out to.
    pub fn total_shards(&self) -> usize {
        self.shards.iter().map(|s| s.primaries as usize).sum()
    }
}

/// Shard layout per index pattern, loaded lazily and reloaded once older than the refresh
/// interval.
pub struct ShardCache {
    backend: Arc<dyn SearchBackend>,
    entries: SingleFlightMap<ShardEntry>,
    refresh_interval: Duration,
    pool: WorkerPool,
}

impl ShardCache {
    pub fn new(backend: Arc<dyn SearchBackend>, refresh_interval: Duration, pool: WorkerPool) -> Self {
        ShardCache {
            backend,
            entries: SingleFlightMap::new(),
            refresh_interval,
            pool,
        }
    }

    pub async fn shards(&self, pattern: &str) -> EngineResult<Arc<ShardEntry>> {
        let refresh_interval = self.refresh_interval;
        self.entries
            .get_or_refresh(
                pattern,
                |entry| entry.loaded_at.elapsed() < refresh_interval,
                |previous| async move {
                    debug!(pattern, reload = previous.is_some(), "loading shard layout");
                    let shards = self
                        .pool
                        .run(self.backend.load_shard_count(pattern))
                        .await??;
                    Ok(ShardEntry {
                        shards,
                        loaded_at: Instant::now(),
                    })
                },
            )
            .await
    }

    pub fn peek(&self, pattern: &str) -> Option<Arc<ShardEntry>> {
        self.entries.peek(pattern)
    }
}
