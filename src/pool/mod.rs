use crate::config::PoolSettings;
use crate::error::{EngineError, EngineResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Bounded task pool. Submitting to a full pool waits until a slot frees.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn closed(&self) -> EngineError {
        EngineError::Internal(format!("worker pool {} is closed", self.name))
    }

    /// Runs `future` on the caller's task once a slot is free.
    pub async fn run<F: Future>(&self, future: F) -> EngineResult<F::Output> {
        let _permit = self.permits.acquire().await.map_err(|_| self.closed())?;
        Ok(future.await)
    }

    /// Waits for a free slot, then spawns `future` into `tasks`. The slot is held until the
    /// task finishes or is aborted.
    pub async fn submit<F>(&self, tasks: &mut JoinSet<F::Output>, future: F) -> EngineResult<()>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.closed())?;
        tasks.spawn(async move {
            let _permit = permit;
            future.await
        });
        Ok(())
    }
}

/// The pools shared by every query of one engine.
#[derive(Clone, Debug)]
pub struct QueryPools {
    pub leaf: WorkerPool,
    pub shard: WorkerPool,
    pub batch: WorkerPool,
    pub data_view: WorkerPool,
}

impl QueryPools {
    pub fn new(settings: &PoolSettings) -> Self {
        QueryPools {
            leaf: WorkerPool::new("leaf", settings.leaf),
            shard: WorkerPool::new("shard", settings.shard),
            batch: WorkerPool::new("batch", settings.batch),
            data_view: WorkerPool::new("data_view", settings.data_view),
        }
    }
}

impl Default for QueryPools {
    fn default() -> Self {
        QueryPools::new(&PoolSettings::default())
    }
}
