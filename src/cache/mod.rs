mod shard_cache;
mod tsid_cache;

use crate::error::EngineResult;
use std::future::Future;
use std::sync::{Arc, RwLock};

pub use shard_cache::*;
pub use tsid_cache::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
    }
}

struct Slot<V> {
    value: RwLock<Option<Arc<V>>>,
    refresh: tokio::sync::Mutex<()>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Slot {
            value: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }
}

impl<V> Slot<V> {
    fn current(&self) -> Option<Arc<V>> {
        match self.value.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, value: Arc<V>) {
        match self.value.write() {
            Ok(mut guard) => *guard = Some(value),
            Err(poisoned) => *poisoned.into_inner() = Some(value),
        }
    }
}

/// Concurrent keyed cache with single-flight refresh. At most one load runs per key; other
/// callers for the same key wait for it, callers for other keys are not blocked. Readers
/// keep seeing the previous value until the rebuilt one is swapped in.
pub struct SingleFlightMap<V> {
    slots: papaya::HashMap<String, Arc<Slot<V>>>,
}

impl<V> Default for SingleFlightMap<V> {
    fn default() -> Self {
        SingleFlightMap {
            slots: papaya::HashMap::new(),
        }
    }
}

impl<V: Send + Sync> SingleFlightMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        let guard = self.slots.guard();
        self.slots
            .get_or_insert_with(key.to_string(), || Arc::new(Slot::default()), &guard)
            .clone()
    }

    /// Current value without triggering a load.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        let guard = self.slots.guard();
        self.slots.get(key, &guard).and_then(|slot| slot.current())
    }

    /// Returns the cached value if `is_fresh` accepts it. Otherwise one caller runs `load`
    /// with the previous value and stores the result.
    pub async fn get_or_refresh<Fresh, Load, Fut>(
        &self,
        key: &str,
        is_fresh: Fresh,
        load: Load,
    ) -> EngineResult<Arc<V>>
    where
        Fresh: Fn(&V) -> bool,
        Load: FnOnce(Option<Arc<V>>) -> Fut,
        Fut: Future<Output = EngineResult<V>>,
    {
        let slot = self.slot(key);
        if let Some(value) = slot.current().filter(|v| is_fresh(v)) {
            return Ok(value);
        }

        let _refreshing = slot.refresh.lock().await;
        // another caller may have finished the load while we waited
        let previous = slot.current();
        if let Some(value) = previous.as_ref().filter(|v| is_fresh(v)) {
            return Ok(value.clone());
        }

        let value = Arc::new(load(previous).await?);
        slot.store(value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let guard = self.slots.guard();
        self.slots.clear(&guard);
    }
}
