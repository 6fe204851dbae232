//! Keyed registry of process pools.
//!
//! A key usually names one external function library; every call site using
//! that library shares the pool registered under it.

use crate::config::PoolConfig;
use crate::worker::{PoolStats, ProcessPool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Maps cache keys to process pools.
///
/// Pools are created empty and spawn evaluators on first use. Dropping the
/// cache tears down every pool it still holds.
#[derive(Debug, Default)]
pub struct MultiCache {
    config: PoolConfig,
    pools: Mutex<HashMap<String, Arc<ProcessPool>>>,
}

impl MultiCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache whose new pools use `config`.
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock_pools(&self) -> MutexGuard<'_, HashMap<String, Arc<ProcessPool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the pool for `key`, registering an empty one if needed.
    pub fn get_or_create(&self, key: &str) -> Arc<ProcessPool> {
        let mut pools = self.lock_pools();
        if let Some(pool) = pools.get(key) {
            return Arc::clone(pool);
        }
        debug!(key, "Creating process pool");
        let pool = Arc::new(ProcessPool::new(key, self.config.clone()));
        pools.insert(key.to_string(), Arc::clone(&pool));
        pool
    }

    /// Get the pool for `key` without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<ProcessPool>> {
        self.lock_pools().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock_pools().contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_pools().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock_pools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_pools().is_empty()
    }

    /// Stats for every pool, sorted by key.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .snapshot()
            .into_iter()
            .map(|pool| (pool.key().to_string(), pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    fn snapshot(&self) -> Vec<Arc<ProcessPool>> {
        self.lock_pools().values().cloned().collect()
    }

    /// Terminate every evaluator of every pool. Pools stay registered and
    /// start new evaluators on demand.
    pub fn destroy_processes(&self) {
        let pools = self.snapshot();
        info!(pools = pools.len(), "Destroying evaluator processes");
        for pool in pools {
            pool.destroy_processes();
        }
    }

    /// Terminate every evaluator and forget every pool.
    pub fn tear_down(&self) {
        let pools: Vec<Arc<ProcessPool>> = self.lock_pools().drain().map(|(_, p)| p).collect();
        if !pools.is_empty() {
            info!(pools = pools.len(), "Tearing down process pools");
        }
        for pool in pools {
            pool.tear_down();
        }
    }

    /// Terminate and forget the pool for `key`. Does nothing if absent.
    pub fn tear_down_key(&self, key: &str) {
        let removed = self.lock_pools().remove(key);
        if let Some(pool) = removed {
            debug!(key, "Tearing down process pool");
            pool.tear_down();
        }
    }
}

impl Drop for MultiCache {
    fn drop(&mut self) {
        self.tear_down();
    }
}
