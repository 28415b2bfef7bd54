//! Bounded, time-limited cache of completed workflow results.
//!
//! Keys are a SHA-256 digest of the document text and the serialized run
//! config, so the same document under a different config is a separate
//! entry. Values are shared: a hit returns the same `Arc` that was stored.

use crate::orchestrator::aggregate::WorkflowResult;
use crate::orchestrator::config::RunConfig;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache entry: the stored result and when it was stored.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: Arc<WorkflowResult>,
    pub cached_at: DateTime<Utc>,
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct ResultCache {
    cache: Cache<String, CachedResult>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for a document under a run config.
    pub fn key(document_text: &str, config: &RunConfig) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_text.as_bytes());
        hasher.update([0u8]);
        // RunConfig holds only plain fields, so serialization is infallible in practice.
        let config_bytes = serde_json::to_vec(config).unwrap_or_default();
        hasher.update(&config_bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Returns the cached result if present and younger than the TTL.
    pub fn get(&self, key: &str) -> Option<Arc<WorkflowResult>> {
        let hit = self.cache.get(key).filter(|entry| {
            let age = Utc::now() - entry.cached_at;
            age.to_std().map_or(true, |age| age < self.ttl)
        });

        match hit {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, result: Arc<WorkflowResult>) {
        self.cache.insert(
            key,
            CachedResult {
                result,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Runs pending evictions. Called by the maintenance loop.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entry_count: self.cache.entry_count(),
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}
