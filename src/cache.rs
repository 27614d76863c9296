//! Prediction Cache
//!
//! Fingerprint-keyed store of finished predictions. This is where repeated
//! requests for the same nominal input become deterministic: a hit returns
//! the stored result untouched and never runs the backend.
//!
//! # Eviction
//! Bounded by entry count. Once full, the oldest inserted entry is evicted
//! first; reads do not refresh an entry's position.
//!
//! # Concurrency
//! Concurrent misses on one fingerprint are coalesced behind a per-key gate,
//! so the backend runs once and the other callers read its result. Failed
//! computations are not stored.

use crate::error::Result;
use crate::inference::InferenceResult;
use crate::metrics;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct Arena {
    entries: HashMap<String, InferenceResult>,
    order: VecDeque<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PredictionCache {
    capacity: usize,
    arena: Mutex<Arena>,
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PredictionCache {
    /// `capacity` is clamped to at least one entry
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            arena: Mutex::new(Arena::default()),
            gates: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<InferenceResult> {
        let arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena.entries.get(fingerprint).cloned()
    }

    pub fn insert(&self, fingerprint: &str, result: InferenceResult) {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = arena.entries.get_mut(fingerprint) {
            *existing = result;
            return;
        }

        arena.entries.insert(fingerprint.to_string(), result);
        arena.order.push_back(fingerprint.to_string());

        while arena.order.len() > self.capacity {
            if let Some(oldest) = arena.order.pop_front() {
                arena.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %oldest, "Evicted oldest cached prediction");
            }
        }
        metrics::CACHE_ENTRIES.set(arena.entries.len() as i64);
    }

    /// Stored result for `fingerprint`, or the result of `compute` (stored
    /// if it succeeds).
    pub async fn get_or_compute<F, Fut>(&self, fingerprint: &str, compute: F) -> Result<InferenceResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InferenceResult>>,
    {
        if let Some(hit) = self.get(fingerprint) {
            self.record_hit(fingerprint);
            return Ok(hit);
        }

        let lease = self.lease_gate(fingerprint);
        let _guard = lease.gate.lock().await;

        // Another caller may have filled it while we waited
        if let Some(hit) = self.get(fingerprint) {
            self.record_hit(fingerprint);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_MISSES.inc();
        debug!(fingerprint = %fingerprint, "Prediction cache miss");

        let result = compute().await?;
        self.insert(fingerprint, result.clone());
        Ok(result)
    }

    fn record_hit(&self, fingerprint: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_HITS.inc();
        debug!(fingerprint = %fingerprint, "Prediction cache hit");
    }

    fn lease_gate(&self, fingerprint: &str) -> GateLease<'_> {
        let gate = self
            .gates
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        GateLease {
            gates: &self.gates,
            key: fingerprint.to_string(),
            gate,
        }
    }

    pub fn len(&self) -> usize {
        self.arena
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut arena = self.arena.lock().unwrap_or_else(PoisonError::into_inner);
        arena.entries.clear();
        arena.order.clear();
        metrics::CACHE_ENTRIES.set(0);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Holds a per-fingerprint gate; removes it from the map on drop once no
/// one else is waiting on it.
struct GateLease<'a> {
    gates: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        // One reference in the map, one here
        self.gates
            .remove_if(&self.key, |_, g| Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::inference::BackendKind;
    use crate::taxonomy::ClassTaxonomy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn result_for(class_id: usize, seed: u64) -> InferenceResult {
        let taxonomy = ClassTaxonomy::default();
        let mut rng = StdRng::seed_from_u64(seed);
        InferenceResult::with_confidence(&taxonomy, class_id, 0.7, &mut rng, BackendKind::Random, 0)
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache = PredictionCache::new(4);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_compute("leaf.jpg", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result_for(3, 1))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_compute("leaf.jpg", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result_for(9, 2))
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_evicts_oldest_insertion_first() {
        let cache = PredictionCache::new(2);
        cache.insert("a", result_for(0, 1));
        cache.insert("b", result_for(1, 1));

        // Reading "a" does not refresh it
        assert!(cache.get("a").is_some());
        cache.insert("c", result_for(2, 1));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = PredictionCache::new(4);
        let err = cache
            .get_or_compute("bad.jpg", || async {
                Err(PipelineError::prediction_failed(
                    BackendKind::Real,
                    anyhow::anyhow!("inference blew up"),
                ))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PredictionFailed");
        assert!(cache.is_empty());

        let ok = cache
            .get_or_compute("bad.jpg", || async { Ok(result_for(4, 1)) })
            .await
            .unwrap();
        assert_eq!(ok.class_id, 4);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_once() {
        let cache = Arc::new(PredictionCache::new(8));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute("same.png", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(result_for(i % 3, i as u64))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let first = results[0].as_ref().unwrap().clone();
        for r in results {
            assert_eq!(r.unwrap(), first);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.gates.is_empty());
    }
}
