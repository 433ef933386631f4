use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::builder::{build_statistics, MarketStatistics, StatisticsOptions};
use super::covariance::CholeskyFactor;
use crate::error::EngineError;
use crate::types::AssetSeries;
use crate::EngineResult;

/// Identifies one universe snapshot: the ordered asset set plus its as-of time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub symbols: Vec<String>,
    pub as_of: DateTime<Utc>,
}

impl CacheKey {
    pub fn new(symbols: Vec<String>, as_of: DateTime<Utc>) -> Self {
        Self { symbols, as_of }
    }

    pub fn for_series(series: &[AssetSeries], as_of: DateTime<Utc>) -> Self {
        Self::new(series.iter().map(|s| s.symbol.clone()).collect(), as_of)
    }
}

/// Statistics plus the Cholesky factor of their conditioned covariance.
#[derive(Debug, Clone)]
pub struct CachedFactorization {
    pub statistics: MarketStatistics,
    pub cholesky: CholeskyFactor,
}

impl CachedFactorization {
    pub fn build(series: &[AssetSeries], options: &StatisticsOptions) -> EngineResult<Self> {
        let statistics = build_statistics(series, options)?;
        let cholesky = statistics.covariance.cholesky().ok_or_else(|| {
            EngineError::numerical(
                "covariance cache",
                "Cholesky factorization failed on a conditioned matrix",
            )
        })?;
        Ok(Self {
            statistics,
            cholesky,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<CachedFactorization>>,
    /// Insertion order; the front is evicted first.
    order: VecDeque<CacheKey>,
}

/// Bounded read-through cache of covariance factorizations.
///
/// Owned by the call site and passed in explicitly. Lookups take a shared
/// lock; a miss holds an upgradable lock so only one caller recomputes a
/// given universe while readers of other entries proceed.
#[derive(Debug)]
pub struct CovarianceCache {
    capacity: usize,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CovarianceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedFactorization>> {
        let hit = self.state.read().entries.get(key).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Return the cached entry for `key`, building and inserting it on a miss.
    pub fn get_or_build<F>(&self, key: CacheKey, build: F) -> EngineResult<Arc<CachedFactorization>>
    where
        F: FnOnce() -> EngineResult<CachedFactorization>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }

        // The upgradable guard is held across `build()`: plain readers keep
        // going, but misses are built one at a time, even for different
        // universes, so concurrent misses on one key never build twice.
        let guard = self.state.upgradable_read();
        // Another writer may have filled the slot while we waited.
        if let Some(hit) = guard.entries.get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let entry = Arc::new(build()?);
        let mut state = RwLockUpgradableReadGuard::upgrade(guard);
        self.insert_locked(&mut state, key, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn insert(&self, key: CacheKey, entry: CachedFactorization) -> Arc<CachedFactorization> {
        let entry = Arc::new(entry);
        let mut state = self.state.write();
        self.insert_locked(&mut state, key, Arc::clone(&entry));
        entry
    }

    fn insert_locked(&self, state: &mut CacheState, key: CacheKey, entry: Arc<CachedFactorization>) {
        if state.entries.insert(key.clone(), entry).is_none() {
            state.order.push_back(key);
        }
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                    debug!(symbols = oldest.symbols.len(), "evicted covariance cache entry");
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = self.state.write();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop every snapshot of the given universe regardless of as-of time.
    pub fn invalidate_universe(&self, symbols: &[String]) -> usize {
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|k, _| k.symbols != symbols);
        state.order.retain(|k| k.symbols != symbols);
        before - state.entries.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// `build_statistics` through the cache.
pub fn build_statistics_cached(
    series: &[AssetSeries],
    options: &StatisticsOptions,
    cache: &CovarianceCache,
    as_of: DateTime<Utc>,
) -> EngineResult<Arc<CachedFactorization>> {
    let key = CacheKey::for_series(series, as_of);
    cache.get_or_build(key, || CachedFactorization::build(series, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn series(tag: &str) -> Vec<AssetSeries> {
        vec![
            AssetSeries::new(format!("{}1", tag), vec![0.01, -0.02, 0.015, 0.003]),
            AssetSeries::new(format!("{}2", tag), vec![0.002, 0.004, -0.001, 0.006]),
        ]
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_second_lookup_hits() {
        let cache = CovarianceCache::new(4);
        let s = series("X");
        let opts = StatisticsOptions::default();
        let a = build_statistics_cached(&s, &opts, &cache, ts(1)).unwrap();
        let b = build_statistics_cached(&s, &opts, &cache, ts(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_builder_runs_once_per_key() {
        let cache = CovarianceCache::new(4);
        let s = series("Y");
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_build(CacheKey::for_series(&s, ts(2)), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    CachedFactorization::build(&s, &StatisticsOptions::default())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = CovarianceCache::new(2);
        let s = series("Z");
        let opts = StatisticsOptions::default();
        for day in 1..=3 {
            build_statistics_cached(&s, &opts, &cache, ts(day)).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::for_series(&s, ts(1))).is_none());
        assert!(cache.get(&CacheKey::for_series(&s, ts(3))).is_some());
    }

    #[test]
    fn test_invalidate_universe() {
        let cache = CovarianceCache::new(8);
        let opts = StatisticsOptions::default();
        let a = series("A");
        let b = series("B");
        build_statistics_cached(&a, &opts, &cache, ts(1)).unwrap();
        build_statistics_cached(&a, &opts, &cache, ts(2)).unwrap();
        build_statistics_cached(&b, &opts, &cache, ts(1)).unwrap();
        let symbols: Vec<String> = a.iter().map(|s| s.symbol.clone()).collect();
        assert_eq!(cache.invalidate_universe(&symbols), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_build_error_is_not_cached() {
        let cache = CovarianceCache::new(2);
        let bad = vec![AssetSeries::new("BAD", vec![0.01])];
        let key = CacheKey::for_series(&bad, ts(1));
        let res = cache.get_or_build(key, || {
            CachedFactorization::build(&bad, &StatisticsOptions::default())
        });
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_readers() {
        let cache = Arc::new(CovarianceCache::new(4));
        let s = series("C");
        build_statistics_cached(&s, &StatisticsOptions::default(), &cache, ts(5)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let key = CacheKey::for_series(&s, ts(5));
                std::thread::spawn(move || cache.get(&key).is_some())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
