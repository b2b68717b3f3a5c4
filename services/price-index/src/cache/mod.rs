//! Cache Layer
//!
//! Memoizes query results behind a [`CacheBackend`]. Writes are fenced by
//! the key version observed when the compute began; backend trouble of any
//! kind degrades to computing directly and is never surfaced to callers.

pub mod backend;
pub mod key;
pub mod memory;
pub mod redis_backend;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CacheError;

pub use backend::CacheBackend;
pub use key::{CacheKey, KeyPattern};
pub use memory::MemoryCacheBackend;
pub use redis_backend::RedisCacheBackend;

/// Cache outcome counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    /// Backend unreachable or slow; computed directly.
    pub bypasses: AtomicU64,
    /// Writes discarded because the key was invalidated mid-compute.
    pub fenced_writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub fenced_writes: u64,
    pub write_failures: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            fenced_writes: self.fenced_writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    /// Bound on every backend call.
    timeout: Duration,
    stats: CacheStats,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            timeout,
            stats: CacheStats::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    /// Cached value for `key`, or the result of `compute` (stored under the
    /// version active when it began).
    pub async fn get_or_compute<T, F, Fut>(&self, key: &CacheKey, ttl: Option<Duration>, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.get_or_compute_if(key, ttl, compute, |_| true).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but only values for
    /// which `cacheable` holds are written.
    pub async fn get_or_compute_if<T, F, Fut, P>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        compute: F,
        cacheable: P,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        P: FnOnce(&T) -> bool,
    {
        match self.bounded(self.backend.get(key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Cache hit");
                    return value;
                }
                Err(e) => {
                    let error = CacheError::Serialization(e.to_string());
                    warn!(key = %key, error = %error, "Undecodable cache entry, recomputing");
                }
            },
            Ok(None) => {}
            Err(e) => return self.bypass(key, e, compute).await,
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let version = match self.bounded(self.backend.begin(key)).await {
            Ok(version) => version,
            Err(e) => return self.bypass(key, e, compute).await,
        };

        let value = compute().await;
        if !cacheable(&value) {
            debug!(key = %key, "Result not cacheable, skipping write");
            return value;
        }

        let serialized = match serde_json::to_string(&value).map_err(|e| CacheError::Serialization(e.to_string())) {
            Ok(s) => s,
            Err(error) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %error, "Cache value not written");
                return value;
            }
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        match self
            .bounded(self.backend.put_if_version(key, serialized, version, ttl))
            .await
        {
            Ok(true) => debug!(key = %key, version, "Cache write committed"),
            Ok(false) => {
                self.stats.fenced_writes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, version, "Cache write fenced by newer version");
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache write failed");
            }
        }
        value
    }

    async fn bypass<T, F, Fut>(&self, key: &CacheKey, error: CacheError, compute: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.stats.bypasses.fetch_add(1, Ordering::Relaxed);
        warn!(
            key = %key,
            backend = self.backend.name(),
            error = %error,
            "Cache backend unavailable, computing directly"
        );
        compute().await
    }

    /// Remove every value matching `pattern` and fence in-flight computes.
    pub async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let removed = self.bounded(self.backend.invalidate(pattern)).await?;
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(pattern = %pattern, removed, "Cache invalidated");
        Ok(removed)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.bounded(self.backend.ping()).await
    }

    pub async fn purge_expired(&self) -> usize {
        self.backend.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &CacheKey) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn begin(&self, _key: &CacheKey) -> Result<u64, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn put_if_version(
            &self,
            _key: &CacheKey,
            _value: String,
            _version: u64,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn invalidate(&self, _pattern: &KeyPattern) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    /// Never answers.
    struct HangingBackend;

    #[async_trait]
    impl CacheBackend for HangingBackend {
        async fn get(&self, _key: &CacheKey) -> Result<Option<String>, CacheError> {
            std::future::pending().await
        }
        async fn begin(&self, _key: &CacheKey) -> Result<u64, CacheError> {
            std::future::pending().await
        }
        async fn put_if_version(
            &self,
            _key: &CacheKey,
            _value: String,
            _version: u64,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn invalidate(&self, _pattern: &KeyPattern) -> Result<usize, CacheError> {
            std::future::pending().await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            std::future::pending().await
        }
        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    fn layer(backend: Arc<dyn CacheBackend>) -> CacheLayer {
        CacheLayer::new(backend, Duration::from_secs(300), Duration::from_millis(50))
    }

    fn key() -> CacheKey {
        CacheKey::new("market", "index", &["7d", "USD"])
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = layer(Arc::new(MemoryCacheBackend::default()));
        let first: u32 = cache.get_or_compute(&key(), None, || async { 7 }).await;
        let second: u32 = cache.get_or_compute(&key(), None, || async { 8 }).await;
        assert_eq!((first, second), (7, 7));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_computes_directly() {
        let cache = layer(Arc::new(DownBackend));
        let value: String = cache
            .get_or_compute(&key(), None, || async { "computed".to_string() })
            .await;
        assert_eq!(value, "computed");
        assert_eq!(cache.stats().bypasses, 1);
        assert!(cache.invalidate(&KeyPattern::market_scope()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_backend_times_out_to_compute() {
        let cache = layer(Arc::new(HangingBackend));
        let value: u32 = cache.get_or_compute(&key(), None, || async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(cache.stats().bypasses, 1);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_recomputed_and_replaced() {
        let backend = Arc::new(MemoryCacheBackend::default());
        let version = backend.begin(&key()).await.unwrap();
        assert!(backend
            .put_if_version(&key(), "not json".to_string(), version, Duration::from_secs(60))
            .await
            .unwrap());

        let cache = layer(backend.clone());
        let value: u32 = cache.get_or_compute(&key(), None, || async { 5 }).await;
        assert_eq!(value, 5);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(backend.get(&key()).await.unwrap(), Some("5".to_string()));
    }

    #[tokio::test]
    async fn test_uncacheable_results_are_not_written() {
        let backend = Arc::new(MemoryCacheBackend::default());
        let cache = layer(backend.clone());
        let _: Option<u32> = cache
            .get_or_compute_if(&key(), None, || async { None }, |v: &Option<u32>| v.is_some())
            .await;
        assert_eq!(backend.get(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidation_during_compute_fences_write() {
        let backend = Arc::new(MemoryCacheBackend::default());
        let cache = Arc::new(layer(backend.clone()));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_compute(&key(), None, || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    "v1".to_string()
                })
                .await
        });

        started_rx.await.unwrap();
        cache.invalidate(&KeyPattern::market_scope()).await.unwrap();
        let fresh: String = cache
            .get_or_compute(&key(), None, || async { "v2".to_string() })
            .await;
        assert_eq!(fresh, "v2");

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), "v1");

        assert_eq!(backend.get(&key()).await.unwrap().as_deref(), Some("\"v2\""));
        assert_eq!(cache.stats().fenced_writes, 1);
    }
}
