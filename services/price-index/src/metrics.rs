//! Observability counters for the price index service
//!
//! Plain atomics plus a bounded latency window, exported as a sorted map
//! for the `/health` endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the price index service.
pub struct ServiceMetrics {
    // Ingestion
    pub ingest_batches: AtomicU64,
    pub rows_accepted: AtomicU64,
    pub rows_duplicate: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub rows_defaulted: AtomicU64,
    pub source_failures: AtomicU64,
    pub store_failures: AtomicU64,

    // Broadcasting
    pub events_published: AtomicU64,

    // Queries
    pub queries_served: AtomicU64,
    pub queries_degraded: AtomicU64,
    pub query_latency_us: Mutex<LatencyTracker>,

    // Materialization
    pub materialization_runs: AtomicU64,
    pub materialization_failures: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            ingest_batches: AtomicU64::new(0),
            rows_accepted: AtomicU64::new(0),
            rows_duplicate: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
            rows_defaulted: AtomicU64::new(0),
            source_failures: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            queries_served: AtomicU64::new(0),
            queries_degraded: AtomicU64::new(0),
            query_latency_us: Mutex::new(LatencyTracker::new(1000)),
            materialization_runs: AtomicU64::new(0),
            materialization_failures: AtomicU64::new(0),
        }
    }

    /// Record the outcome of one ingestion batch.
    pub fn record_batch(&self, accepted: usize, duplicates: usize, skipped: usize, defaulted: usize) {
        self.ingest_batches.fetch_add(1, Ordering::Relaxed);
        self.rows_accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.rows_duplicate.fetch_add(duplicates as u64, Ordering::Relaxed);
        self.rows_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        self.rows_defaulted.fetch_add(defaulted as u64, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_published(&self, count: usize) {
        self.events_published.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a served query.
    pub fn record_query(&self, latency_us: u64, degraded: bool) {
        self.queries_served.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.queries_degraded.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut tracker) = self.query_latency_us.lock() {
            tracker.record(latency_us);
        }
    }

    pub fn record_materialization(&self, ok: bool) {
        self.materialization_runs.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.materialization_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Export metrics as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ingest_batches".to_string(), self.ingest_batches.load(Ordering::Relaxed));
        m.insert("rows_accepted".to_string(), self.rows_accepted.load(Ordering::Relaxed));
        m.insert("rows_duplicate".to_string(), self.rows_duplicate.load(Ordering::Relaxed));
        m.insert("rows_skipped".to_string(), self.rows_skipped.load(Ordering::Relaxed));
        m.insert("rows_defaulted".to_string(), self.rows_defaulted.load(Ordering::Relaxed));
        m.insert("source_failures".to_string(), self.source_failures.load(Ordering::Relaxed));
        m.insert("store_failures".to_string(), self.store_failures.load(Ordering::Relaxed));
        m.insert("events_published".to_string(), self.events_published.load(Ordering::Relaxed));
        m.insert("queries_served".to_string(), self.queries_served.load(Ordering::Relaxed));
        m.insert("queries_degraded".to_string(), self.queries_degraded.load(Ordering::Relaxed));
        m.insert("materialization_runs".to_string(), self.materialization_runs.load(Ordering::Relaxed));
        m.insert(
            "materialization_failures".to_string(),
            self.materialization_failures.load(Ordering::Relaxed),
        );
        if let Ok(tracker) = self.query_latency_us.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("query_latency_p50_us".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("query_latency_p99_us".to_string(), p99);
            }
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample, evicting the oldest when full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
