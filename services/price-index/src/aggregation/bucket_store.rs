//! Materialized bucket storage
//!
//! One series per (granularity, currency, filter). Each series records the
//! half-open range `[from, through)` it has been materialized over; buckets
//! inside that range are authoritative, anything after it must be computed
//! from raw rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use types::numeric::Currency;
use types::variant::DimensionFilter;

use super::bucket::{AggregateBucket, BucketMetrics};
use super::granularity::Granularity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub granularity: Granularity,
    pub currency: Currency,
    pub filter: DimensionFilter,
}

impl SeriesKey {
    pub fn new(granularity: Granularity, currency: Currency, filter: DimensionFilter) -> Self {
        Self {
            granularity,
            currency,
            filter,
        }
    }
}

/// Materialized range of a series, `[from, through)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    pub from: DateTime<Utc>,
    pub through: DateTime<Utc>,
}

impl Coverage {
    fn extend(self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        // Disjoint ranges leave coverage untouched so it never spans a hole.
        if to < self.from || from > self.through {
            return self;
        }
        Coverage {
            from: self.from.min(from),
            through: self.through.max(to),
        }
    }
}

/// Materialized buckets a query may use, with the cutover they end at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedRead {
    /// Exclusive end of `buckets`; the live tail starts here.
    pub cutover: DateTime<Utc>,
    pub buckets: Vec<(DateTime<Utc>, BucketMetrics)>,
}

#[derive(Debug, Default)]
struct Series {
    buckets: BTreeMap<DateTime<Utc>, BucketMetrics>,
    coverage: Option<Coverage>,
}

#[derive(Debug)]
pub struct BucketStore {
    series: RwLock<HashMap<SeriesKey, Series>>,
    tracked: RwLock<BTreeSet<DimensionFilter>>,
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketStore {
    /// The unfiltered series is always tracked.
    pub fn new() -> Self {
        let mut tracked = BTreeSet::new();
        tracked.insert(DimensionFilter::any());
        Self {
            series: RwLock::new(HashMap::new()),
            tracked: RwLock::new(tracked),
        }
    }

    /// Register a filter for materialization. Card-scoped filters are served
    /// live and never tracked. Returns whether the filter was new.
    pub async fn track_filter(&self, filter: DimensionFilter) -> bool {
        if filter.is_card_scoped() {
            return false;
        }
        self.tracked.write().await.insert(filter)
    }

    pub async fn tracked_filters(&self) -> Vec<DimensionFilter> {
        self.tracked.read().await.iter().copied().collect()
    }

    pub async fn coverage(&self, key: &SeriesKey) -> Option<Coverage> {
        self.series.read().await.get(key).and_then(|s| s.coverage)
    }

    /// Replace every bucket in `[from, to)` with `buckets` and extend coverage.
    ///
    /// Buckets absent from `buckets` are removed, so re-running over the same
    /// rows always leaves the same state.
    pub async fn replace_range(
        &self,
        key: SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buckets: BTreeMap<DateTime<Utc>, BucketMetrics>,
    ) {
        if from >= to {
            return;
        }
        let mut series = self.series.write().await;
        let entry = series.entry(key).or_default();

        let stale: Vec<DateTime<Utc>> = entry.buckets.range(from..to).map(|(t, _)| *t).collect();
        for t in stale {
            entry.buckets.remove(&t);
        }
        entry
            .buckets
            .extend(buckets.into_iter().filter(|(t, _)| *t >= from && *t < to));

        entry.coverage = Some(match entry.coverage {
            Some(c) => c.extend(from, to),
            None => Coverage { from, through: to },
        });
    }

    /// Drop buckets before `cutoff` and pull coverage forward accordingly.
    pub async fn prune_before(&self, key: &SeriesKey, cutoff: DateTime<Utc>) -> usize {
        let mut series = self.series.write().await;
        let Some(entry) = series.get_mut(key) else {
            return 0;
        };
        let kept = entry.buckets.split_off(&cutoff);
        let removed = entry.buckets.len();
        entry.buckets = kept;
        if let Some(c) = entry.coverage {
            entry.coverage = if c.through <= cutoff {
                None
            } else {
                Some(Coverage {
                    from: c.from.max(cutoff),
                    through: c.through,
                })
            };
        }
        removed
    }

    /// Materialized portion of a window starting at `window_start`.
    ///
    /// The cutover is `nominal_cutover` clamped to the coverage end. When
    /// coverage does not reach back to `window_start` nothing materialized is
    /// used and the cutover is the window start. Coverage and buckets are
    /// read under one lock.
    pub async fn read_until(
        &self,
        key: &SeriesKey,
        window_start: DateTime<Utc>,
        nominal_cutover: DateTime<Utc>,
    ) -> MaterializedRead {
        let series = self.series.read().await;
        let empty = MaterializedRead {
            cutover: window_start,
            buckets: Vec::new(),
        };
        let Some(entry) = series.get(key) else {
            return empty;
        };
        let Some(coverage) = entry.coverage else {
            return empty;
        };
        if coverage.from > window_start {
            return empty;
        }

        let cutover = nominal_cutover.min(coverage.through).max(window_start);
        let buckets = entry
            .buckets
            .range(window_start..cutover)
            .map(|(t, m)| (*t, m.clone()))
            .collect();
        MaterializedRead { cutover, buckets }
    }

    /// Buckets of one series in `[from, to)`.
    pub async fn read_range(
        &self,
        key: &SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<AggregateBucket> {
        if from >= to {
            return Vec::new();
        }
        let series = self.series.read().await;
        series
            .get(key)
            .map(|entry| {
                entry
                    .buckets
                    .range(from..to)
                    .map(|(t, m)| AggregateBucket {
                        bucket_start: *t,
                        granularity: key.granularity,
                        currency: key.currency,
                        filter: key.filter,
                        metrics: m.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Age of the newest fully materialized bucket end for `granularity`.
    pub async fn materialization_lag(&self, granularity: Granularity, now: DateTime<Utc>) -> Option<Duration> {
        let series = self.series.read().await;
        series
            .iter()
            .filter(|(key, _)| key.granularity == granularity)
            .filter_map(|(_, s)| s.coverage.map(|c| c.through))
            .max()
            .map(|through| now - through)
    }

    pub async fn series_count(&self) -> usize {
        self.series.read().await.len()
    }
}
