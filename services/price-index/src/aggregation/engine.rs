//! Windowed index queries
//!
//! A query window `[window_start, now]` is split at the cutover:
//!
//! ```text
//! window_start            cutover                 now
//!      |---- materialized ----|------ live tail ----|
//!          [start, cutover)      [cutover, now]
//! ```
//!
//! The cutover is `align(now - L)` clamped to the series coverage, so it
//! always sits on a bucket boundary and no bucket is split between the two
//! sides. Each row is counted on exactly one side.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use types::numeric::Currency;
use types::variant::DimensionFilter;

use super::bucket::{bucket_rows, BucketMetrics};
use super::bucket_store::{BucketStore, SeriesKey};
use super::granularity::{Granularity, Period};
use crate::config::AggregationConfig;
use crate::error::StoreError;
use crate::store::{ScanRequest, SnapshotStore};

/// Why a series is partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    LiveTailUnavailable,
    Timeout,
}

/// One bucket of an index series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPoint {
    pub bucket_time: DateTime<Utc>,
    pub avg_price: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub card_count: u64,
    pub volume: u64,
    pub sample_count: u64,
    pub degraded: bool,
}

impl IndexPoint {
    fn from_metrics(bucket_time: DateTime<Utc>, metrics: BucketMetrics, degraded: bool) -> Self {
        Self {
            bucket_time,
            avg_price: metrics.avg_price,
            min_price: metrics.min_price,
            max_price: metrics.max_price,
            card_count: metrics.card_count,
            volume: metrics.volume,
            sample_count: metrics.sample_count,
            degraded,
        }
    }
}

/// Result of a windowed query, ordered by `bucket_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSeries {
    pub currency: Currency,
    pub period: Period,
    pub granularity: Granularity,
    pub filter: DimensionFilter,
    pub window_start: DateTime<Utc>,
    pub cutover: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub points: Vec<IndexPoint>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<DegradedReason>,
}

pub struct AggregationEngine {
    store: Arc<dyn SnapshotStore>,
    buckets: Arc<BucketStore>,
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn SnapshotStore>, buckets: Arc<BucketStore>, config: AggregationConfig) -> Self {
        Self {
            store,
            buckets,
            config,
        }
    }

    pub fn buckets(&self) -> &Arc<BucketStore> {
        &self.buckets
    }

    /// `align(now - L)` for the period's granularity.
    pub fn nominal_cutover(&self, granularity: Granularity, now: DateTime<Utc>) -> DateTime<Utc> {
        granularity.align_to_boundary(now - self.config.granularity(granularity).lag())
    }

    /// Merge materialized buckets with a live tail.
    ///
    /// Never fails: when the live tail cannot be read in time the
    /// materialized portion is returned with `degraded` set.
    pub async fn query(
        &self,
        currency: Currency,
        period: Period,
        filter: DimensionFilter,
        now: DateTime<Utc>,
    ) -> IndexSeries {
        let granularity = period.granularity();
        let window_start = period.window_start(now);
        if self.buckets.track_filter(filter).await {
            debug!(?filter, "Tracking new dimension filter for materialization");
        }

        let key = SeriesKey::new(granularity, currency, filter);
        let nominal = self.nominal_cutover(granularity, now);
        let materialized = self.buckets.read_until(&key, window_start, nominal).await;
        let cutover = materialized.cutover;

        let request = ScanRequest::closed(currency, filter, cutover, now);
        let live = tokio::time::timeout(self.config.query_timeout(), self.store.scan(&request)).await;
        let (live_rows, degraded_reason) = match live {
            Ok(Ok(rows)) => (rows, None),
            Ok(Err(e)) => {
                warn!(%currency, %period, error = %e, "Live tail unavailable, serving materialized portion");
                (Vec::new(), Some(DegradedReason::LiveTailUnavailable))
            }
            Err(_) => {
                warn!(
                    %currency,
                    %period,
                    timeout_ms = self.config.query_timeout_ms,
                    "Live tail timed out, serving materialized portion"
                );
                (Vec::new(), Some(DegradedReason::Timeout))
            }
        };
        let degraded = degraded_reason.is_some();

        let live_buckets = bucket_rows(&live_rows, granularity);
        let mut points: Vec<IndexPoint> = materialized
            .buckets
            .into_iter()
            .map(|(t, m)| IndexPoint::from_metrics(t, m, degraded))
            .collect();
        points.extend(
            live_buckets
                .into_iter()
                .map(|(t, m)| IndexPoint::from_metrics(t, m, degraded)),
        );

        debug!(
            %currency,
            %period,
            cutover = %cutover,
            points = points.len(),
            live_rows = live_rows.len(),
            degraded,
            "Index query served"
        );

        IndexSeries {
            currency,
            period,
            granularity,
            filter,
            window_start,
            cutover,
            generated_at: now,
            points,
            degraded,
            degraded_reason,
        }
    }

    /// Whole window computed from raw rows, bypassing materialized buckets.
    pub async fn query_raw(
        &self,
        currency: Currency,
        period: Period,
        filter: DimensionFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<IndexPoint>, StoreError> {
        let granularity = period.granularity();
        let request = ScanRequest::closed(currency, filter, period.window_start(now), now);
        let rows = self.store.scan(&request).await?;
        Ok(bucket_rows(&rows, granularity)
            .into_iter()
            .map(|(t, m)| IndexPoint::from_metrics(t, m, false))
            .collect())
    }
}
