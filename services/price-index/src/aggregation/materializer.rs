//! Periodic materialization of aggregate buckets
//!
//! Each pass recomputes, for every stored currency and every tracked filter,
//! the buckets between the series' coverage end (minus a refresh depth that
//! picks up late rows) and the last settled boundary. Recomputing a range is
//! a pure function of the rows in it, so passes may overlap or repeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use types::numeric::Currency;
use types::variant::DimensionFilter;

use super::bucket::bucket_rows;
use super::bucket_store::{BucketStore, SeriesKey};
use super::granularity::Granularity;
use crate::config::AggregationConfig;
use crate::error::StoreError;
use crate::store::{ScanRequest, SnapshotStore};

/// Outcome of one materialization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub series: usize,
    pub buckets_written: usize,
    pub rows_scanned: usize,
    pub buckets_pruned: usize,
}

pub struct Materializer {
    store: Arc<dyn SnapshotStore>,
    buckets: Arc<BucketStore>,
    config: AggregationConfig,
}

impl Materializer {
    pub fn new(store: Arc<dyn SnapshotStore>, buckets: Arc<BucketStore>, config: AggregationConfig) -> Self {
        Self {
            store,
            buckets,
            config,
        }
    }

    /// Exclusive end of the buckets a pass at `now` may settle.
    pub fn settled_boundary(&self, granularity: Granularity, now: DateTime<Utc>) -> DateTime<Utc> {
        let settle = self.config.granularity(granularity).settle_delay();
        granularity.align_to_boundary(now - settle)
    }

    /// Run one pass for `granularity`.
    pub async fn materialize(
        &self,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<MaterializeReport, StoreError> {
        let end = self.settled_boundary(granularity, now);
        let horizon_start = granularity.align_to_boundary(now - granularity.horizon());
        let refresh = granularity.duration() * self.config.refresh_buckets as i32;

        let currencies = self.store.currencies().await?;
        let filters = self.buckets.tracked_filters().await;
        let mut report = MaterializeReport::default();

        for currency in &currencies {
            for filter in &filters {
                let key = SeriesKey::new(granularity, *currency, *filter);
                report.buckets_pruned += self.buckets.prune_before(&key, horizon_start).await;

                let start = match self.buckets.coverage(&key).await {
                    Some(c) => c.from.max(c.through - refresh).max(horizon_start),
                    None => horizon_start,
                };
                if start >= end {
                    continue;
                }

                let (rows, written) = self.recompute(key, start, end).await?;
                report.series += 1;
                report.rows_scanned += rows;
                report.buckets_written += written;
            }
        }

        info!(
            granularity = %granularity,
            currencies = currencies.len(),
            series = report.series,
            buckets_written = report.buckets_written,
            rows_scanned = report.rows_scanned,
            "Materialization pass complete"
        );
        Ok(report)
    }

    /// Recompute `[from, to)` of one series from raw rows.
    ///
    /// Bounds are aligned outward to bucket boundaries. Re-running over the
    /// same rows yields identical buckets.
    pub async fn rematerialize(
        &self,
        granularity: Granularity,
        currency: Currency,
        filter: DimensionFilter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let from = granularity.align_to_boundary(from);
        let aligned_to = granularity.align_to_boundary(to);
        let to = if aligned_to < to {
            aligned_to + granularity.duration()
        } else {
            aligned_to
        };
        let key = SeriesKey::new(granularity, currency, filter);
        let (_, written) = self.recompute(key, from, to).await?;
        Ok(written)
    }

    async fn recompute(
        &self,
        key: SeriesKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(usize, usize), StoreError> {
        let request = ScanRequest::half_open(key.currency, key.filter, from, to);
        let rows = self.store.scan(&request).await?;
        let buckets = bucket_rows(&rows, key.granularity);
        let written = buckets.len();
        debug!(
            granularity = %key.granularity,
            currency = %key.currency,
            from = %from,
            to = %to,
            rows = rows.len(),
            buckets = written,
            "Series range recomputed"
        );
        self.buckets.replace_range(key, from, to, buckets).await;
        Ok((rows.len(), written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySnapshotStore;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use types::ids::{CardId, MarketplaceId};
    use types::snapshot::PriceSnapshot;
    use types::variant::{Condition, Language};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 8, 12, 0, 0).unwrap()
    }

    fn row(ago_minutes: i64, cents: i64) -> PriceSnapshot {
        PriceSnapshot {
            time: now() - Duration::minutes(ago_minutes),
            card_id: CardId::new(1),
            marketplace_id: MarketplaceId::new(1),
            condition: Condition::NearMint,
            is_foil: false,
            language: Language::English,
            price: Decimal::new(cents, 2),
            price_low: None,
            price_mid: None,
            price_high: None,
            price_market: None,
            currency: Currency::USD,
            num_listings: None,
            total_quantity: Some(1),
            source: "test".to_string(),
        }
    }

    async fn setup(rows: Vec<PriceSnapshot>) -> (Arc<BucketStore>, Materializer) {
        let store = Arc::new(MemorySnapshotStore::new());
        store.upsert_many(rows).await.unwrap();
        let buckets = Arc::new(BucketStore::new());
        let materializer = Materializer::new(store, buckets.clone(), AggregationConfig::default());
        (buckets, materializer)
    }

    #[tokio::test]
    async fn test_materialize_settles_up_to_boundary() {
        let (buckets, materializer) = setup(vec![row(120, 1000), row(40, 2000), row(2, 3000)]).await;
        materializer.materialize(Granularity::M30, now()).await.unwrap();

        let key = SeriesKey::new(Granularity::M30, Currency::USD, DimensionFilter::any());
        let coverage = buckets.coverage(&key).await.unwrap();
        // settle delay 5m: 11:55 aligns down to 11:30.
        assert_eq!(coverage.through, Utc.with_ymd_and_hms(2024, 3, 8, 11, 30, 0).unwrap());
        assert_eq!(coverage.from, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let materialized = buckets.read_range(&key, coverage.from, coverage.through).await;
        assert_eq!(materialized.len(), 2);
        assert!(materialized.iter().all(|b| b.metrics.sample_count == 1));
    }

    #[tokio::test]
    async fn test_rematerialize_is_idempotent() {
        let (buckets, materializer) = setup(vec![row(100, 1000), row(90, 1500)]).await;
        let key = SeriesKey::new(Granularity::H1, Currency::USD, DimensionFilter::any());
        let from = now() - Duration::hours(3);

        materializer
            .rematerialize(Granularity::H1, Currency::USD, DimensionFilter::any(), from, now())
            .await
            .unwrap();
        let first = buckets.read_range(&key, from, now()).await;

        materializer
            .rematerialize(Granularity::H1, Currency::USD, DimensionFilter::any(), from, now())
            .await
            .unwrap();
        let second = buckets.read_range(&key, from, now()).await;

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_depth_picks_up_late_rows() {
        let store = Arc::new(MemorySnapshotStore::new());
        store.upsert_many(vec![row(50, 1000)]).await.unwrap();
        let buckets = Arc::new(BucketStore::new());
        let materializer = Materializer::new(store.clone(), buckets.clone(), AggregationConfig::default());
        materializer.materialize(Granularity::M30, now()).await.unwrap();

        // A late row for an already settled bucket.
        store.upsert_many(vec![row(45, 3000)]).await.unwrap();
        materializer.materialize(Granularity::M30, now()).await.unwrap();

        let key = SeriesKey::new(Granularity::M30, Currency::USD, DimensionFilter::any());
        let bucket_start = Granularity::M30.align_to_boundary(now() - Duration::minutes(50));
        let read = buckets
            .read_range(&key, bucket_start, bucket_start + Duration::minutes(30))
            .await;
        assert_eq!(read[0].metrics.sample_count, 2);
    }
}
