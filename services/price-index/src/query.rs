//! Cached index queries
//!
//! The read path callers see: a cache lookup in front of the aggregation
//! engine. Degraded series are returned but never cached, so the next
//! request retries the live tail.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;
use types::ids::CardId;
use types::numeric::Currency;
use types::variant::DimensionFilter;

use crate::aggregation::{AggregationEngine, IndexSeries, Period};
use crate::cache::{CacheKey, CacheLayer};
use crate::metrics::ServiceMetrics;

pub struct IndexService {
    engine: Arc<AggregationEngine>,
    cache: Arc<CacheLayer>,
    metrics: Arc<ServiceMetrics>,
}

impl IndexService {
    pub fn new(engine: Arc<AggregationEngine>, cache: Arc<CacheLayer>, metrics: Arc<ServiceMetrics>) -> Self {
        Self { engine, cache, metrics }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    /// Market-wide index for `currency` over `period`.
    ///
    /// A card-scoped filter is served as that card's history.
    pub async fn get_index(
        &self,
        currency: Currency,
        period: Period,
        filter: DimensionFilter,
        now: DateTime<Utc>,
    ) -> IndexSeries {
        if let Some(card_id) = filter.card_id {
            return self.get_card_history(card_id, currency, period, filter, now).await;
        }
        let key = CacheKey::market_index(period, currency, &filter);
        self.cached(key, currency, period, filter, now).await
    }

    /// Price history of one card, with the same variant narrowing.
    pub async fn get_card_history(
        &self,
        card_id: CardId,
        currency: Currency,
        period: Period,
        filter: DimensionFilter,
        now: DateTime<Utc>,
    ) -> IndexSeries {
        let filter = DimensionFilter {
            card_id: Some(card_id),
            ..filter
        };
        let key = CacheKey::card_history(card_id, period, currency, &filter);
        self.cached(key, currency, period, filter, now).await
    }

    async fn cached(
        &self,
        key: CacheKey,
        currency: Currency,
        period: Period,
        filter: DimensionFilter,
        now: DateTime<Utc>,
    ) -> IndexSeries {
        let started = Instant::now();
        let series = self
            .cache
            .get_or_compute_if(
                &key,
                None,
                || self.engine.query(currency, period, filter, now),
                |series: &IndexSeries| !series.degraded,
            )
            .await;
        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_query(latency_us, series.degraded);
        debug!(key = %key, points = series.points.len(), latency_us, degraded = series.degraded, "Query served");
        series
    }
}
