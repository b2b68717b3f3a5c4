//! Bucket metrics and the shared bucketing function
//!
//! Materialization and the live tail both go through [`bucket_rows`], so a
//! bucket computed either way from the same rows is identical. Averages are
//! exact `Decimal` sums rounded once at the end, which makes the result
//! independent of row order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::CardId;
use types::numeric::{round_price, Currency};
use types::snapshot::PriceSnapshot;
use types::variant::DimensionFilter;

use super::granularity::Granularity;

/// Summary of the rows that fell into one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub avg_price: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Distinct cards observed.
    pub card_count: u64,
    /// Sum of `total_quantity` over the rows.
    pub volume: u64,
    pub sample_count: u64,
}

/// A materialized bucket with its full identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub currency: Currency,
    pub filter: DimensionFilter,
    pub metrics: BucketMetrics,
}

#[derive(Debug, Default)]
struct BucketAccumulator {
    sum: Decimal,
    min: Option<Decimal>,
    max: Option<Decimal>,
    cards: BTreeSet<CardId>,
    volume: u64,
    samples: u64,
}

impl BucketAccumulator {
    fn add(&mut self, row: &PriceSnapshot) {
        // Ingestion caps prices at MAX_PRICE, so the sum stays in range.
        self.sum += row.price;
        self.min = Some(self.min.map_or(row.price, |m| m.min(row.price)));
        self.max = Some(self.max.map_or(row.price, |m| m.max(row.price)));
        self.cards.insert(row.card_id);
        self.volume += row.volume();
        self.samples += 1;
    }

    fn finish(self) -> Option<BucketMetrics> {
        let (min_price, max_price) = (self.min?, self.max?);
        Some(BucketMetrics {
            avg_price: round_price(self.sum / Decimal::from(self.samples)),
            min_price,
            max_price,
            card_count: self.cards.len() as u64,
            volume: self.volume,
            sample_count: self.samples,
        })
    }
}

/// Group rows into epoch-aligned buckets of `granularity`.
///
/// Callers are responsible for having filtered `rows` to one currency and
/// one dimension filter. Buckets with no rows are absent from the result.
pub fn bucket_rows<'a, I>(rows: I, granularity: Granularity) -> BTreeMap<DateTime<Utc>, BucketMetrics>
where
    I: IntoIterator<Item = &'a PriceSnapshot>,
{
    let mut accumulators: BTreeMap<DateTime<Utc>, BucketAccumulator> = BTreeMap::new();
    for row in rows {
        accumulators
            .entry(granularity.align_to_boundary(row.time))
            .or_default()
            .add(row);
    }
    accumulators
        .into_iter()
        .filter_map(|(start, acc)| acc.finish().map(|m| (start, m)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use types::ids::MarketplaceId;
    use types::numeric::MAX_PRICE;
    use types::variant::{Condition, Language};

    fn row(minutes: i64, card: u64, cents: i64, qty: Option<u32>) -> PriceSnapshot {
        PriceSnapshot {
            time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes),
            card_id: CardId::new(card),
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
            total_quantity: qty,
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_bucket_metrics() {
        let rows = vec![
            row(0, 1, 1000, Some(2)),
            row(10, 1, 2000, None),
            row(29, 2, 3000, Some(5)),
            row(30, 3, 500, Some(1)),
        ];
        let buckets = bucket_rows(&rows, Granularity::M30);
        assert_eq!(buckets.len(), 2);

        let first = buckets.values().next().unwrap();
        assert_eq!(first.avg_price, Decimal::new(2000, 2));
        assert_eq!(first.min_price, Decimal::new(1000, 2));
        assert_eq!(first.max_price, Decimal::new(3000, 2));
        assert_eq!(first.card_count, 2);
        assert_eq!(first.volume, 7);
        assert_eq!(first.sample_count, 3);

        let second = buckets.values().nth(1).unwrap();
        assert_eq!(second.sample_count, 1);
        assert_eq!(second.avg_price, Decimal::new(500, 2));
    }

    #[test]
    fn test_bucketing_is_order_independent() {
        let rows = vec![
            row(0, 1, 1001, None),
            row(5, 2, 2002, None),
            row(7, 3, 3337, None),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();
        assert_eq!(
            bucket_rows(&rows, Granularity::H1),
            bucket_rows(&reversed, Granularity::H1)
        );
    }

    #[test]
    fn test_average_is_rounded() {
        let rows = vec![row(0, 1, 100, None), row(1, 1, 100, None), row(2, 1, 200, None)];
        let buckets = bucket_rows(&rows, Granularity::M30);
        let metrics = buckets.values().next().unwrap();
        assert_eq!(metrics.avg_price, Decimal::new(13_333, 4));
    }

    #[test]
    fn test_bucket_of_max_prices_does_not_overflow() {
        let rows: Vec<PriceSnapshot> = (0..1000)
            .map(|i| {
                let mut r = row(i % 30, i as u64, 0, None);
                r.price = MAX_PRICE;
                r
            })
            .collect();
        let buckets = bucket_rows(&rows, Granularity::M30);
        let metrics = buckets.values().next().unwrap();
        assert_eq!(metrics.avg_price, MAX_PRICE);
        assert_eq!(metrics.sample_count, 1000);
    }

    #[test]
    fn test_empty_input() {
        let rows: Vec<PriceSnapshot> = Vec::new();
        assert!(bucket_rows(&rows, Granularity::D1).is_empty());
    }
}
