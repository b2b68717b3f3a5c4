//! End-to-end ingestion and aggregation tests
//!
//! Covers:
//! - Idempotent re-ingestion
//! - One post-commit `prices_updated` event per batch
//! - Currency isolation of index queries
//! - Materialized + live merge equals a raw recompute

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use serde_json::Value;

use price_index::aggregation::{AggregationEngine, BucketStore, Granularity, Materializer, Period};
use price_index::backpressure::ConnectionQueue;
use price_index::cache::MemoryCacheBackend;
use price_index::config::{AggregationConfig, ServiceConfig};
use price_index::error::StoreError;
use price_index::service::Components;
use price_index::store::{MemorySnapshotStore, ScanRequest, SnapshotStore, UpsertOutcome};
use types::ids::{CardId, MarketplaceId};
use types::numeric::Currency;
use types::snapshot::{PriceQuote, PriceSnapshot};
use types::variant::{Condition, DimensionFilter, Language};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 8, 12, 0, 0).unwrap()
}

fn quote(card: u64, marketplace: u32, cents: i64, currency: &str, time: DateTime<Utc>) -> PriceQuote {
    PriceQuote {
        source: String::new(),
        card_id: CardId::new(card),
        marketplace_id: MarketplaceId::new(marketplace),
        condition: Some("Near Mint".to_string()),
        is_foil: false,
        language: Some("English".to_string()),
        price: Some(Decimal::new(cents, 2)),
        price_low: None,
        price_mid: None,
        price_high: None,
        price_market: None,
        currency: Some(currency.to_string()),
        num_listings: Some(1),
        total_quantity: Some(2),
        time,
    }
}

fn snapshot(card: u64, cents: i64, currency: Currency, time: DateTime<Utc>) -> PriceSnapshot {
    PriceSnapshot {
        time,
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
        currency,
        num_listings: None,
        total_quantity: Some(1),
        source: "test".to_string(),
    }
}

fn components(store: Arc<dyn SnapshotStore>) -> Components {
    Components::assemble(ServiceConfig::default(), store, Arc::new(MemoryCacheBackend::default()))
}

fn subscribe(components: &Components, channel: &str) -> Arc<ConnectionQueue> {
    let (id, queue) = components.broadcaster.connect();
    components.broadcaster.open(id);
    components.broadcaster.subscribe(id, channel).unwrap();
    queue
}

async fn drain(queue: &ConnectionQueue) -> Vec<Value> {
    let mut frames = Vec::new();
    while !queue.is_empty() {
        let Some(batch) = queue.next_batch(100).await else {
            break;
        };
        frames.extend(batch.iter().map(|m| serde_json::from_str::<Value>(&m.payload).unwrap()));
    }
    frames
}

/// Records how many events a watched queue held when each write began.
struct ObservedStore {
    inner: MemorySnapshotStore,
    watched: std::sync::Mutex<Option<Arc<ConnectionQueue>>>,
    queued_at_write: AtomicUsize,
}

#[async_trait]
impl SnapshotStore for ObservedStore {
    async fn upsert_many(&self, rows: Vec<PriceSnapshot>) -> Result<UpsertOutcome, StoreError> {
        let queued = self.watched.lock().unwrap().as_ref().map_or(0, |q| q.len());
        self.queued_at_write.fetch_add(queued, Ordering::SeqCst);
        self.inner.upsert_many(rows).await
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Vec<PriceSnapshot>, StoreError> {
        self.inner.scan(request).await
    }

    async fn currencies(&self) -> Result<Vec<Currency>, StoreError> {
        self.inner.currencies().await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn test_reingesting_same_row_stores_it_once() {
    let store = Arc::new(MemorySnapshotStore::new());
    let c = components(store.clone());
    let t = now() - Duration::hours(1);
    let batch = vec![quote(1, 1, 1000, "USD", t)];

    let first = c.pipeline.normalize_and_store("tcgplayer", batch.clone()).await.unwrap();
    let second = c.pipeline.normalize_and_store("tcgplayer", batch).await.unwrap();

    assert_eq!(first.accepted, 1);
    assert_eq!(second.accepted, 0);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.events, 0);
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_batch_publishes_one_market_event_after_commit() {
    let store = Arc::new(ObservedStore {
        inner: MemorySnapshotStore::new(),
        watched: std::sync::Mutex::new(None),
        queued_at_write: AtomicUsize::new(0),
    });
    let c = components(store.clone());
    let market = subscribe(&c, "market");
    let card_seven = subscribe(&c, "card:7");
    *store.watched.lock().unwrap() = Some(market.clone());

    let t = now() - Duration::hours(1);
    let batch: Vec<PriceQuote> = (1..=50).map(|card| quote(card, 1 + (card % 2) as u32, 1000, "USD", t)).collect();
    let result = c.pipeline.normalize_and_store("tcgplayer", batch).await.unwrap();
    assert_eq!(result.accepted, 50);

    assert_eq!(store.queued_at_write.load(Ordering::SeqCst), 0, "event queued before commit");

    let frames = drain(&market).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "prices_updated");
    assert_eq!(frames[0]["channel"], "market");
    assert_eq!(frames[0]["data"]["count"], 50);
    assert_eq!(frames[0]["data"]["marketplaces"], serde_json::json!([1, 2]));

    let card_frames = drain(&card_seven).await;
    assert_eq!(card_frames.len(), 1);
    assert_eq!(card_frames[0]["type"], "card_prices_updated");
    assert_eq!(card_frames[0]["data"]["count"], 1);
}

#[tokio::test]
async fn test_invalid_rows_are_skipped_not_fatal() {
    let store = Arc::new(MemorySnapshotStore::new());
    let c = components(store.clone());
    let t = now() - Duration::hours(1);
    let mut bad_price = quote(2, 1, 0, "USD", t);
    bad_price.price = Some(Decimal::ZERO);
    let mut no_currency = quote(3, 1, 500, "USD", t);
    no_currency.currency = None;

    let result = c
        .pipeline
        .normalize_and_store("cardmarket", vec![quote(1, 1, 500, "EUR", t), bad_price, no_currency])
        .await
        .unwrap();

    assert_eq!(result.accepted, 1);
    assert_eq!(result.skipped, 2);
    assert_eq!(result.errors.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_extreme_prices_are_rejected_before_aggregation() {
    let store = Arc::new(MemorySnapshotStore::new());
    let c = components(store.clone());
    let t = Utc::now() - Duration::minutes(20);
    let mut huge_a = quote(1, 1, 0, "USD", t);
    huge_a.price = Some(Decimal::MAX / Decimal::TWO + Decimal::ONE);
    let mut huge_b = quote(2, 1, 0, "USD", t);
    huge_b.price = Some(Decimal::MAX / Decimal::TWO + Decimal::ONE);
    let mut dust = quote(3, 1, 0, "USD", t);
    dust.price = Some(Decimal::new(1, 5));

    let result = c
        .pipeline
        .normalize_and_store("s", vec![huge_a, huge_b, dust, quote(4, 1, 250, "USD", t)])
        .await
        .unwrap();
    assert_eq!(result.accepted, 1);
    assert_eq!(result.skipped, 3);
    assert_eq!(
        result.errors.iter().map(|e| e.kind).collect::<Vec<_>>(),
        vec!["price_out_of_range", "price_out_of_range", "non_positive_price"]
    );

    let stored = store
        .scan(&ScanRequest::closed(
            Currency::USD,
            DimensionFilter::any(),
            t - Duration::minutes(1),
            Utc::now(),
        ))
        .await
        .unwrap();
    assert!(stored.iter().all(|r| r.price > Decimal::ZERO));

    let series = c
        .index
        .get_index(Currency::USD, Period::D7, DimensionFilter::any(), Utc::now())
        .await;
    assert!(!series.degraded);
    assert_eq!(series.points.iter().map(|p| p.sample_count).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_index_never_mixes_currencies() {
    let store = Arc::new(MemorySnapshotStore::new());
    let c = components(store.clone());
    let t = Utc::now() - Duration::minutes(20);
    let batch = vec![
        quote(1, 1, 1000, "USD", t),
        quote(2, 1, 2000, "USD", t),
        quote(1, 2, 99900, "EUR", t),
    ];
    c.pipeline.normalize_and_store("mixed", batch).await.unwrap();

    let usd = c
        .index
        .get_index(Currency::USD, Period::D7, DimensionFilter::any(), Utc::now())
        .await;
    assert_eq!(usd.currency, Currency::USD);
    assert_eq!(usd.points.iter().map(|p| p.sample_count).sum::<u64>(), 2);
    assert!(usd.points.iter().all(|p| p.max_price <= Decimal::new(2000, 2)));

    let eur = c
        .index
        .get_index(Currency::EUR, Period::D7, DimensionFilter::any(), Utc::now())
        .await;
    assert_eq!(eur.points.iter().map(|p| p.sample_count).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_seven_day_query_splits_at_lag() {
    let store = Arc::new(MemorySnapshotStore::new());
    let buckets = Arc::new(BucketStore::new());
    let config = AggregationConfig::default();
    let materializer = Materializer::new(store.clone(), buckets.clone(), config.clone());
    let engine = AggregationEngine::new(store.clone(), buckets.clone(), config);

    let rows: Vec<PriceSnapshot> = (0..48)
        .map(|i| snapshot(1 + (i % 3), 1000 + i as i64, Currency::USD, now() - Duration::minutes(i as i64 * 17 + 1)))
        .collect();
    store.upsert_many(rows).await.unwrap();
    materializer.materialize(Granularity::M30, now()).await.unwrap();

    let series = engine.query(Currency::USD, Period::D7, DimensionFilter::any(), now()).await;
    let lag_cutover = now() - Duration::minutes(30);
    assert_eq!(series.cutover, lag_cutover);
    assert!(!series.degraded);
    assert!(series.points.len() > 1);
    assert!(series.points.windows(2).all(|w| w[0].bucket_time < w[1].bucket_time));
    assert_eq!(series.points.last().unwrap().bucket_time, lag_cutover);

    let raw = engine
        .query_raw(Currency::USD, Period::D7, DimensionFilter::any(), now())
        .await
        .unwrap();
    assert_eq!(series.points, raw);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_merged_series_equals_raw_recompute(
        rows in prop::collection::vec((1u64..6, 1i64..100_000, 0i64..(7 * 24 * 60)), 1..80),
        materialized_ago_minutes in 0i64..600,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let store = Arc::new(MemorySnapshotStore::new());
            let buckets = Arc::new(BucketStore::new());
            let config = AggregationConfig::default();
            let materializer = Materializer::new(store.clone(), buckets.clone(), config.clone());
            let engine = AggregationEngine::new(store.clone(), buckets, config);

            let snapshots: Vec<PriceSnapshot> = rows
                .iter()
                .map(|(card, cents, ago)| snapshot(*card, *cents, Currency::USD, now() - Duration::minutes(*ago)))
                .collect();
            store.upsert_many(snapshots).await.unwrap();
            materializer
                .materialize(Granularity::M30, now() - Duration::minutes(materialized_ago_minutes))
                .await
                .unwrap();

            let merged = engine.query(Currency::USD, Period::D7, DimensionFilter::any(), now()).await;
            let raw = engine
                .query_raw(Currency::USD, Period::D7, DimensionFilter::any(), now())
                .await
                .unwrap();
            prop_assert!(!merged.degraded);
            prop_assert_eq!(merged.points, raw);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
