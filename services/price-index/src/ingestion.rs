//! Ingestion Normalizer
//!
//! Turns raw marketplace quotes into canonical snapshot rows and commits
//! them. Bad rows are skipped and counted, never fatal to their batch.
//! After a commit that stored at least one new row, exactly one downstream
//! signal goes out: cache invalidation for the market and every affected
//! card, then one `prices_updated` event on `market` and one
//! `card_prices_updated` event per affected card. The signal is only sent
//! once `upsert_many` has returned, i.e. once the rows are durable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use types::errors::ValidationError;
use types::ids::CardId;
use types::numeric::{round_price, Currency, MAX_PRICE};
use types::snapshot::{PriceQuote, PriceSnapshot};
use types::variant::{Condition, Language};

use crate::broadcaster::Broadcaster;
use crate::cache::{CacheLayer, KeyPattern};
use crate::error::IngestError;
use crate::events::{BatchSummary, ChannelEvent};
use crate::metrics::ServiceMetrics;
use crate::store::SnapshotStore;

fn normalize_alias(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const CONDITION_ALIASES: &[(&str, Condition)] = &[
    ("mint", Condition::Mint),
    ("m", Condition::Mint),
    ("gem mint", Condition::Mint),
    ("near mint", Condition::NearMint),
    ("nearmint", Condition::NearMint),
    ("nm", Condition::NearMint),
    ("nm/m", Condition::NearMint),
    ("nm-m", Condition::NearMint),
    ("lightly played", Condition::LightlyPlayed),
    ("slightly played", Condition::LightlyPlayed),
    ("lp", Condition::LightlyPlayed),
    ("sp", Condition::LightlyPlayed),
    ("excellent", Condition::LightlyPlayed),
    ("ex", Condition::LightlyPlayed),
    ("moderately played", Condition::ModeratelyPlayed),
    ("mp", Condition::ModeratelyPlayed),
    ("played", Condition::ModeratelyPlayed),
    ("pl", Condition::ModeratelyPlayed),
    ("good", Condition::ModeratelyPlayed),
    ("gd", Condition::ModeratelyPlayed),
    ("heavily played", Condition::HeavilyPlayed),
    ("hp", Condition::HeavilyPlayed),
    ("poor", Condition::HeavilyPlayed),
    ("po", Condition::HeavilyPlayed),
    ("damaged", Condition::Damaged),
    ("dmg", Condition::Damaged),
];

const LANGUAGE_ALIASES: &[(&str, Language)] = &[
    ("english", Language::English),
    ("en", Language::English),
    ("eng", Language::English),
    ("japanese", Language::Japanese),
    ("ja", Language::Japanese),
    ("jp", Language::Japanese),
    ("jpn", Language::Japanese),
    ("german", Language::German),
    ("de", Language::German),
    ("deutsch", Language::German),
    ("ger", Language::German),
    ("french", Language::French),
    ("fr", Language::French),
    ("francais", Language::French),
    ("italian", Language::Italian),
    ("it", Language::Italian),
    ("ita", Language::Italian),
    ("spanish", Language::Spanish),
    ("es", Language::Spanish),
    ("spa", Language::Spanish),
    ("portuguese", Language::Portuguese),
    ("pt", Language::Portuguese),
    ("korean", Language::Korean),
    ("ko", Language::Korean),
    ("kr", Language::Korean),
    ("russian", Language::Russian),
    ("ru", Language::Russian),
    ("chinese simplified", Language::ChineseSimplified),
    ("simplified chinese", Language::ChineseSimplified),
    ("s-chinese", Language::ChineseSimplified),
    ("zhs", Language::ChineseSimplified),
    ("zh-cn", Language::ChineseSimplified),
    ("chinese traditional", Language::ChineseTraditional),
    ("traditional chinese", Language::ChineseTraditional),
    ("t-chinese", Language::ChineseTraditional),
    ("zht", Language::ChineseTraditional),
    ("zh-tw", Language::ChineseTraditional),
];

/// Maps source spellings of condition and language to canonical values.
///
/// Lookups try the source's overrides first, then the built-in table.
#[derive(Debug, Clone)]
pub struct AliasTable {
    conditions: HashMap<String, Condition>,
    languages: HashMap<String, Language>,
    condition_overrides: HashMap<String, HashMap<String, Condition>>,
    language_overrides: HashMap<String, HashMap<String, Language>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut conditions: HashMap<String, Condition> = CONDITION_ALIASES
            .iter()
            .map(|(alias, c)| (normalize_alias(alias), *c))
            .collect();
        for c in Condition::all() {
            conditions.insert(normalize_alias(c.as_str()), *c);
        }
        let languages = LANGUAGE_ALIASES
            .iter()
            .map(|(alias, l)| (normalize_alias(alias), *l))
            .collect();
        Self {
            conditions,
            languages,
            condition_overrides: HashMap::new(),
            language_overrides: HashMap::new(),
        }
    }
}

impl AliasTable {
    pub fn with_condition_override(mut self, source: &str, raw: &str, condition: Condition) -> Self {
        self.condition_overrides
            .entry(source.to_string())
            .or_default()
            .insert(normalize_alias(raw), condition);
        self
    }

    pub fn with_language_override(mut self, source: &str, raw: &str, language: Language) -> Self {
        self.language_overrides
            .entry(source.to_string())
            .or_default()
            .insert(normalize_alias(raw), language);
        self
    }

    /// Canonical condition and whether the baseline was substituted for an
    /// unrecognized value.
    pub fn condition(&self, source: &str, raw: Option<&str>) -> (Condition, bool) {
        let Some(raw) = raw.map(normalize_alias).filter(|r| !r.is_empty()) else {
            return (Condition::BASELINE, false);
        };
        self.condition_overrides
            .get(source)
            .and_then(|o| o.get(&raw))
            .or_else(|| self.conditions.get(&raw))
            .map(|c| (*c, false))
            .unwrap_or((Condition::BASELINE, true))
    }

    pub fn language(&self, source: &str, raw: Option<&str>) -> (Language, bool) {
        let Some(raw) = raw.map(normalize_alias).filter(|r| !r.is_empty()) else {
            return (Language::BASELINE, false);
        };
        self.language_overrides
            .get(source)
            .and_then(|o| o.get(&raw))
            .or_else(|| self.languages.get(&raw))
            .map(|l| (*l, false))
            .unwrap_or((Language::BASELINE, true))
    }
}

/// A quote that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub snapshot: PriceSnapshot,
    /// Dimensions that fell back to the baseline (0..=2).
    pub defaulted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: AliasTable,
}

impl Normalizer {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    /// Validate and canonicalize one quote.
    pub fn normalize(&self, source: &str, quote: &PriceQuote) -> Result<Normalized, ValidationError> {
        let raw_price = quote.price.ok_or(ValidationError::MissingPrice)?;
        // Checked after rounding: the stored value is what must be positive.
        let price = round_price(raw_price);
        if price <= Decimal::ZERO {
            return Err(ValidationError::NonPositivePrice(raw_price.to_string()));
        }
        if price > MAX_PRICE {
            return Err(ValidationError::PriceOutOfRange(raw_price.to_string()));
        }

        let auxiliary = [
            ("price_low", quote.price_low),
            ("price_mid", quote.price_mid),
            ("price_high", quote.price_high),
            ("price_market", quote.price_market),
        ];
        for (field, value) in auxiliary {
            if let Some(v) = value {
                if v < Decimal::ZERO {
                    return Err(ValidationError::NegativeAuxiliaryPrice {
                        field,
                        value: v.to_string(),
                    });
                }
            }
        }

        let currency = match quote.currency.as_deref().map(str::trim) {
            None | Some("") => return Err(ValidationError::MissingCurrency),
            Some(raw) => Currency::parse(raw)?,
        };

        let source_tag = if quote.source.trim().is_empty() {
            source.to_string()
        } else {
            quote.source.trim().to_string()
        };
        let (condition, condition_defaulted) = self.aliases.condition(&source_tag, quote.condition.as_deref());
        let (language, language_defaulted) = self.aliases.language(&source_tag, quote.language.as_deref());
        if condition_defaulted || language_defaulted {
            debug!(
                source = %source_tag,
                card_id = %quote.card_id,
                condition = ?quote.condition,
                language = ?quote.language,
                "Unmapped variant value, using baseline"
            );
        }

        Ok(Normalized {
            snapshot: PriceSnapshot {
                time: quote.time,
                card_id: quote.card_id,
                marketplace_id: quote.marketplace_id,
                condition,
                is_foil: quote.is_foil,
                language,
                price,
                price_low: quote.price_low.map(round_price),
                price_mid: quote.price_mid.map(round_price),
                price_high: quote.price_high.map(round_price),
                price_market: quote.price_market.map(round_price),
                currency,
                num_listings: quote.num_listings,
                total_quantity: quote.total_quantity,
                source: source_tag,
            },
            defaulted: usize::from(condition_defaulted) + usize::from(language_defaulted),
        })
    }
}

/// A skipped row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// Position of the row in its batch.
    pub index: usize,
    pub card_id: CardId,
    pub error: String,
    pub kind: &'static str,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    /// Rows newly stored.
    pub accepted: usize,
    /// Valid rows whose identity was already stored.
    pub duplicates: usize,
    /// Rows rejected by validation.
    pub skipped: usize,
    /// Variant dimensions defaulted to baseline.
    pub defaulted: usize,
    pub errors: Vec<RowError>,
    /// Events published for this batch.
    pub events: usize,
}

/// Normalize, store, then signal.
pub struct IngestionPipeline {
    normalizer: Normalizer,
    store: Arc<dyn SnapshotStore>,
    cache: Arc<CacheLayer>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<ServiceMetrics>,
}

impl IngestionPipeline {
    pub fn new(
        normalizer: Normalizer,
        store: Arc<dyn SnapshotStore>,
        cache: Arc<CacheLayer>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            normalizer,
            store,
            cache,
            broadcaster,
            metrics,
        }
    }

    /// Normalize `batch` from `source` and commit it.
    ///
    /// Only an unreachable store fails the call; every other problem is
    /// reported in the result.
    pub async fn normalize_and_store(
        &self,
        source: &str,
        batch: Vec<PriceQuote>,
    ) -> Result<IngestResult, IngestError> {
        let total = batch.len();
        let mut result = IngestResult::default();
        let mut rows = Vec::with_capacity(total);

        for (index, quote) in batch.iter().enumerate() {
            match self.normalizer.normalize(source, quote) {
                Ok(normalized) => {
                    result.defaulted += normalized.defaulted;
                    rows.push(normalized.snapshot);
                }
                Err(e) => {
                    debug!(source, index, card_id = %quote.card_id, error = %e, "Skipping invalid quote");
                    result.skipped += 1;
                    result.errors.push(RowError {
                        index,
                        card_id: quote.card_id,
                        error: e.to_string(),
                        kind: e.label(),
                    });
                }
            }
        }

        if rows.is_empty() {
            self.metrics.record_batch(0, 0, result.skipped, result.defaulted);
            info!(source, total, skipped = result.skipped, "Batch had no valid rows");
            return Ok(result);
        }

        let outcome = match self.store.upsert_many(rows).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_store_failure();
                error!(source, total, error = %e, "Snapshot store write failed");
                return Err(IngestError::StoreUnavailable(e));
            }
        };
        result.accepted = outcome.inserted.len();
        result.duplicates = outcome.duplicates;
        if result.duplicates > 0 {
            debug!(source, duplicates = result.duplicates, "Duplicate rows ignored");
        }

        if !outcome.inserted.is_empty() {
            let mut summary = BatchSummary {
                source: source.to_string(),
                count: outcome.inserted.len(),
                ..BatchSummary::default()
            };
            let mut per_card: BTreeMap<CardId, usize> = BTreeMap::new();
            for key in &outcome.inserted {
                summary.marketplaces.insert(key.marketplace_id);
                summary.cards.insert(key.card_id);
                *per_card.entry(key.card_id).or_default() += 1;
            }
            result.events = self.signal(&summary, &per_card).await;
        }

        self.metrics
            .record_batch(result.accepted, result.duplicates, result.skipped, result.defaulted);
        info!(
            source,
            total,
            accepted = result.accepted,
            duplicates = result.duplicates,
            skipped = result.skipped,
            defaulted = result.defaulted,
            "Batch committed"
        );
        Ok(result)
    }

    /// Post-commit signal: invalidate, then publish.
    async fn signal(&self, summary: &BatchSummary, per_card: &BTreeMap<CardId, usize>) -> usize {
        let mut scopes = Vec::with_capacity(per_card.len() + 1);
        scopes.push(KeyPattern::market_scope());
        scopes.extend(per_card.keys().map(|card| KeyPattern::card_scope(*card)));
        for scope in &scopes {
            if let Err(e) = self.cache.invalidate(scope).await {
                warn!(pattern = %scope, error = %e, "Cache invalidation failed");
            }
        }

        let mut published = 0;
        self.broadcaster.publish(&ChannelEvent::prices_updated(summary));
        published += 1;
        for (card_id, count) in per_card {
            self.broadcaster
                .publish(&ChannelEvent::card_prices_updated(*card_id, *count, &summary.source));
            published += 1;
        }
        self.metrics.record_events_published(published);
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use types::ids::MarketplaceId;

    fn quote(card: u64) -> PriceQuote {
        PriceQuote {
            source: String::new(),
            card_id: CardId::new(card),
            marketplace_id: MarketplaceId::new(1),
            condition: Some("NM".to_string()),
            is_foil: false,
            language: Some("English".to_string()),
            price: Some(Decimal::new(1000, 2)),
            price_low: None,
            price_mid: None,
            price_high: None,
            price_market: None,
            currency: Some("usd".to_string()),
            num_listings: Some(3),
            total_quantity: Some(5),
            time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_alias_lookup() {
        let table = AliasTable::default();
        assert_eq!(table.condition("x", Some(" Near  Mint ")), (Condition::NearMint, false));
        assert_eq!(table.condition("x", Some("LIGHTLY_PLAYED")), (Condition::LightlyPlayed, false));
        assert_eq!(table.condition("x", Some("pristine")), (Condition::NearMint, true));
        assert_eq!(table.condition("x", None), (Condition::NearMint, false));
        assert_eq!(table.language("x", Some("JP")), (Language::Japanese, false));
        assert_eq!(table.language("x", Some("zh-TW")), (Language::ChineseTraditional, false));
        assert_eq!(table.language("x", Some("klingon")), (Language::English, true));
    }

    #[test]
    fn test_source_override_wins() {
        let table = AliasTable::default().with_condition_override("cardmarket", "EX", Condition::NearMint);
        assert_eq!(table.condition("cardmarket", Some("ex")), (Condition::NearMint, false));
        assert_eq!(table.condition("tcgplayer", Some("ex")), (Condition::LightlyPlayed, false));
    }

    #[test]
    fn test_normalize_canonicalizes() {
        let n = Normalizer::default().normalize("tcg", &quote(1)).unwrap();
        assert_eq!(n.snapshot.condition, Condition::NearMint);
        assert_eq!(n.snapshot.language, Language::English);
        assert_eq!(n.snapshot.currency, Currency::USD);
        assert_eq!(n.snapshot.source, "tcg");
        assert_eq!(n.defaulted, 0);
    }

    #[test]
    fn test_normalize_rejections() {
        let normalizer = Normalizer::default();

        let mut q = quote(1);
        q.price = Some(Decimal::ZERO);
        assert!(matches!(
            normalizer.normalize("s", &q),
            Err(ValidationError::NonPositivePrice(_))
        ));

        let mut q = quote(1);
        q.price = None;
        assert_eq!(normalizer.normalize("s", &q), Err(ValidationError::MissingPrice));

        let mut q = quote(1);
        q.price = Some(Decimal::new(1, 5));
        assert!(matches!(
            normalizer.normalize("s", &q),
            Err(ValidationError::NonPositivePrice(_))
        ));

        let mut q = quote(1);
        q.price = Some(Decimal::new(5, 5));
        assert_eq!(
            normalizer.normalize("s", &q).unwrap().snapshot.price,
            Decimal::new(1, 4)
        );

        let mut q = quote(1);
        q.price = Some(MAX_PRICE + Decimal::ONE);
        assert!(matches!(
            normalizer.normalize("s", &q),
            Err(ValidationError::PriceOutOfRange(_))
        ));

        let mut q = quote(1);
        q.price = Some(MAX_PRICE);
        assert!(normalizer.normalize("s", &q).is_ok());

        let mut q = quote(1);
        q.currency = Some("  ".to_string());
        assert_eq!(normalizer.normalize("s", &q), Err(ValidationError::MissingCurrency));

        let mut q = quote(1);
        q.currency = Some("US".to_string());
        assert!(matches!(
            normalizer.normalize("s", &q),
            Err(ValidationError::InvalidCurrency(_))
        ));

        let mut q = quote(1);
        q.price_low = Some(Decimal::new(-1, 0));
        assert!(matches!(
            normalizer.normalize("s", &q),
            Err(ValidationError::NegativeAuxiliaryPrice { field: "price_low", .. })
        ));
    }

    #[test]
    fn test_unmapped_values_default() {
        let mut q = quote(1);
        q.condition = Some("like new-ish".to_string());
        q.language = Some("elvish".to_string());
        let n = Normalizer::default().normalize("s", &q).unwrap();
        assert_eq!(n.snapshot.condition, Condition::BASELINE);
        assert_eq!(n.snapshot.language, Language::BASELINE);
        assert_eq!(n.defaulted, 2);
    }
}
