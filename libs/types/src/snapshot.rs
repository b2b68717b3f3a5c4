//! Raw quotes and canonical snapshot fact rows
//!
//! `PriceQuote` is what an external adapter hands over; it is transient and
//! discarded after normalization. `PriceSnapshot` is the immutable fact row
//! written to the snapshot store, unique on its `SnapshotKey`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{CardId, MarketplaceId};
use crate::numeric::Currency;
use crate::variant::{Condition, Language};

/// A price observation as delivered by a marketplace adapter.
///
/// Variant and currency fields are raw source spellings; numeric fields may
/// be missing or nonsensical. Nothing here has been validated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Source tag of the adapter that produced the quote.
    #[serde(default)]
    pub source: String,
    pub card_id: CardId,
    pub marketplace_id: MarketplaceId,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_foil: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub price_low: Option<Decimal>,
    #[serde(default)]
    pub price_mid: Option<Decimal>,
    #[serde(default)]
    pub price_high: Option<Decimal>,
    #[serde(default)]
    pub price_market: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub num_listings: Option<u32>,
    #[serde(default)]
    pub total_quantity: Option<u32>,
    /// Observation time reported by the source.
    pub time: DateTime<Utc>,
}

/// Composite identity of a snapshot row.
///
/// Field order is significant: deriving `Ord` with `time` first makes a
/// time window a contiguous range of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub time: DateTime<Utc>,
    pub card_id: CardId,
    pub marketplace_id: MarketplaceId,
    pub condition: Condition,
    pub is_foil: bool,
    pub language: Language,
}

impl SnapshotKey {
    /// Smallest key at or after `time`.
    pub fn lower_bound(time: DateTime<Utc>) -> Self {
        Self {
            time,
            card_id: CardId::new(0),
            marketplace_id: MarketplaceId::new(0),
            condition: Condition::Mint,
            is_foil: false,
            language: Language::English,
        }
    }
}

/// Canonical, immutable price observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub time: DateTime<Utc>,
    pub card_id: CardId,
    pub marketplace_id: MarketplaceId,
    pub condition: Condition,
    pub is_foil: bool,
    pub language: Language,
    pub price: Decimal,
    pub price_low: Option<Decimal>,
    pub price_mid: Option<Decimal>,
    pub price_high: Option<Decimal>,
    pub price_market: Option<Decimal>,
    pub currency: Currency,
    pub num_listings: Option<u32>,
    pub total_quantity: Option<u32>,
    pub source: String,
}

impl PriceSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            time: self.time,
            card_id: self.card_id,
            marketplace_id: self.marketplace_id,
            condition: self.condition,
            is_foil: self.is_foil,
            language: self.language,
        }
    }

    /// Units represented by this observation, used as bucket volume.
    pub fn volume(&self) -> u64 {
        u64::from(self.total_quantity.unwrap_or(0))
    }
}
