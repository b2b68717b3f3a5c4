//! Canonical variant dimensions and dimension filters
//!
//! A snapshot's variant is (condition, is_foil, language). Source-specific
//! spellings are mapped onto these enumerations by the ingestion normalizer;
//! nothing downstream ever sees a raw string.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::CardId;

/// Card condition grade, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Mint,
    NearMint,
    LightlyPlayed,
    ModeratelyPlayed,
    HeavilyPlayed,
    Damaged,
}

impl Condition {
    /// Baseline grade used when a source value cannot be mapped.
    pub const BASELINE: Condition = Condition::NearMint;

    pub fn all() -> &'static [Condition] {
        &[
            Condition::Mint,
            Condition::NearMint,
            Condition::LightlyPlayed,
            Condition::ModeratelyPlayed,
            Condition::HeavilyPlayed,
            Condition::Damaged,
        ]
    }

    /// Wire / cache-key spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Mint => "MINT",
            Condition::NearMint => "NEAR_MINT",
            Condition::LightlyPlayed => "LIGHTLY_PLAYED",
            Condition::ModeratelyPlayed => "MODERATELY_PLAYED",
            Condition::HeavilyPlayed => "HEAVILY_PLAYED",
            Condition::Damaged => "DAMAGED",
        }
    }

    pub fn from_canonical(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Printed language of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Language {
    English,
    Japanese,
    German,
    French,
    Italian,
    Spanish,
    Portuguese,
    Korean,
    Russian,
    ChineseSimplified,
    ChineseTraditional,
}

impl Language {
    /// Baseline language used when a source value cannot be mapped.
    pub const BASELINE: Language = Language::English;

    pub fn all() -> &'static [Language] {
        &[
            Language::English,
            Language::Japanese,
            Language::German,
            Language::French,
            Language::Italian,
            Language::Spanish,
            Language::Portuguese,
            Language::Korean,
            Language::Russian,
            Language::ChineseSimplified,
            Language::ChineseTraditional,
        ]
    }

    /// Short code used in cache keys and aliases.
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Japanese => "ja",
            Language::German => "de",
            Language::French => "fr",
            Language::Italian => "it",
            Language::Spanish => "es",
            Language::Portuguese => "pt",
            Language::Korean => "ko",
            Language::Russian => "ru",
            Language::ChineseSimplified => "zhs",
            Language::ChineseTraditional => "zht",
        }
    }

    /// Accepts the enum name ("English") or the short code ("en").
    pub fn from_canonical(s: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|l| l.code() == s || format!("{:?}", l) == s)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Optional narrowing of an aggregation query.
///
/// `None` on a dimension means "all values". Currency is deliberately not part
/// of the filter: it is a mandatory argument of every query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DimensionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<CardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_foil: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
}

impl DimensionFilter {
    /// Filter matching every row.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_card(card_id: CardId) -> Self {
        Self {
            card_id: Some(card_id),
            ..Self::default()
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_foil(mut self, is_foil: bool) -> Self {
        self.is_foil = Some(is_foil);
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    /// Whether a row with these dimensions passes the filter.
    pub fn matches(
        &self,
        card_id: CardId,
        condition: Condition,
        is_foil: bool,
        language: Language,
    ) -> bool {
        self.card_id.map_or(true, |c| c == card_id)
            && self.condition.map_or(true, |c| c == condition)
            && self.is_foil.map_or(true, |f| f == is_foil)
            && self.language.map_or(true, |l| l == language)
    }

    /// Whether this filter is narrowed to a single card.
    pub fn is_card_scoped(&self) -> bool {
        self.card_id.is_some()
    }

    /// Variant qualifiers in fixed order, `ANY` for unset dimensions.
    ///
    /// The card dimension is not included; card-scoped keys carry the card id
    /// in their entity position instead.
    pub fn qualifiers(&self) -> [String; 3] {
        let condition = self
            .condition
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| "ANY".to_string());
        let foil = match self.is_foil {
            Some(true) => "foil".to_string(),
            Some(false) => "nonfoil".to_string(),
            None => "ANY".to_string(),
        };
        let language = self
            .language
            .map(|l| l.code().to_string())
            .unwrap_or_else(|| "ANY".to_string());
        [condition, foil, language]
    }
}
