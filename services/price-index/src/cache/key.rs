//! Hierarchical cache keys: `<scope>:<id>:<qualifier>[:<qualifier>...]`
//!
//! Invalidation takes a prefix pattern ending in `*`, e.g. `card:123:*`.

use std::fmt;

use types::ids::CardId;
use types::numeric::Currency;
use types::variant::DimensionFilter;

use crate::aggregation::Period;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(scope: &str, id: &str, qualifiers: &[&str]) -> Self {
        let mut key = format!("{}:{}", scope, id);
        for q in qualifiers {
            key.push(':');
            key.push_str(q);
        }
        CacheKey(key)
    }

    /// `market:index:<period>:<CUR>:<condition>:<foil>:<language>`
    pub fn market_index(period: Period, currency: Currency, filter: &DimensionFilter) -> Self {
        let [condition, foil, language] = filter.qualifiers();
        Self::new(
            "market",
            "index",
            &[period.label(), currency.as_str(), condition.as_str(), foil.as_str(), language.as_str()],
        )
    }

    /// `card:<id>:history:<period>:<CUR>:<condition>:<foil>:<language>`
    pub fn card_history(card_id: CardId, period: Period, currency: Currency, filter: &DimensionFilter) -> Self {
        let [condition, foil, language] = filter.qualifiers();
        Self::new(
            "card",
            &card_id.to_string(),
            &["history", period.label(), currency.as_str(), condition.as_str(), foil.as_str(), language.as_str()],
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either one exact key or every key sharing a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    /// `"a:b:*"` is a prefix pattern, anything else is exact.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
            None => KeyPattern::Exact(pattern.to_string()),
        }
    }

    /// Every market-wide key.
    pub fn market_scope() -> Self {
        KeyPattern::Prefix("market:".to_string())
    }

    /// Every key of one card.
    pub fn card_scope(card_id: CardId) -> Self {
        KeyPattern::Prefix(format!("card:{}:", card_id))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => key == exact,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }

    /// Redis `MATCH` glob with `namespace` prepended and glob metacharacters
    /// in the literal part escaped.
    pub fn to_glob(&self, namespace: &str) -> String {
        let escape = |s: &str| {
            let mut out = String::with_capacity(s.len());
            for c in s.chars() {
                if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                    out.push('\\');
                }
                out.push(c);
            }
            out
        };
        match self {
            KeyPattern::Exact(exact) => format!("{}{}", escape(namespace), escape(exact)),
            KeyPattern::Prefix(prefix) => format!("{}{}*", escape(namespace), escape(prefix)),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(exact) => f.write_str(exact),
            KeyPattern::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}
