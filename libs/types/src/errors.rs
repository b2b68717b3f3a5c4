//! Row-level validation errors
//!
//! A `ValidationError` disqualifies one quote. It is counted and skipped by
//! the ingestion layer; it never aborts the batch the row arrived in.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing price")]
    MissingPrice,

    #[error("Non-positive price: {0}")]
    NonPositivePrice(String),

    #[error("Price out of range: {0}")]
    PriceOutOfRange(String),

    #[error("Negative {field}: {value}")]
    NegativeAuxiliaryPrice { field: &'static str, value: String },

    #[error("Missing currency")]
    MissingCurrency,

    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),
}

impl ValidationError {
    /// Stable label for counters and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationError::MissingPrice => "missing_price",
            ValidationError::NonPositivePrice(_) => "non_positive_price",
            ValidationError::PriceOutOfRange(_) => "price_out_of_range",
            ValidationError::NegativeAuxiliaryPrice { .. } => "negative_auxiliary_price",
            ValidationError::MissingCurrency => "missing_currency",
            ValidationError::InvalidCurrency(_) => "invalid_currency",
        }
    }
}
