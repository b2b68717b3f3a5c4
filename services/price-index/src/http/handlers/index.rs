use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use types::ids::CardId;
use types::numeric::Currency;
use types::variant::{Condition, DimensionFilter, Language};

use crate::aggregation::{IndexSeries, Period};
use crate::http::error::AppError;
use crate::http::state::AppState;

/// Query string shared by the index and card history endpoints.
#[derive(Debug, Deserialize)]
pub struct IndexParams {
    pub currency: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_foil: Option<bool>,
    #[serde(default)]
    pub language: Option<String>,
}

impl IndexParams {
    fn parse(&self) -> Result<(Currency, Period, DimensionFilter), AppError> {
        let currency = Currency::parse(&self.currency).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let period = match &self.period {
            Some(raw) => raw.parse::<Period>().map_err(AppError::BadRequest)?,
            None => Period::D7,
        };

        let mut filter = DimensionFilter::any();
        if let Some(raw) = &self.condition {
            let condition = Condition::from_canonical(&raw.trim().to_ascii_uppercase())
                .ok_or_else(|| AppError::BadRequest(format!("Unknown condition: {}", raw)))?;
            filter = filter.with_condition(condition);
        }
        if let Some(is_foil) = self.is_foil {
            filter = filter.with_foil(is_foil);
        }
        if let Some(raw) = &self.language {
            let language = Language::from_canonical(raw.trim())
                .ok_or_else(|| AppError::BadRequest(format!("Unknown language: {}", raw)))?;
            filter = filter.with_language(language);
        }
        Ok((currency, period, filter))
    }
}

pub async fn get_index(
    State(state): State<AppState>,
    Query(params): Query<IndexParams>,
) -> Result<Json<IndexSeries>, AppError> {
    let (currency, period, filter) = params.parse()?;
    let series = state
        .components
        .index
        .get_index(currency, period, filter, Utc::now())
        .await;
    Ok(Json(series))
}

pub async fn get_card_history(
    State(state): State<AppState>,
    Path(card_id): Path<u64>,
    Query(params): Query<IndexParams>,
) -> Result<Json<IndexSeries>, AppError> {
    let (currency, period, filter) = params.parse()?;
    let series = state
        .components
        .index
        .get_card_history(CardId::new(card_id), currency, period, filter, Utc::now())
        .await;
    Ok(Json(series))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(currency: &str) -> IndexParams {
        IndexParams {
            currency: currency.to_string(),
            period: None,
            condition: None,
            is_foil: None,
            language: None,
        }
    }

    #[test]
    fn test_defaults_to_seven_days_unfiltered() {
        let (currency, period, filter) = params("usd").parse().unwrap();
        assert_eq!(currency, Currency::USD);
        assert_eq!(period, Period::D7);
        assert_eq!(filter, DimensionFilter::any());
    }

    #[test]
    fn test_filter_dimensions_parse() {
        let mut p = params("EUR");
        p.period = Some("90d".to_string());
        p.condition = Some("near_mint".to_string());
        p.is_foil = Some(true);
        p.language = Some("ja".to_string());
        let (_, period, filter) = p.parse().unwrap();
        assert_eq!(period, Period::D90);
        assert_eq!(
            filter,
            DimensionFilter::any()
                .with_condition(Condition::NearMint)
                .with_foil(true)
                .with_language(Language::Japanese)
        );
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(params("dollars").parse().is_err());
        let mut p = params("USD");
        p.period = Some("2w".to_string());
        assert!(p.parse().is_err());
    }
}
