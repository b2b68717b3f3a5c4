use axum::{extract::State, Json};
use serde::Deserialize;
use types::snapshot::PriceQuote;

use crate::http::error::AppError;
use crate::http::state::AppState;
use crate::ingestion::IngestResult;

/// Batch pushed by an adapter that delivers instead of being polled.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub source: String,
    pub quotes: Vec<PriceQuote>,
}

pub async fn ingest_batch(
    State(state): State<AppState>,
    Json(payload): Json<IngestRequest>,
) -> Result<Json<IngestResult>, AppError> {
    if payload.source.trim().is_empty() {
        return Err(AppError::BadRequest("source must not be empty".into()));
    }
    let result = state
        .components
        .pipeline
        .normalize_and_store(payload.source.trim(), payload.quotes)
        .await?;
    Ok(Json(result))
}
