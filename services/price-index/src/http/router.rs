use axum::{
    extract::OriginalUri,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::http::error::AppError;
use crate::http::handlers::{health, index, ingest, ws};
use crate::http::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/index", get(index::get_index))
        .route("/cards/{id}/history", get(index::get_card_history))
        .route("/ingest", post(ingest::ingest_batch));

    Router::new()
        .nest("/v1", api_routes)
        .route("/health", get(health::health))
        .route("/ws", get(ws::ws_handler))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found(OriginalUri(uri): OriginalUri) -> AppError {
    AppError::NotFound(format!("no route for {}", uri.path()))
}
