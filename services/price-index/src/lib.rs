//! Card Price Index Service
//!
//! Ingests marketplace price quotes and serves:
//! - Canonical, idempotently stored snapshot rows
//! - Windowed market and per-card price indexes (materialized buckets merged
//!   with a live tail)
//! - A version-fenced query cache
//! - Real-time channel events over WebSocket with per-connection backpressure
//!
//! # Architecture
//!
//! ```text
//!  Marketplace adapters ──┐      POST /v1/ingest
//!                         │            │
//!                     ┌───▼────────────▼──┐
//!                     │ Ingestion         │ ← validates, canonicalizes
//!                     └───┬───────────────┘
//!                         │ upsert (durable)
//!                     ┌───▼──────────┐        ┌──────────────┐
//!                     │ Snapshot     │◄───────┤ Materializer │ (per granularity)
//!                     │ Store        │        └──────┬───────┘
//!                     └───┬──────────┘               │ buckets
//!            after commit │                    ┌─────▼────────┐
//!          ┌──────────────┼───────────┐        │ Aggregation  │◄── GET /v1/index
//!          │              │           │        │ Engine       │    (via cache)
//!   ┌──────▼─────┐ ┌──────▼──────┐    │        └──────────────┘
//!   │ Cache      │ │ Broadcaster │────┴──► GET /ws subscribers
//!   │ invalidate │ │ publish     │
//!   └────────────┘ └─────────────┘
//! ```

pub mod aggregation;
pub mod auth;
pub mod backpressure;
pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod ingestion;
pub mod logging;
pub mod metrics;
pub mod query;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod sources;
pub mod store;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
