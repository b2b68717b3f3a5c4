//! Aggregation Engine
//!
//! Materialized rollups per granularity, merged at query time with a live
//! tail computed from raw snapshot rows.

pub mod bucket;
pub mod bucket_store;
pub mod engine;
pub mod granularity;
pub mod materializer;

pub use bucket::{bucket_rows, AggregateBucket, BucketMetrics};
pub use bucket_store::{BucketStore, Coverage, SeriesKey};
pub use engine::{AggregationEngine, DegradedReason, IndexPoint, IndexSeries};
pub use granularity::{Granularity, Period};
pub use materializer::{MaterializeReport, Materializer};
