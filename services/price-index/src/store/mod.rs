//! Snapshot Store: append-only fact storage for normalized price rows
//!
//! Pure data layer. Rows are unique on their `SnapshotKey`; writing a key
//! that already exists is a no-op reported as a duplicate, never an error.
//! Reads are window scans that always carry a currency.

pub mod journal;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use types::numeric::Currency;
use types::snapshot::{PriceSnapshot, SnapshotKey};
use types::variant::DimensionFilter;

use crate::error::StoreError;

pub use journal::JournalSnapshotStore;
pub use memory::MemorySnapshotStore;

/// Outcome of an idempotent batch upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Keys written by this call, in input order.
    pub inserted: Vec<SnapshotKey>,
    /// Rows whose key already existed (including repeats within the batch).
    pub duplicates: usize,
}

impl UpsertOutcome {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

/// Window scan over one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub currency: Currency,
    pub filter: DimensionFilter,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Whether rows at exactly `to` are included.
    pub to_inclusive: bool,
}

impl ScanRequest {
    /// `[from, to)`
    pub fn half_open(
        currency: Currency,
        filter: DimensionFilter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Self {
        Self {
            currency,
            filter,
            from,
            to,
            to_inclusive: false,
        }
    }

    /// `[from, to]`
    pub fn closed(
        currency: Currency,
        filter: DimensionFilter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Self {
        Self {
            currency,
            filter,
            from,
            to,
            to_inclusive: true,
        }
    }

    /// Whether `row` falls inside this scan.
    pub fn admits(&self, row: &PriceSnapshot) -> bool {
        let within_upper = if self.to_inclusive {
            row.time <= self.to
        } else {
            row.time < self.to
        };
        row.time >= self.from
            && within_upper
            && row.currency == self.currency
            && self
                .filter
                .matches(row.card_id, row.condition, row.is_foil, row.language)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert rows whose key is not yet present. Durable when this returns `Ok`.
    async fn upsert_many(&self, rows: Vec<PriceSnapshot>) -> Result<UpsertOutcome, StoreError>;

    /// Rows admitted by `request`, ordered by key.
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<PriceSnapshot>, StoreError>;

    /// Every currency with at least one stored row.
    async fn currencies(&self) -> Result<Vec<Currency>, StoreError>;

    /// Number of stored rows.
    async fn len(&self) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
