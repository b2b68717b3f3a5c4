//! In-memory snapshot index
//!
//! A `BTreeMap` keyed by `SnapshotKey`. Because keys order by time first, a
//! window scan is a range walk starting at the window's lower bound.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use types::numeric::Currency;
use types::snapshot::{PriceSnapshot, SnapshotKey};

use super::{ScanRequest, SnapshotStore, UpsertOutcome};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Index {
    rows: BTreeMap<SnapshotKey, PriceSnapshot>,
    currencies: BTreeSet<Currency>,
}

impl Index {
    fn contains(&self, key: &SnapshotKey) -> bool {
        self.rows.contains_key(key)
    }

    fn insert(&mut self, row: PriceSnapshot) -> bool {
        let key = row.key();
        if self.rows.contains_key(&key) {
            return false;
        }
        self.currencies.insert(row.currency);
        self.rows.insert(key, row);
        true
    }

    fn scan(&self, request: &ScanRequest) -> Vec<PriceSnapshot> {
        self.rows
            .range(SnapshotKey::lower_bound(request.from)..)
            .take_while(|(key, _)| {
                if request.to_inclusive {
                    key.time <= request.to
                } else {
                    key.time < request.to
                }
            })
            .filter(|(_, row)| request.admits(row))
            .map(|(_, row)| row.clone())
            .collect()
    }
}

/// Volatile snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    index: RwLock<Index>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of `rows` not yet stored, deduplicated within the batch.
    pub(crate) async fn filter_new(&self, rows: &[PriceSnapshot]) -> (Vec<PriceSnapshot>, usize) {
        let index = self.index.read().await;
        let mut seen = BTreeSet::new();
        let mut fresh = Vec::with_capacity(rows.len());
        let mut duplicates = 0;
        for row in rows {
            let key = row.key();
            if index.contains(&key) || !seen.insert(key) {
                duplicates += 1;
            } else {
                fresh.push(row.clone());
            }
        }
        (fresh, duplicates)
    }

    /// Insert rows already known to be new. Used by the journal store after
    /// its durable append.
    pub(crate) async fn insert_committed(&self, rows: Vec<PriceSnapshot>) -> Vec<SnapshotKey> {
        let mut index = self.index.write().await;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key();
            if index.insert(row) {
                inserted.push(key);
            }
        }
        inserted
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn upsert_many(&self, rows: Vec<PriceSnapshot>) -> Result<UpsertOutcome, StoreError> {
        let total = rows.len();
        let mut index = self.index.write().await;
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            let key = row.key();
            if index.insert(row) {
                outcome.inserted.push(key);
            } else {
                outcome.duplicates += 1;
            }
        }
        debug!(
            total,
            inserted = outcome.inserted.len(),
            duplicates = outcome.duplicates,
            "Memory store upsert"
        );
        Ok(outcome)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Vec<PriceSnapshot>, StoreError> {
        Ok(self.index.read().await.scan(request))
    }

    async fn currencies(&self) -> Result<Vec<Currency>, StoreError> {
        Ok(self.index.read().await.currencies.iter().copied().collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.index.read().await.rows.len())
    }
}
