//! In-process cache backend
//!
//! Values expire lazily on read and eagerly in `purge_expired`. Each
//! `DashMap` entry is locked for the duration of a compare-and-set, which
//! makes `put_if_version` atomic with respect to `invalidate`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::backend::CacheBackend;
use super::key::{CacheKey, KeyPattern};
use crate::error::CacheError;

#[derive(Debug)]
struct Entry {
    value: Option<(String, Instant)>,
    version: u64,
    touched: Instant,
}

impl Entry {
    fn live_value(&self, now: Instant) -> Option<&str> {
        match &self.value {
            Some((value, expires_at)) if *expires_at > now => Some(value.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, Entry>,
    /// How long a version record outlives its last touch.
    version_retention: Duration,
}

impl MemoryCacheBackend {
    pub fn new(version_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            version_retention,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key.as_str())
            .and_then(|entry| entry.live_value(now).map(str::to_string)))
    }

    async fn begin(&self, key: &CacheKey) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.as_str().to_string()).or_insert_with(|| Entry {
            value: None,
            version: 0,
            touched: now,
        });
        entry.touched = now;
        Ok(entry.version)
    }

    async fn put_if_version(
        &self,
        key: &CacheKey,
        value: String,
        version: u64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key.as_str()) else {
            return Ok(false);
        };
        if entry.version > version {
            return Ok(false);
        }
        entry.value = Some((value, now + ttl));
        entry.touched = now;
        Ok(true)
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut removed = 0;
        match pattern {
            KeyPattern::Exact(key) => {
                if let Some(mut entry) = self.entries.get_mut(key.as_str()) {
                    if entry.live_value(now).is_some() {
                        removed += 1;
                    }
                    entry.value = None;
                    entry.version += 1;
                    entry.touched = now;
                }
            }
            KeyPattern::Prefix(_) => {
                for mut entry in self.entries.iter_mut() {
                    if !pattern.matches(entry.key()) {
                        continue;
                    }
                    if entry.live_value(now).is_some() {
                        removed += 1;
                    }
                    entry.value = None;
                    entry.version += 1;
                    entry.touched = now;
                }
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.version_retention;
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            if let Some((_, expires_at)) = &entry.value {
                if *expires_at <= now {
                    entry.value = None;
                    purged += 1;
                }
            }
            entry.value.is_some() || now.duration_since(entry.touched) < retention
        });
        purged
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
