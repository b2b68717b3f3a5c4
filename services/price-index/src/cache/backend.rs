//! Cache backend contract
//!
//! Every key has a version record next to its value. `begin` reads the
//! version before a compute starts; `put_if_version` commits the computed
//! value only if no invalidation has bumped the version since. The
//! compare and the write happen atomically inside the backend, so fencing
//! holds across processes sharing one backend.

use std::time::Duration;

use async_trait::async_trait;

use super::key::{CacheKey, KeyPattern};
use crate::error::CacheError;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Live (unexpired) value for `key`.
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    /// Current version of `key`, creating its record at 0 if absent.
    async fn begin(&self, key: &CacheKey) -> Result<u64, CacheError>;

    /// Store `value` unless the key's version is now greater than `version`
    /// (or its record has been evicted). Returns whether the write landed.
    async fn put_if_version(
        &self,
        key: &CacheKey,
        value: String,
        version: u64,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Delete every value matching `pattern` and bump the version of every
    /// matching record. Returns the number of values removed.
    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Drop expired values and stale version records. Backends with native
    /// expiry need not override this.
    async fn purge_expired(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str;
}
