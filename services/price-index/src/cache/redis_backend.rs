//! Redis cache backend
//!
//! Layout under namespace `ns`:
//! - `ns:val:<key>` holds the serialized value, expiring after its TTL
//! - `ns:ver:<key>` holds the version counter, expiring after the retention
//!
//! The fence check and the value write run in one Lua script, so competing
//! processes cannot interleave between the compare and the set.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::backend::CacheBackend;
use super::key::{CacheKey, KeyPattern};
use crate::error::CacheError;

const BEGIN_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  redis.call('SET', KEYS[1], 0, 'PX', ARGV[1])
  return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return tonumber(v)
"#;

const PUT_IF_VERSION_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  return 0
end
if tonumber(v) > tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
"#;

const INVALIDATE_SCRIPT: &str = r#"
local removed = 0
for i = 1, #KEYS, 2 do
  redis.call('INCR', KEYS[i])
  redis.call('PEXPIRE', KEYS[i], ARGV[1])
  removed = removed + redis.call('DEL', KEYS[i + 1])
end
return removed
"#;

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

/// Physical key names under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    fn version_prefix(&self) -> String {
        format!("{}:ver:", self.namespace)
    }

    fn value_key(&self, key: &str) -> String {
        format!("{}:val:{}", self.namespace, key)
    }

    fn version_key(&self, key: &str) -> String {
        format!("{}{}", self.version_prefix(), key)
    }

    /// `SCAN MATCH` glob over the version records selected by `pattern`.
    fn version_glob(&self, pattern: &KeyPattern) -> String {
        pattern.to_glob(&self.version_prefix())
    }

    /// Logical key of a version record returned by `SCAN`.
    fn logical_key<'a>(&self, raw: &'a str) -> Option<&'a str> {
        raw.strip_prefix(self.version_prefix().as_str())
    }
}

pub struct RedisCacheBackend {
    connection: ConnectionManager,
    layout: KeyLayout,
    version_retention: Duration,
    begin: Script,
    put_if_version: Script,
    invalidate: Script,
}

impl RedisCacheBackend {
    pub async fn connect(
        url: &str,
        namespace: &str,
        version_retention: Duration,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        info!(namespace, "Connecting to Redis cache backend");
        let client = Client::open(url).map_err(unavailable)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(timeout.as_millis() as u64))?
            .map_err(unavailable)?;
        info!(namespace, "Redis cache backend connected");

        Ok(Self {
            connection,
            layout: KeyLayout::new(namespace),
            version_retention,
            begin: Script::new(BEGIN_SCRIPT),
            put_if_version: Script::new(PUT_IF_VERSION_SCRIPT),
            invalidate: Script::new(INVALIDATE_SCRIPT),
        })
    }

    fn retention_ms(&self, ttl: Duration) -> u64 {
        self.version_retention.max(ttl).as_millis() as u64
    }

    /// Logical keys whose version record matches `pattern`.
    async fn scan_versions(&self, pattern: &KeyPattern) -> Result<Vec<String>, CacheError> {
        let glob = self.layout.version_glob(pattern);
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(
                batch
                    .iter()
                    .filter_map(|k| self.layout.logical_key(k))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.layout.value_key(key.as_str()))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(value)
    }

    async fn begin(&self, key: &CacheKey) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        let version: u64 = self
            .begin
            .key(self.layout.version_key(key.as_str()))
            .arg(self.retention_ms(Duration::ZERO))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &CacheKey,
        value: String,
        version: u64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let written: i64 = self
            .put_if_version
            .key(self.layout.version_key(key.as_str()))
            .key(self.layout.value_key(key.as_str()))
            .arg(version)
            .arg(value)
            .arg(ttl.as_millis().max(1) as u64)
            .arg(self.retention_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }

    async fn invalidate(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let keys = match pattern {
            KeyPattern::Exact(key) => vec![key.clone()],
            KeyPattern::Prefix(_) => self.scan_versions(pattern).await?,
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let mut removed = 0usize;
        for chunk in keys.chunks(SCAN_BATCH) {
            let mut invocation = self.invalidate.prepare_invoke();
            for key in chunk {
                invocation.key(self.layout.version_key(key)).key(self.layout.value_key(key));
            }
            invocation.arg(self.retention_ms(Duration::ZERO));
            let count: i64 = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;
            removed += count.max(0) as usize;
        }
        debug!(pattern = %pattern, records = keys.len(), removed, "Redis invalidation applied");
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
