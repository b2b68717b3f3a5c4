//! Service configuration
//!
//! Every section has a `Default`, so an empty file (or no file) yields a
//! runnable in-memory service. Values are overlaid from `PRICE_INDEX__*`
//! environment variables, e.g. `PRICE_INDEX__CACHE__DEFAULT_TTL_SECS=60`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::aggregation::granularity::Granularity;
use crate::backpressure::DropPolicy;
use crate::logging::LogFormat;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ingestion: IngestionConfig,
    pub aggregation: AggregationConfig,
    pub cache: CacheConfig,
    pub broadcast: BroadcastConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load from an optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("PRICE_INDEX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Reject settings the background tasks cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("ingestion.interval_secs", self.ingestion.interval_secs),
            ("cache.purge_interval_secs", self.cache.purge_interval_secs),
            ("broadcast.sweep_interval_secs", self.broadcast.sweep_interval_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(format!("{} must be positive", name));
            }
        }
        if self.broadcast.queue_capacity == 0 {
            return Err("broadcast.queue_capacity must be positive".to_string());
        }

        for granularity in Granularity::all() {
            let cfg = self.aggregation.granularity(*granularity);
            if cfg.materialize_interval_secs == 0 {
                return Err(format!("{} materialize_interval_secs must be positive", granularity));
            }
            // Rows newer than the lag must not yet be materialized.
            if cfg.lag_secs < cfg.settle_delay_secs + cfg.materialize_interval_secs {
                return Err(format!(
                    "{} lag_secs ({}) is shorter than settle delay plus materialize interval",
                    granularity, cfg.lag_secs
                ));
            }
        }

        let mut ids = std::collections::BTreeSet::new();
        for source in &self.ingestion.sources {
            if source.id.trim().is_empty() {
                return Err("ingestion source id must not be empty".to_string());
            }
            if !ids.insert(source.id.as_str()) {
                return Err(format!("duplicate ingestion source id {:?}", source.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Journal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Journal file, used when `backend = "journal"`.
    pub journal_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            journal_path: "data/snapshots.journal".to_string(),
        }
    }
}

/// One pull-based marketplace adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Period between cycles of one source.
    pub interval_secs: u64,
    /// Upper bound on the failure backoff of one source.
    pub max_backoff_secs: u64,
    /// Per-call timeout for adapter fetches.
    pub fetch_timeout_secs: u64,
    pub sources: Vec<SourceConfig>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_backoff_secs: 3600,
            fetch_timeout_secs: 30,
            sources: Vec::new(),
        }
    }
}

impl IngestionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Materialization schedule and trust window of one granularity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GranularityConfig {
    /// How far behind "now" materialized buckets are trusted (`L`).
    pub lag_secs: u64,
    /// Delay before a closed bucket is materialized.
    pub settle_delay_secs: u64,
    /// Period of the materialization job.
    pub materialize_interval_secs: u64,
}

impl GranularityConfig {
    pub fn lag(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lag_secs as i64)
    }

    pub fn settle_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settle_delay_secs as i64)
    }

    pub fn materialize_interval(&self) -> Duration {
        Duration::from_secs(self.materialize_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub m30: GranularityConfig,
    pub h1: GranularityConfig,
    pub d1: GranularityConfig,
    /// Bound on the live-tail part of a query.
    pub query_timeout_ms: u64,
    /// Trailing buckets recomputed on every pass to pick up late rows.
    pub refresh_buckets: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            m30: GranularityConfig {
                lag_secs: 30 * 60,
                settle_delay_secs: 5 * 60,
                materialize_interval_secs: 5 * 60,
            },
            h1: GranularityConfig {
                lag_secs: 2 * 3600,
                settle_delay_secs: 10 * 60,
                materialize_interval_secs: 15 * 60,
            },
            d1: GranularityConfig {
                lag_secs: 86_400,
                settle_delay_secs: 3600,
                materialize_interval_secs: 3600,
            },
            query_timeout_ms: 2_000,
            refresh_buckets: 2,
        }
    }
}

impl AggregationConfig {
    pub fn granularity(&self, granularity: Granularity) -> &GranularityConfig {
        match granularity {
            Granularity::M30 => &self.m30,
            Granularity::H1 => &self.h1,
            Granularity::D1 => &self.d1,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: String,
    /// Namespace prepended to every redis key.
    pub namespace: String,
    /// Default TTL; matches the ingestion cadence.
    pub default_ttl_secs: u64,
    /// Bound on any single backend call before falling back to compute.
    pub backend_timeout_ms: u64,
    /// Lifetime of a key's version record after its last touch.
    pub version_retention_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: "redis://localhost:6379/0".to_string(),
            namespace: "price-index".to_string(),
            default_ttl_secs: 300,
            backend_timeout_ms: 250,
            version_retention_secs: 3600,
            purge_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn version_retention(&self) -> Duration {
        Duration::from_secs(self.version_retention_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Maximum queued outbound messages per connection.
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    /// Idle time after which a connection is closed.
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub auth_timeout_ms: u64,
    /// Bound on one socket write.
    pub send_timeout_ms: u64,
    pub max_subscriptions_per_connection: usize,
    /// Messages written per drain of a connection queue.
    pub batch_size: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            drop_policy: DropPolicy::Disconnect,
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 15,
            auth_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            max_subscriptions_per_connection: 50,
            batch_size: 50,
        }
    }
}

impl BroadcastConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for channel tokens. Protected channels are refused when unset.
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
