//! Service assembly and lifecycle
//!
//! Every shared component is constructed here and handed to whoever needs
//! it; there is no global state. `PriceIndexService::start` also spawns the
//! background tasks:
//!
//! - one ingestion loop per configured source
//! - one materialization loop per granularity
//! - the heartbeat sweeper
//! - the cache purge loop
//!
//! `ServiceHandle::shutdown` cancels them all and waits for them to exit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregation::{AggregationEngine, BucketStore, Granularity, Materializer};
use crate::auth::{Authenticator, JwtAuthenticator};
use crate::broadcaster::Broadcaster;
use crate::cache::{CacheBackend, CacheLayer, CacheStatsSnapshot, MemoryCacheBackend, RedisCacheBackend};
use crate::config::{CacheBackendKind, ServiceConfig, StoreBackend};
use crate::error::ServiceError;
use crate::ingestion::{IngestionPipeline, Normalizer};
use crate::metrics::ServiceMetrics;
use crate::query::IndexService;
use crate::scheduler::IngestionScheduler;
use crate::sources::{HttpJsonSource, SourceAdapter};
use crate::store::{JournalSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// The wired component graph, shared by the HTTP layer and background tasks.
#[derive(Clone)]
pub struct Components {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<dyn SnapshotStore>,
    pub cache: Arc<CacheLayer>,
    pub buckets: Arc<BucketStore>,
    pub materializer: Arc<Materializer>,
    pub index: Arc<IndexService>,
    pub pipeline: Arc<IngestionPipeline>,
    pub broadcaster: Arc<Broadcaster>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub metrics: Arc<ServiceMetrics>,
}

impl Components {
    /// Wire components around an already opened store and cache backend.
    pub fn assemble(
        config: ServiceConfig,
        store: Arc<dyn SnapshotStore>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let cache = Arc::new(CacheLayer::new(
            cache_backend,
            config.cache.default_ttl(),
            config.cache.backend_timeout(),
        ));
        let buckets = Arc::new(BucketStore::new());
        let engine = Arc::new(AggregationEngine::new(
            Arc::clone(&store),
            Arc::clone(&buckets),
            config.aggregation.clone(),
        ));
        let materializer = Arc::new(Materializer::new(
            Arc::clone(&store),
            Arc::clone(&buckets),
            config.aggregation.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.clone()));
        let authenticator = config
            .auth
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(JwtAuthenticator::new(secret)) as Arc<dyn Authenticator>);
        let pipeline = Arc::new(IngestionPipeline::new(
            Normalizer::default(),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&broadcaster),
            Arc::clone(&metrics),
        ));
        let index = Arc::new(IndexService::new(engine, Arc::clone(&cache), Arc::clone(&metrics)));

        Self {
            config: Arc::new(config),
            store,
            cache,
            buckets,
            materializer,
            index,
            pipeline,
            broadcaster,
            authenticator,
            metrics,
        }
    }

    /// Snapshot of everything external monitoring reads.
    pub async fn health(&self) -> HealthReport {
        let now = Utc::now();
        let store_ok = self.store.ping().await.is_ok();
        let cache_ok = self.cache.ping().await.is_ok();

        let mut materialization_lag_secs = BTreeMap::new();
        for granularity in Granularity::all() {
            let lag = self.buckets.materialization_lag(*granularity, now).await;
            materialization_lag_secs.insert(granularity.label().to_string(), lag.map(|d| d.num_seconds()));
        }

        let status = match (store_ok, cache_ok) {
            (true, true) => "ok",
            (true, false) => "degraded",
            (false, _) => "unavailable",
        };

        HealthReport {
            status,
            store_ok,
            cache_ok,
            materialization_lag_secs,
            cache: self.cache.stats(),
            connections: self.broadcaster.connection_count(),
            subscriptions: self.broadcaster.subscription_counts(),
            metrics: self.metrics.export(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store_ok: bool,
    pub cache_ok: bool,
    /// Age of the newest materialized bucket per granularity; `null` when
    /// nothing is materialized yet.
    pub materialization_lag_secs: BTreeMap<String, Option<i64>>,
    pub cache: CacheStatsSnapshot,
    pub connections: usize,
    pub subscriptions: BTreeMap<String, usize>,
    pub metrics: BTreeMap<String, u64>,
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn SnapshotStore>, ServiceError> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory snapshot store");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
        StoreBackend::Journal => {
            let store = JournalSnapshotStore::open(&config.store.journal_path).await?;
            info!(path = %config.store.journal_path, "Using journal snapshot store");
            Ok(Arc::new(store))
        }
    }
}

async fn open_cache(config: &ServiceConfig) -> Result<Arc<dyn CacheBackend>, ServiceError> {
    let cache = &config.cache;
    match cache.backend {
        CacheBackendKind::Memory => Ok(Arc::new(MemoryCacheBackend::new(cache.version_retention()))),
        CacheBackendKind::Redis => {
            let backend = RedisCacheBackend::connect(
                &cache.redis_url,
                &cache.namespace,
                cache.version_retention(),
                cache.backend_timeout().max(Duration::from_secs(5)),
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

pub struct PriceIndexService;

impl PriceIndexService {
    /// Open backends, wire components and spawn background tasks.
    pub async fn start(config: ServiceConfig) -> Result<ServiceHandle, ServiceError> {
        config.validate().map_err(ServiceError::Config)?;
        let store = open_store(&config).await?;
        let cache_backend = open_cache(&config).await?;
        let components = Components::assemble(config, store, cache_backend);
        Ok(ServiceHandle::spawn(components))
    }
}

/// Running service. Dropping it without `shutdown` leaves tasks running
/// until the runtime stops.
pub struct ServiceHandle {
    components: Components,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Spawn background tasks around already assembled components.
    pub fn spawn(components: Components) -> Self {
        let shutdown = CancellationToken::new();
        let config = Arc::clone(&components.config);
        let mut tasks = Vec::new();

        let client = Client::new();
        let sources: Vec<Arc<dyn SourceAdapter>> = config
            .ingestion
            .sources
            .iter()
            .map(|source| {
                Arc::new(HttpJsonSource::new(source, client.clone(), config.ingestion.fetch_timeout()))
                    as Arc<dyn SourceAdapter>
            })
            .collect();
        let scheduler = Arc::new(IngestionScheduler::new(
            Arc::clone(&components.pipeline),
            sources,
            config.ingestion.clone(),
            Arc::clone(&components.metrics),
        ));
        tasks.extend(Arc::clone(&scheduler).spawn(shutdown.clone()));

        for granularity in Granularity::all() {
            let interval = config.aggregation.granularity(*granularity).materialize_interval();
            tasks.push(tokio::spawn(materialization_loop(
                Arc::clone(&components.materializer),
                Arc::clone(&components.metrics),
                *granularity,
                interval,
                shutdown.clone(),
            )));
        }

        tasks.push(tokio::spawn(heartbeat_loop(
            Arc::clone(&components.broadcaster),
            config.broadcast.sweep_interval(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(cache_purge_loop(
            Arc::clone(&components.cache),
            Duration::from_secs(config.cache.purge_interval_secs),
            shutdown.clone(),
        )));

        info!(
            sources = scheduler.source_count(),
            tasks = tasks.len(),
            "Price index service started"
        );
        Self {
            components,
            shutdown,
            tasks,
        }
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Token cancelled on shutdown; the HTTP server waits on it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every task, then drop every connection.
    pub async fn shutdown(self) {
        info!("Shutting down price index service");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        let closed = self.components.broadcaster.close_all();
        info!(connections_closed = closed, "Price index service stopped");
    }
}

async fn materialization_loop(
    materializer: Arc<Materializer>,
    metrics: Arc<ServiceMetrics>,
    granularity: Granularity,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match materializer.materialize(granularity, Utc::now()).await {
                    Ok(report) => {
                        metrics.record_materialization(true);
                        debug!(%granularity, series = report.series, buckets = report.buckets_written, "Materialization pass done");
                    }
                    Err(e) => {
                        metrics.record_materialization(false);
                        error!(%granularity, error = %e, "Materialization pass failed");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn heartbeat_loop(broadcaster: Arc<Broadcaster>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                broadcaster.sweep_idle(tokio::time::Instant::now());
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn cache_purge_loop(cache: Arc<CacheLayer>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Expired cache entries purged");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
