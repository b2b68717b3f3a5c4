//! Ingestion scheduling
//!
//! Each source runs on its own task with its own backoff; sources share
//! nothing but the snapshot store. A failed fetch delays only that source's
//! next cycle.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestionConfig;
use crate::error::IngestError;
use crate::ingestion::{IngestResult, IngestionPipeline};
use crate::metrics::ServiceMetrics;
use crate::sources::SourceAdapter;

/// Delay before the next cycle of a source after `failures` consecutive
/// failures: `interval * 2^failures`, capped.
pub fn backoff_delay(interval: Duration, failures: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(cap.max(interval))
}

#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub result: Result<IngestResult, IngestError>,
}

/// Outcome of one pass over every source.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<SourceOutcome>,
}

impl CycleReport {
    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.accepted)
            .sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.source_id.as_str())
            .collect()
    }

    /// The store rejected every source that reached it and nothing committed.
    fn store_down(&self) -> Option<&IngestError> {
        let mut store_error = None;
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(_) => return None,
                Err(e @ IngestError::StoreUnavailable(_)) => store_error = Some(e),
                Err(IngestError::Source(_)) => {}
            }
        }
        store_error
    }
}

pub struct IngestionScheduler {
    pipeline: Arc<IngestionPipeline>,
    sources: Vec<Arc<dyn SourceAdapter>>,
    config: IngestionConfig,
    metrics: Arc<ServiceMetrics>,
}

impl IngestionScheduler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        sources: Vec<Arc<dyn SourceAdapter>>,
        config: IngestionConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            pipeline,
            sources,
            config,
            metrics,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Fetch one source and commit its batch.
    pub async fn run_source(&self, source: &dyn SourceAdapter) -> Result<IngestResult, IngestError> {
        let quotes = match source.fetch().await {
            Ok(quotes) => quotes,
            Err(e) => {
                self.metrics.record_source_failure();
                warn!(source = source.source_id(), error = %e, "Source fetch failed");
                return Err(e.into());
            }
        };
        self.pipeline.normalize_and_store(source.source_id(), quotes).await
    }

    /// Run every source once, concurrently.
    ///
    /// Fails only when the snapshot store is unreachable for every source
    /// that got far enough to write.
    pub async fn run_cycle(&self) -> Result<CycleReport, IngestError> {
        let runs = self.sources.iter().map(|source| async move {
            SourceOutcome {
                source_id: source.source_id().to_string(),
                result: self.run_source(source.as_ref()).await,
            }
        });
        let report = CycleReport {
            outcomes: join_all(runs).await,
        };

        if let Some(e) = report.store_down() {
            error!(error = %e, sources = report.outcomes.len(), "Ingestion cycle failed: store unavailable");
            return Err(e.clone());
        }
        info!(
            sources = report.outcomes.len(),
            accepted = report.accepted(),
            failed = report.failed_sources().len(),
            "Ingestion cycle complete"
        );
        Ok(report)
    }

    /// One long-running task per source, until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.sources.len())
            .map(|index| {
                let scheduler = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.source_loop(index, shutdown).await })
            })
            .collect()
    }

    async fn source_loop(&self, index: usize, shutdown: CancellationToken) {
        let source = Arc::clone(&self.sources[index]);
        let source_id = source.source_id().to_string();
        let interval = self.config.interval();
        let mut failures: u32 = 0;
        info!(source = %source_id, interval_secs = interval.as_secs(), "Source loop started");

        loop {
            match self.run_source(source.as_ref()).await {
                Ok(_) => failures = 0,
                Err(IngestError::Source(_)) => failures = failures.saturating_add(1),
                Err(e @ IngestError::StoreUnavailable(_)) => {
                    failures = failures.saturating_add(1);
                    error!(source = %source_id, error = %e, "Batch not committed");
                }
            }

            let delay = backoff_delay(interval, failures, self.config.max_backoff());
            if failures > 0 {
                warn!(source = %source_id, failures, delay_secs = delay.as_secs(), "Backing off");
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!(source = %source_id, "Source loop stopped");
    }
}
