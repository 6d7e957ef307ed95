pub mod config;
pub mod counter;
pub mod error;
pub mod likes;
pub mod metrics;
pub mod store;
pub mod types;
pub mod workload;

pub use config::{CliArgs, Config, StoreBackend};
pub use counter::{CachedCounter, FlushReport, FlusherHandle, LikeCountFlusher, PopulatePolicy};
pub use error::{CounterError, CounterResult};
pub use likes::{LikeLedger, LikeService, MemoryLikeLedger};
pub use metrics::Metrics;
pub use store::{
    DurableCounterStore, FastCounterStore, MemoryCounterStore, MemoryEntityStore,
    RedisCounterStore, TtlPolicy,
};
pub use workload::{Workload, WorkloadReport};

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use types::EntityId;

/// Upper bound on back-to-back cycles of the final reconciliation.
const FINAL_DRAIN_CYCLES: usize = 1_000;

/// Build the configured fast store.
pub async fn build_fast_store(config: &Config) -> CounterResult<Arc<dyn FastCounterStore>> {
    let ttl = config.cache.ttl_policy();
    let store: Arc<dyn FastCounterStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryCounterStore::new(config.store.max_entries, ttl)),
        StoreBackend::Redis => Arc::new(
            RedisCounterStore::connect(&config.store.redis_url, config.key_space(), ttl).await?,
        ),
    };
    Ok(store)
}

/// Result of a [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub workload: WorkloadReport,
    /// Reconciliation performed after the flusher stopped
    pub final_flush: FlushReport,
    /// Entities whose durable count disagrees with the like ledger
    pub drifted: Vec<EntityId>,
}

pub async fn run(config: Config, workload: Workload) -> Result<RunReport> {
    tracing::info!(operation = "startup", message = "like-counter starting");
    tracing::debug!(config = ?config, "Configuration loaded");

    config.validate().context("Invalid configuration")?;

    let metrics = Arc::new(Metrics::new());

    let fast = build_fast_store(&config)
        .await
        .context("Failed to create fast counter store")?;
    tracing::info!(
        operation = "startup",
        backend = fast.backend_name(),
        entities = workload.entities,
        "Fast store ready"
    );

    let durable = Arc::new(MemoryEntityStore::new());
    for id in workload.entity_ids() {
        durable.insert(id, 0);
        // Counters left behind by an earlier run would not match the fresh rows.
        fast.invalidate(id)
            .await
            .with_context(|| format!("Failed to reset counter {}", id))?;
    }

    let counter = Arc::new(CachedCounter::new(
        Arc::clone(&fast),
        durable.clone(),
        config.cache.populate_policy(),
        Arc::clone(&metrics.counter),
    ));
    for id in workload.entity_ids() {
        counter
            .get(id)
            .await
            .with_context(|| format!("Failed to warm counter {}", id))?;
    }

    let flusher = Arc::new(LikeCountFlusher::new(
        Arc::clone(&fast),
        durable.clone(),
        config.flusher.batch,
        config.flusher.interval(),
        Arc::clone(&metrics.flush),
    ));
    let flusher_handle = Arc::clone(&flusher).spawn();

    let stop_logging = Arc::new(AtomicBool::new(false));
    let logging_handle = config.logging.metrics_enabled.then(|| {
        metrics.spawn_periodic_logging(
            Duration::from_secs(config.logging.metrics_interval_secs),
            Arc::clone(&stop_logging),
        )
    });

    let ledger = Arc::new(MemoryLikeLedger::new());
    let service = Arc::new(LikeService::new(ledger.clone(), Arc::clone(&counter)));

    let workload_report = tokio::select! {
        report = workload::drive(service, workload) => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(operation = "shutdown", "Interrupted, stopping workload");
            WorkloadReport::default()
        }
    };

    if let Err(e) = flusher_handle
        .shutdown(config.flusher.shutdown_timeout())
        .await
    {
        tracing::warn!(operation = "shutdown", error = %e, "Flusher did not stop cleanly");
    }

    let final_flush = flusher.drain(FINAL_DRAIN_CYCLES).await;
    tracing::info!(
        operation = "final_flush",
        flushed = final_flush.flushed,
        dropped = final_flush.dropped,
        requeued = final_flush.requeued,
    );

    let mut drifted = Vec::new();
    for id in workload.entity_ids() {
        let expected = ledger.count_for(id);
        let durable_count = durable.peek(id).unwrap_or_default();
        if durable_count != expected {
            tracing::warn!(
                entity_id = id,
                durable = durable_count,
                expected,
                "Durable count drifted from ledger"
            );
            drifted.push(id);
        }
    }

    stop_logging.store(true, Ordering::Relaxed);
    if let Some(handle) = logging_handle {
        handle.abort();
    }
    metrics.log_full_summary();

    Ok(RunReport {
        workload: workload_report,
        final_flush,
        drifted,
    })
}
