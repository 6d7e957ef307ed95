use crate::error::{CounterError, CounterResult};
use crate::metrics::FlushMetrics;
use crate::store::{DurableCounterStore, FastCounterStore};
use crate::types::EntityId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH: usize = 200;
pub const MAX_BATCH: usize = 10_000;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Ids taken from the dirty set
    pub popped: usize,
    /// Ids whose fast value was written to the durable store
    pub flushed: usize,
    /// Ids dropped because there was nothing authoritative to push
    pub dropped: usize,
    /// Ids put back into the dirty set for a later cycle
    pub requeued: usize,
    /// The dirty set could not be popped
    pub aborted: bool,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.popped += other.popped;
        self.flushed += other.flushed;
        self.dropped += other.dropped;
        self.requeued += other.requeued;
        self.aborted |= other.aborted;
    }
}

enum Outcome {
    Flushed,
    Dropped,
    Requeued,
}

/// Background reconciler pushing dirty fast-store counters into the durable
/// store.
pub struct LikeCountFlusher {
    fast: Arc<dyn FastCounterStore>,
    durable: Arc<dyn DurableCounterStore>,
    batch: usize,
    interval: Duration,
    metrics: Arc<FlushMetrics>,
}

impl LikeCountFlusher {
    /// A zero `batch` or `interval` falls back to the defaults; `batch` is
    /// capped at [`MAX_BATCH`].
    pub fn new(
        fast: Arc<dyn FastCounterStore>,
        durable: Arc<dyn DurableCounterStore>,
        batch: usize,
        interval: Duration,
        metrics: Arc<FlushMetrics>,
    ) -> Self {
        let batch = match batch {
            0 => DEFAULT_BATCH,
            n => n.min(MAX_BATCH),
        };
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };

        Self {
            fast,
            durable,
            batch,
            interval,
            metrics,
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pop one batch of dirty ids and reconcile each independently.
    pub async fn flush_once(&self) -> FlushReport {
        let started = Instant::now();

        let ids = match self.fast.pop_dirty(self.batch).await {
            Ok(ids) => ids,
            Err(e) => {
                self.metrics.record_pop_failure();
                warn!(operation = "flush", error = %e, "Failed to pop dirty set, skipping cycle");
                return FlushReport {
                    aborted: true,
                    ..FlushReport::default()
                };
            }
        };

        let mut report = FlushReport {
            popped: ids.len(),
            ..FlushReport::default()
        };

        for id in ids {
            match self.flush_id(id).await {
                Outcome::Flushed => report.flushed += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Requeued => report.requeued += 1,
            }
        }

        self.metrics.record_cycle(
            report.flushed as u64,
            report.dropped as u64,
            report.requeued as u64,
            started.elapsed(),
        );

        if report.popped > 0 {
            debug!(
                operation = "flush",
                popped = report.popped,
                flushed = report.flushed,
                dropped = report.dropped,
                requeued = report.requeued,
                "Flush cycle complete"
            );
        }

        report
    }

    async fn flush_id(&self, id: EntityId) -> Outcome {
        let value = match self.fast.get(id).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                debug!(entity_id = id, "Counter expired before flush, dropping");
                return Outcome::Dropped;
            }
            Err(e) => {
                warn!(entity_id = id, error = %e, "Failed to read fast counter");
                self.requeue(id).await;
                return Outcome::Requeued;
            }
        };

        match self.durable.set_counter(id, value).await {
            Ok(()) => Outcome::Flushed,
            Err(e) if e.is_not_found() => {
                // Entity is gone; the cached counter has nowhere to go.
                info!(entity_id = id, "Entity deleted, discarding cached counter");
                if let Err(e) = self.fast.invalidate(id).await {
                    warn!(entity_id = id, error = %e, "Failed to invalidate orphaned counter");
                }
                Outcome::Dropped
            }
            Err(e) => {
                warn!(entity_id = id, value, error = %e, "Failed to write durable counter");
                self.requeue(id).await;
                Outcome::Requeued
            }
        }
    }

    async fn requeue(&self, id: EntityId) {
        if let Err(e) = self.fast.mark_dirty(id).await {
            error!(
                entity_id = id,
                error = %e,
                "Failed to requeue dirty counter; durable value may stay stale until the next increment"
            );
        }
    }

    /// Run cycles back to back until the dirty set is empty, a cycle makes no
    /// progress, or `max_cycles` is reached.
    pub async fn drain(&self, max_cycles: usize) -> FlushReport {
        let mut total = FlushReport::default();

        for _ in 0..max_cycles {
            let report = self.flush_once().await;
            total.absorb(report);

            if report.aborted || report.popped == 0 {
                break;
            }
            if report.flushed + report.dropped == 0 {
                warn!(
                    operation = "drain",
                    requeued = report.requeued,
                    "Drain stalled, leaving remaining ids for the periodic flusher"
                );
                break;
            }
        }

        total
    }

    /// Flush on every tick until `shutdown` fires or its sender is dropped.
    ///
    /// A batch in progress always completes before the signal is observed.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        info!(
            operation = "flusher_start",
            batch = self.batch,
            interval_ms = self.interval.as_millis() as u64,
            "Flusher started"
        );

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Flusher received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }

        info!(operation = "flusher_stop", "Flusher stopped");
    }

    /// Start [`run`](Self::run) on the runtime.
    pub fn spawn(self: Arc<Self>) -> FlusherHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });

        FlusherHandle {
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }
}

/// Owner-side handle of a spawned flusher. Dropping it also stops the loop.
pub struct FlusherHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl FlusherHandle {
    /// Signal the loop and wait up to `timeout` for it to finish.
    /// The task is aborted when it does not stop in time.
    pub async fn shutdown(mut self, timeout: Duration) -> CounterResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CounterError::Store(format!("flusher task failed: {}", e))),
            Err(_) => {
                self.handle.abort();
                error!(
                    operation = "flusher_stop",
                    timeout_ms = timeout.as_millis() as u64,
                    "Flusher did not stop in time, aborted"
                );
                Err(CounterError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
