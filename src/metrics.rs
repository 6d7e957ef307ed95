use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Metrics for the cached counter read/write paths
#[derive(Debug, Default)]
pub struct CounterMetrics {
    /// Reads answered by the fast store
    pub hits: AtomicU64,
    /// Reads that missed the fast store
    pub misses: AtomicU64,
    /// Missed reads that joined an in-flight populate instead of starting one
    pub coalesced: AtomicU64,
    /// Reads against the durable store
    pub durable_reads: AtomicU64,
    /// Populate locks acquired
    pub locks_acquired: AtomicU64,
    /// Populate locks found held by someone else
    pub locks_contended: AtomicU64,
    /// Durable reads performed without holding the lock
    pub unlocked_fallbacks: AtomicU64,
    /// Successful increments
    pub increments: AtomicU64,
    /// Increments that failed and were surfaced to the caller
    pub increment_failures: AtomicU64,
    /// Increments that found the counter expired and repopulated first
    pub repopulations: AtomicU64,
    /// Dirty marks that failed after a successful increment
    pub dirty_mark_failures: AtomicU64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "coalesced");
    }

    pub fn record_durable_read(&self) {
        self.durable_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contended(&self) {
        self.locks_contended.fetch_add(1, Ordering::Relaxed);
        trace!(counter_op = "lock_contended");
    }

    pub fn record_unlocked_fallback(&self) {
        self.unlocked_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment(&self) {
        self.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment_failure(&self) {
        self.increment_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repopulation(&self) {
        self.repopulations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dirty_mark_failure(&self) {
        self.dirty_mark_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        (hits as f64 / total as f64) * 100.0
    }

    /// Log a summary of counter metrics
    pub fn log_summary(&self) {
        info!(
            operation = "counter_metrics_summary",
            hits = self.hits.load(Ordering::Relaxed),
            misses = self.misses.load(Ordering::Relaxed),
            hit_rate_pct = self.hit_rate(),
            coalesced = self.coalesced.load(Ordering::Relaxed),
            durable_reads = self.durable_reads.load(Ordering::Relaxed),
            locks_acquired = self.locks_acquired.load(Ordering::Relaxed),
            locks_contended = self.locks_contended.load(Ordering::Relaxed),
            unlocked_fallbacks = self.unlocked_fallbacks.load(Ordering::Relaxed),
            increments = self.increments.load(Ordering::Relaxed),
            increment_failures = self.increment_failures.load(Ordering::Relaxed),
            repopulations = self.repopulations.load(Ordering::Relaxed),
            dirty_mark_failures = self.dirty_mark_failures.load(Ordering::Relaxed),
        );
    }
}

/// Metrics for the write-back flusher
#[derive(Debug, Default)]
pub struct FlushMetrics {
    /// Completed flush cycles
    pub cycles: AtomicU64,
    /// Cycles aborted because the dirty set could not be popped
    pub pop_failures: AtomicU64,
    /// Ids whose value reached the durable store
    pub flushed: AtomicU64,
    /// Ids dropped because their counter had expired
    pub dropped: AtomicU64,
    /// Ids put back into the dirty set after a failure
    pub requeued: AtomicU64,
    /// Total time spent in flush cycles (nanoseconds)
    pub flush_latency_ns: AtomicU64,
}

impl FlushMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pop_failure(&self) {
        self.pop_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed cycle
    pub fn record_cycle(&self, flushed: u64, dropped: u64, requeued: u64, latency: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.flushed.fetch_add(flushed, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.requeued.fetch_add(requeued, Ordering::Relaxed);
        self.flush_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        trace!(
            flush_op = "cycle",
            flushed,
            dropped,
            requeued,
            latency_ns = latency.as_nanos() as u64
        );
    }

    /// Calculate average cycle latency in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.cycles.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total_ns = self.flush_latency_ns.load(Ordering::Relaxed);
        (total_ns as f64 / count as f64) / 1_000_000.0
    }

    pub fn log_summary(&self) {
        info!(
            operation = "flush_metrics_summary",
            cycles = self.cycles.load(Ordering::Relaxed),
            pop_failures = self.pop_failures.load(Ordering::Relaxed),
            flushed = self.flushed.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            requeued = self.requeued.load(Ordering::Relaxed),
            avg_cycle_latency_ms = self.avg_latency_ms(),
        );
    }
}

/// Combined metrics for the entire system
#[derive(Debug)]
pub struct Metrics {
    pub counter: Arc<CounterMetrics>,
    pub flush: Arc<FlushMetrics>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(CounterMetrics::new()),
            flush: Arc::new(FlushMetrics::new()),
            start_time: Instant::now(),
        }
    }

    /// Log a complete metrics summary
    pub fn log_full_summary(&self) {
        info!(
            "=== like-counter metrics after {:.1}s ===",
            self.elapsed().as_secs_f64()
        );
        self.counter.log_summary();
        self.flush.log_summary();
    }

    /// Get elapsed time since metrics creation
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Create a periodic logging background task, stopped by setting `stop`.
    pub fn spawn_periodic_logging(
        self: &Arc<Self>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                ticker.tick().await;

                if stop.load(Ordering::Relaxed) {
                    break;
                }

                metrics.counter.log_summary();
                metrics.flush.log_summary();
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
