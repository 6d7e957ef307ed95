//! Common test utilities for like-counter
//!
//! - [`fakes::FaultyFastStore`]: in-memory fast store with switchable failures
//! - [`fakes::SlowDurableStore`]: in-memory durable store with latency and
//!   call counting
//! - builders wiring them into a [`CachedCounter`]

#![allow(dead_code)]

pub mod fakes;

use fakes::{FaultyFastStore, SlowDurableStore};
use like_counter::metrics::CounterMetrics;
use like_counter::{CachedCounter, MemoryCounterStore, PopulatePolicy, TtlPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Fast store whose counters live for `ttl` with no jitter.
pub fn fast_store(ttl: Duration) -> Arc<FaultyFastStore> {
    Arc::new(FaultyFastStore::new(MemoryCounterStore::new(
        10_000,
        TtlPolicy::new(ttl, Duration::ZERO),
    )))
}

pub fn durable_store(delay: Duration, rows: &[(u64, i64)]) -> Arc<SlowDurableStore> {
    let store = Arc::new(SlowDurableStore::new(delay));
    for &(id, value) in rows {
        store.insert(id, value);
    }
    store
}

pub fn cached_counter(
    fast: &Arc<FaultyFastStore>,
    durable: &Arc<SlowDurableStore>,
    policy: PopulatePolicy,
) -> CachedCounter {
    CachedCounter::new(
        fast.clone(),
        durable.clone(),
        policy,
        Arc::new(CounterMetrics::new()),
    )
}

/// Short backoff so contended tests do not sleep for long.
pub fn quick_policy() -> PopulatePolicy {
    PopulatePolicy {
        lock_ttl: Duration::from_secs(3),
        lock_backoff: Duration::from_millis(5),
        fallback_without_lock: true,
    }
}
