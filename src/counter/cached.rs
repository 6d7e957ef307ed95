use super::coalesce::{Coalescer, Flight};
use crate::error::{CounterError, CounterResult};
use crate::metrics::CounterMetrics;
use crate::store::{DurableCounterStore, FastCounterStore};
use crate::types::{EntityId, LockToken};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// How a cache miss is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulatePolicy {
    /// TTL of the distributed populate lock
    pub lock_ttl: Duration,
    /// Wait before re-checking the fast store when another process holds the lock
    pub lock_backoff: Duration,
    /// Read the durable store without the lock when the re-check still misses.
    /// When off, contended misses fail with `LockContended`.
    pub fallback_without_lock: bool,
}

impl Default for PopulatePolicy {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(3),
            lock_backoff: Duration::from_millis(50),
            fallback_without_lock: true,
        }
    }
}

/// Read/write facade over the fast and durable counter stores.
///
/// # Write path
///
/// Increments land in the fast store only and mark the entity dirty; the
/// durable store is brought up to date later by the
/// [`LikeCountFlusher`](super::LikeCountFlusher). An increment that finds the
/// counter expired repopulates it from durable storage and retries once,
/// instead of recreating it at `delta`.
///
/// # Read path
///
/// A fast-store hit returns without further I/O. Misses for the same entity
/// are coalesced in-process, and across processes a token lock in the fast
/// store keeps most concurrent misses off the durable store.
pub struct CachedCounter {
    fast: Arc<dyn FastCounterStore>,
    durable: Arc<dyn DurableCounterStore>,
    inflight: Coalescer<EntityId, CounterResult<i64>>,
    policy: PopulatePolicy,
    metrics: Arc<CounterMetrics>,
}

impl CachedCounter {
    pub fn new(
        fast: Arc<dyn FastCounterStore>,
        durable: Arc<dyn DurableCounterStore>,
        policy: PopulatePolicy,
        metrics: Arc<CounterMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            inflight: Coalescer::new(),
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> PopulatePolicy {
        self.policy
    }

    pub fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    /// Apply `delta` and return the new cached value.
    ///
    /// Fails only when the fast store rejects the increment (after one
    /// repopulate attempt for an expired counter). A failure to mark the
    /// entity dirty is logged and does not fail the call.
    #[instrument(level = "debug", skip(self))]
    pub async fn increment(&self, id: EntityId, delta: i64) -> CounterResult<i64> {
        let value = match self.fast.increment(id, delta).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                self.metrics.record_repopulation();
                debug!(entity_id = id, "Counter not cached, repopulating before increment");
                self.repopulate_and_increment(id, delta).await.inspect_err(|_| {
                    self.metrics.record_increment_failure();
                })?
            }
            Err(e) => {
                self.metrics.record_increment_failure();
                return Err(e);
            }
        };

        self.metrics.record_increment();

        if let Err(e) = self.fast.mark_dirty(id).await {
            self.metrics.record_dirty_mark_failure();
            warn!(
                entity_id = id,
                error = %e,
                "Failed to mark counter dirty; reconciliation deferred"
            );
        }

        Ok(value)
    }

    async fn repopulate_and_increment(&self, id: EntityId, delta: i64) -> CounterResult<i64> {
        self.load(id).await?;
        self.fast.increment(id, delta).await
    }

    /// Current count: fast store first, durable store on a miss.
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, id: EntityId) -> CounterResult<i64> {
        match self.fast.get(id).await {
            Ok(value) => {
                self.metrics.record_hit();
                return Ok(value);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(entity_id = id, error = %e, "Fast store read failed, treating as miss");
            }
        }

        self.metrics.record_miss();
        self.load(id).await
    }

    /// Drop the cached counter, e.g. after the entity was deleted.
    pub async fn invalidate(&self, id: EntityId) -> CounterResult<()> {
        self.fast.invalidate(id).await
    }

    /// Coalesced populate from durable storage.
    async fn load(&self, id: EntityId) -> CounterResult<i64> {
        let (result, flight) = self.inflight.work(id, || self.populate(id)).await;
        if flight == Flight::Joined {
            self.metrics.record_coalesced();
        }
        result
    }

    async fn populate(&self, id: EntityId) -> CounterResult<i64> {
        let token = LockToken::generate();
        let acquired = match self.fast.try_lock(id, &token, self.policy.lock_ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(entity_id = id, error = %e, "Populate lock unavailable, proceeding without it");
                false
            }
        };

        if acquired {
            self.metrics.record_lock_acquired();
            let result = self.read_through(id).await;
            self.release(id, &token).await;
            return result;
        }

        self.metrics.record_lock_contended();
        tokio::time::sleep(self.policy.lock_backoff).await;

        if let Ok(value) = self.fast.get(id).await {
            debug!(entity_id = id, "Counter populated by lock holder");
            return Ok(value);
        }

        if !self.policy.fallback_without_lock {
            return Err(CounterError::LockContended(format!("counter {}", id)));
        }

        self.metrics.record_unlocked_fallback();
        debug!(entity_id = id, "Lock still held, reading durable store without it");
        self.read_through(id).await
    }

    /// Read the authoritative value and cache it unless a counter appeared in
    /// the meantime, in which case the cached one wins: it already carries
    /// increments the durable read predates. Cache write failures only cost a
    /// later miss.
    async fn read_through(&self, id: EntityId) -> CounterResult<i64> {
        self.metrics.record_durable_read();
        let value = self.durable.get_counter(id).await?;

        match self.fast.populate(id, value).await {
            Ok(cached) => {
                if cached != value {
                    debug!(entity_id = id, durable = value, cached, "Counter already cached");
                }
                Ok(cached)
            }
            Err(e) => {
                warn!(entity_id = id, error = %e, "Failed to populate fast store");
                Ok(value)
            }
        }
    }

    async fn release(&self, id: EntityId, token: &LockToken) {
        match self.fast.unlock(id, token).await {
            Ok(true) => {}
            Ok(false) => debug!(entity_id = id, "Populate lock expired before release"),
            Err(e) => warn!(entity_id = id, error = %e, "Failed to release populate lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockDurableCounterStore, MockFastCounterStore};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::Ordering;

    fn not_found() -> CounterError {
        CounterError::NotFound("counter".to_string())
    }

    fn counter(fast: MockFastCounterStore, durable: MockDurableCounterStore) -> CachedCounter {
        CachedCounter::new(
            Arc::new(fast),
            Arc::new(durable),
            PopulatePolicy {
                lock_ttl: Duration::from_secs(3),
                lock_backoff: Duration::from_millis(1),
                fallback_without_lock: true,
            },
            Arc::new(CounterMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_get_cache_hit_skips_durable() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().with(eq(1)).times(1).returning(|_| Ok(9));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(0);

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 9);
        assert_eq!(counter.metrics().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_get_cache_miss_populates_under_lock() {
        let mut seq = Sequence::new();
        let mut fast = MockFastCounterStore::new();
        let mut durable = MockDurableCounterStore::new();

        fast.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found()));
        fast.expect_try_lock()
            .withf(|id, _, ttl| *id == 1 && *ttl == Duration::from_secs(3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));
        durable
            .expect_get_counter()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(5));
        fast.expect_populate()
            .with(eq(1), eq(5))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, v| Ok(v));
        fast.expect_unlock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 5);
        assert_eq!(counter.metrics().locks_acquired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_get_unlocks_with_the_acquiring_token() {
        let acquired = Arc::new(std::sync::Mutex::new(None));
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        let seen = Arc::clone(&acquired);
        fast.expect_try_lock().returning(move |_, token, _| {
            *seen.lock().unwrap() = Some(token.clone());
            Ok(true)
        });
        fast.expect_populate().returning(|_, v| Ok(v));
        let seen = Arc::clone(&acquired);
        fast.expect_unlock()
            .withf(move |_, token| seen.lock().unwrap().as_ref() == Some(token))
            .times(1)
            .returning(|_, _| Ok(true));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().returning(|_| Ok(1));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_fast_store_error_falls_back_to_durable() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get()
            .returning(|_| Err(CounterError::Unavailable("boom".to_string())));
        fast.expect_try_lock().returning(|_, _, _| Ok(true));
        fast.expect_populate().returning(|_, v| Ok(v));
        fast.expect_unlock().returning(|_, _| Ok(true));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(1).returning(|_| Ok(3));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_durable_error_propagates() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        fast.expect_try_lock().returning(|_, _, _| Ok(true));
        fast.expect_populate().times(0);
        fast.expect_unlock().times(1).returning(|_, _| Ok(true));
        let mut durable = MockDurableCounterStore::new();
        durable
            .expect_get_counter()
            .returning(|_| Err(CounterError::TimedOut("db".to_string())));

        let counter = counter(fast, durable);
        let err = counter.get(1).await.unwrap_err();
        assert!(matches!(err, CounterError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_get_contended_lock_uses_holder_result() {
        let mut seq = Sequence::new();
        let mut fast = MockFastCounterStore::new();
        fast.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found()));
        fast.expect_try_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(false));
        fast.expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(12));
        fast.expect_unlock().times(0);
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(0);

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 12);
        assert_eq!(counter.metrics().locks_contended.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_get_contended_lock_falls_back_without_lock() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().times(2).returning(|_| Err(not_found()));
        fast.expect_try_lock().times(1).returning(|_, _, _| Ok(false));
        fast.expect_populate().with(eq(1), eq(4)).times(1).returning(|_, v| Ok(v));
        fast.expect_unlock().times(0);
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(1).returning(|_| Ok(4));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 4);
        assert_eq!(
            counter.metrics().unlocked_fallbacks.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_get_contended_lock_without_fallback_fails() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        fast.expect_try_lock().returning(|_, _, _| Ok(false));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(0);

        let counter = CachedCounter::new(
            Arc::new(fast),
            Arc::new(durable),
            PopulatePolicy {
                lock_backoff: Duration::from_millis(1),
                fallback_without_lock: false,
                ..PopulatePolicy::default()
            },
            Arc::new(CounterMetrics::new()),
        );
        let err = counter.get(1).await.unwrap_err();
        assert!(matches!(err, CounterError::LockContended(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_get_lock_error_reads_durable() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        fast.expect_try_lock()
            .returning(|_, _, _| Err(CounterError::Unavailable("lock".to_string())));
        fast.expect_populate().returning(|_, v| Ok(v));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().times(1).returning(|_| Ok(8));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_get_tolerates_populate_and_unlock_failures() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        fast.expect_try_lock().returning(|_, _, _| Ok(true));
        fast.expect_populate()
            .returning(|_, _| Err(CounterError::Unavailable("populate".to_string())));
        fast.expect_unlock()
            .returning(|_, _| Err(CounterError::Unavailable("unlock".to_string())));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().returning(|_| Ok(2));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_prefers_counter_cached_during_durable_read() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_get().returning(|_| Err(not_found()));
        fast.expect_try_lock().returning(|_, _, _| Ok(true));
        fast.expect_populate()
            .with(eq(1), eq(20))
            .times(1)
            .returning(|_, _| Ok(23));
        fast.expect_unlock().returning(|_, _| Ok(true));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_get_counter().returning(|_| Ok(20));

        let counter = counter(fast, durable);
        assert_eq!(counter.get(1).await.unwrap(), 23);
    }

    #[tokio::test]
    async fn test_increment_marks_dirty_and_skips_durable() {
        let mut seq = Sequence::new();
        let mut fast = MockFastCounterStore::new();
        fast.expect_increment()
            .with(eq(1), eq(-1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(6));
        fast.expect_mark_dirty()
            .with(eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut durable = MockDurableCounterStore::new();
        durable.expect_add_to_counter().times(0);
        durable.expect_set_counter().times(0);
        durable.expect_get_counter().times(0);

        let counter = counter(fast, durable);
        assert_eq!(counter.increment(1, -1).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_increment_failure_never_marks_dirty() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_increment()
            .returning(|_, _| Err(CounterError::Unavailable("boom".to_string())));
        fast.expect_mark_dirty().times(0);
        let durable = MockDurableCounterStore::new();

        let counter = counter(fast, durable);
        let err = counter.increment(1, 1).await.unwrap_err();
        assert!(matches!(err, CounterError::Unavailable(_)));
        assert_eq!(
            counter.metrics().increment_failures.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_dirty_mark_failure_does_not_fail_increment() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_increment().returning(|_, _| Ok(1));
        fast.expect_mark_dirty()
            .times(1)
            .returning(|_| Err(CounterError::Unavailable("sadd".to_string())));
        let durable = MockDurableCounterStore::new();

        let counter = counter(fast, durable);
        assert_eq!(counter.increment(1, 1).await.unwrap(), 1);
        assert_eq!(
            counter.metrics().dirty_mark_failures.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_increment_expired_counter_repopulates_then_retries() {
        let mut seq = Sequence::new();
        let mut fast = MockFastCounterStore::new();
        let mut durable = MockDurableCounterStore::new();

        fast.expect_increment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(not_found()));
        fast.expect_try_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));
        durable
            .expect_get_counter()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(10));
        fast.expect_populate()
            .with(eq(42), eq(10))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, v| Ok(v));
        fast.expect_unlock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        fast.expect_increment()
            .with(eq(42), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(11));
        fast.expect_mark_dirty()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let counter = counter(fast, durable);
        assert_eq!(counter.increment(42, 1).await.unwrap(), 11);
        assert_eq!(counter.metrics().repopulations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_increment_missing_entity_fails_without_dirty_mark() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_increment().times(1).returning(|_, _| Err(not_found()));
        fast.expect_try_lock().returning(|_, _, _| Ok(true));
        fast.expect_unlock().returning(|_, _| Ok(true));
        fast.expect_mark_dirty().times(0);
        let mut durable = MockDurableCounterStore::new();
        durable
            .expect_get_counter()
            .returning(|_| Err(CounterError::NotFound("entity 9".to_string())));

        let counter = counter(fast, durable);
        assert!(counter.increment(9, 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalidate_delegates() {
        let mut fast = MockFastCounterStore::new();
        fast.expect_invalidate().with(eq(5)).times(1).returning(|_| Ok(()));
        let counter = counter(fast, MockDurableCounterStore::new());
        counter.invalidate(5).await.unwrap();
    }
}
