use super::{FastCounterStore, TtlPolicy};
use crate::error::{CounterError, CounterResult};
use crate::types::{EntityId, LockToken};
use async_trait::async_trait;
use dashmap::DashSet;
use moka::future::Cache as MokaCache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::trace;

/// Values carrying their own time-to-live.
trait Expiring {
    fn ttl(&self) -> Duration;
}

/// Counter record. `ttl` is drawn once at populate time and re-applied on
/// every increment.
#[derive(Debug, Clone, Copy)]
struct CounterSlot {
    value: i64,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct LockSlot {
    token: LockToken,
    ttl: Duration,
}

impl Expiring for CounterSlot {
    fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Expiring for LockSlot {
    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Per-entry expiration: every write restarts the entry's own TTL.
struct PerEntryTtl;

impl<K, V: Expiring> Expiry<K, V> for PerEntryTtl {
    fn expire_after_create(&self, _key: &K, value: &V, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &V,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl())
    }
}

/// Entry counts for monitoring. moka applies pending writes lazily, so the
/// counts are approximate.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub counters: u64,
    pub locks: u64,
    pub dirty: usize,
}

/// In-process fast counter store.
///
/// Counter and lock records live in two `moka` caches with per-entry TTL;
/// read-modify-write operations go through moka's entry compute API so they
/// are atomic per key. The dirty set is a `DashSet`, where a pop is a
/// removal that only one caller can win.
pub struct MemoryCounterStore {
    counters: MokaCache<EntityId, CounterSlot>,
    locks: MokaCache<EntityId, LockSlot>,
    dirty: DashSet<EntityId>,
    ttl: TtlPolicy,
}

impl MemoryCounterStore {
    /// Create a store holding at most `max_entries` counters.
    pub fn new(max_entries: u64, ttl: TtlPolicy) -> Self {
        let counters = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        let locks = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();

        Self {
            counters,
            locks,
            dirty: DashSet::new(),
            ttl,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl
    }

    /// Whether `id` is currently in the dirty set.
    pub fn is_dirty(&self, id: EntityId) -> bool {
        self.dirty.contains(&id)
    }

    pub async fn stats(&self) -> StoreStats {
        self.counters.run_pending_tasks().await;
        self.locks.run_pending_tasks().await;
        StoreStats {
            counters: self.counters.entry_count(),
            locks: self.locks.entry_count(),
            dirty: self.dirty.len(),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(100_000, TtlPolicy::default())
    }
}

#[async_trait]
impl FastCounterStore for MemoryCounterStore {
    async fn increment(&self, id: EntityId, delta: i64) -> CounterResult<i64> {
        let result = self
            .counters
            .entry(id)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) => {
                        let slot = entry.into_value();
                        match slot.value.checked_add(delta) {
                            Some(value) => Op::Put(CounterSlot { value, ttl: slot.ttl }),
                            None => Op::Nop,
                        }
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::ReplacedWith(entry) => {
                trace!(entity_id = id, delta, value = entry.value().value, "counter incremented");
                Ok(entry.value().value)
            }
            CompResult::StillNone(_) => Err(CounterError::NotFound(format!("counter {}", id))),
            CompResult::Unchanged(_) => Err(CounterError::InvalidArgument(format!(
                "increment of counter {} by {} overflows",
                id, delta
            ))),
            _ => Err(CounterError::Store(format!(
                "unexpected compute outcome for counter {}",
                id
            ))),
        }
    }

    async fn get(&self, id: EntityId) -> CounterResult<i64> {
        match self.counters.get(&id).await {
            Some(slot) => Ok(slot.value),
            None => Err(CounterError::NotFound(format!("counter {}", id))),
        }
    }

    async fn set(&self, id: EntityId, value: i64) -> CounterResult<()> {
        let ttl = self.ttl.draw();
        self.counters.insert(id, CounterSlot { value, ttl }).await;
        trace!(entity_id = id, value, ttl_ms = ttl.as_millis() as u64, "counter populated");
        Ok(())
    }

    async fn populate(&self, id: EntityId, value: i64) -> CounterResult<i64> {
        let slot = CounterSlot {
            value,
            ttl: self.ttl.draw(),
        };
        let entry = self
            .counters
            .entry(id)
            .or_insert_with(std::future::ready(slot))
            .await;
        let cached = entry.value().value;
        if entry.is_fresh() {
            trace!(entity_id = id, value, "counter populated");
        } else {
            trace!(entity_id = id, value, cached, "counter already cached, populate skipped");
        }
        Ok(cached)
    }

    async fn invalidate(&self, id: EntityId) -> CounterResult<()> {
        self.counters.invalidate(&id).await;
        Ok(())
    }

    async fn try_lock(
        &self,
        id: EntityId,
        token: &LockToken,
        ttl: Duration,
    ) -> CounterResult<bool> {
        let slot = LockSlot {
            token: token.clone(),
            ttl,
        };
        let entry = self
            .locks
            .entry(id)
            .or_insert_with(std::future::ready(slot))
            .await;
        Ok(entry.is_fresh())
    }

    async fn unlock(&self, id: EntityId, token: &LockToken) -> CounterResult<bool> {
        let token = token.clone();
        let result = self
            .locks
            .entry(id)
            .and_compute_with(move |current| {
                let op = match current {
                    Some(entry) if entry.value().token == token => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        Ok(matches!(result, CompResult::Removed(_)))
    }

    async fn mark_dirty(&self, id: EntityId) -> CounterResult<()> {
        self.dirty.insert(id);
        Ok(())
    }

    async fn pop_dirty(&self, limit: usize) -> CounterResult<Vec<EntityId>> {
        let mut popped = Vec::with_capacity(limit.min(self.dirty.len()));
        while popped.len() < limit {
            // Collect first: removing while iterating would deadlock on the shard lock.
            let candidates: Vec<EntityId> = self
                .dirty
                .iter()
                .take(limit - popped.len())
                .map(|id| *id)
                .collect();
            if candidates.is_empty() {
                break;
            }
            // Candidates another popper removed first are not ours.
            popped.extend(
                candidates
                    .into_iter()
                    .filter(|id| self.dirty.remove(id).is_some()),
            );
        }
        Ok(popped)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
