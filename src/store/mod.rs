//! Capability interfaces for the fast (cache) and durable (authoritative)
//! counter stores, plus the concrete implementations.
//!
//! - [`memory::MemoryCounterStore`] - in-process fast store (moka + dashmap)
//! - [`redis::RedisCounterStore`] - production fast store
//! - [`entity::MemoryEntityStore`] - in-process durable store

pub mod entity;
pub mod memory;
pub mod redis;

pub use self::entity::MemoryEntityStore;
pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use crate::error::CounterResult;
use crate::types::{EntityId, LockToken};
use async_trait::async_trait;
use std::time::Duration;

/// Fast key-value store holding per-entity counters, lock records and the
/// dirty set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FastCounterStore: Send + Sync {
    /// Atomically add `delta` and return the new value, refreshing the TTL.
    ///
    /// An absent or expired key yields `NotFound`; the store never creates a
    /// counter at `delta`, which would silently drop the durable base value.
    async fn increment(&self, id: EntityId, delta: i64) -> CounterResult<i64>;

    /// Current value, or `NotFound` when absent or expired.
    async fn get(&self, id: EntityId) -> CounterResult<i64>;

    /// Overwrite the counter with a fresh TTL plus random jitter.
    async fn set(&self, id: EntityId, value: i64) -> CounterResult<()>;

    /// Store `value` with a fresh jittered TTL only when no counter exists,
    /// and return the value that is cached afterwards. A counter written by
    /// a concurrent populate, and the increments applied on top of it, are
    /// never replaced by an older durable read.
    async fn populate(&self, id: EntityId, value: i64) -> CounterResult<i64>;

    /// Drop the counter so the next read repopulates from durable storage.
    async fn invalidate(&self, id: EntityId) -> CounterResult<()>;

    /// Set-if-absent on the lock record. `false` means another holder is active.
    async fn try_lock(&self, id: EntityId, token: &LockToken, ttl: Duration)
        -> CounterResult<bool>;

    /// Delete the lock record only if it still holds `token`.
    /// Returns whether a lock was released.
    async fn unlock(&self, id: EntityId, token: &LockToken) -> CounterResult<bool>;

    async fn mark_dirty(&self, id: EntityId) -> CounterResult<()>;

    /// Atomically remove and return up to `limit` dirty ids.
    async fn pop_dirty(&self, limit: usize) -> CounterResult<Vec<EntityId>>;

    fn backend_name(&self) -> &'static str;
}

/// Authoritative counter column on the entity row.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableCounterStore: Send + Sync {
    /// `NotFound` when the entity does not exist.
    async fn get_counter(&self, id: EntityId) -> CounterResult<i64>;

    /// Atomic relative update.
    async fn add_to_counter(&self, id: EntityId, delta: i64) -> CounterResult<()>;

    /// Atomic absolute write, used by the reconciler.
    async fn set_counter(&self, id: EntityId, value: i64) -> CounterResult<()>;
}

/// TTL applied by `FastCounterStore::set`: `base` plus a uniformly random
/// jitter in `[0, jitter)` so keys populated together do not expire together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl TtlPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    /// Draw a TTL for a freshly populated key.
    pub fn draw(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(fastrand::u64(0..jitter_ms))
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(60))
    }
}
