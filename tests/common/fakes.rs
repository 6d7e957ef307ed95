use async_trait::async_trait;
use like_counter::types::{EntityId, LockToken};
use like_counter::{
    CounterError, CounterResult, DurableCounterStore, FastCounterStore, MemoryCounterStore,
    MemoryEntityStore,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn unavailable(op: &str) -> CounterError {
    CounterError::Unavailable(format!("injected {} failure", op))
}

/// Wraps [`MemoryCounterStore`] and fails selected operations on demand.
pub struct FaultyFastStore {
    pub inner: MemoryCounterStore,
    pub fail_increment: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_mark_dirty: AtomicBool,
    pub fail_pop: AtomicBool,
    /// Behave as if another process holds every populate lock
    pub foreign_lock: AtomicBool,
    pub lock_attempts: AtomicUsize,
    /// Hold back the reply of the next increment, after the store applied it
    pub next_increment_reply_delay: Mutex<Option<Duration>>,
}

impl FaultyFastStore {
    pub fn new(inner: MemoryCounterStore) -> Self {
        Self {
            inner,
            fail_increment: AtomicBool::new(false),
            fail_get: AtomicBool::new(false),
            fail_mark_dirty: AtomicBool::new(false),
            fail_pop: AtomicBool::new(false),
            foreign_lock: AtomicBool::new(false),
            lock_attempts: AtomicUsize::new(0),
            next_increment_reply_delay: Mutex::new(None),
        }
    }

    pub fn is_dirty(&self, id: EntityId) -> bool {
        self.inner.is_dirty(id)
    }
}

#[async_trait]
impl FastCounterStore for FaultyFastStore {
    async fn increment(&self, id: EntityId, delta: i64) -> CounterResult<i64> {
        if self.fail_increment.load(Ordering::SeqCst) {
            return Err(unavailable("increment"));
        }
        let result = self.inner.increment(id, delta).await;
        let delay = self.next_increment_reply_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn get(&self, id: EntityId) -> CounterResult<i64> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(unavailable("get"));
        }
        self.inner.get(id).await
    }

    async fn set(&self, id: EntityId, value: i64) -> CounterResult<()> {
        self.inner.set(id, value).await
    }

    async fn populate(&self, id: EntityId, value: i64) -> CounterResult<i64> {
        self.inner.populate(id, value).await
    }

    async fn invalidate(&self, id: EntityId) -> CounterResult<()> {
        self.inner.invalidate(id).await
    }

    async fn try_lock(
        &self,
        id: EntityId,
        token: &LockToken,
        ttl: Duration,
    ) -> CounterResult<bool> {
        self.lock_attempts.fetch_add(1, Ordering::SeqCst);
        if self.foreign_lock.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.try_lock(id, token, ttl).await
    }

    async fn unlock(&self, id: EntityId, token: &LockToken) -> CounterResult<bool> {
        self.inner.unlock(id, token).await
    }

    async fn mark_dirty(&self, id: EntityId) -> CounterResult<()> {
        if self.fail_mark_dirty.load(Ordering::SeqCst) {
            return Err(unavailable("mark_dirty"));
        }
        self.inner.mark_dirty(id).await
    }

    async fn pop_dirty(&self, limit: usize) -> CounterResult<Vec<EntityId>> {
        if self.fail_pop.load(Ordering::SeqCst) {
            return Err(unavailable("pop_dirty"));
        }
        self.inner.pop_dirty(limit).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}

/// [`MemoryEntityStore`] with a fixed delay on every call and call counters.
pub struct SlowDurableStore {
    pub inner: MemoryEntityStore,
    pub delay: Duration,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl SlowDurableStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryEntityStore::new(),
            delay,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, id: EntityId, value: i64) {
        self.inner.insert(id, value);
    }

    pub fn peek(&self, id: EntityId) -> Option<i64> {
        self.inner.peek(id)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl DurableCounterStore for SlowDurableStore {
    async fn get_counter(&self, id: EntityId) -> CounterResult<i64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.get_counter(id).await
    }

    async fn add_to_counter(&self, id: EntityId, delta: i64) -> CounterResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable("add_to_counter"));
        }
        self.inner.add_to_counter(id, delta).await
    }

    async fn set_counter(&self, id: EntityId, value: i64) -> CounterResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(unavailable("set_counter"));
        }
        self.inner.set_counter(id, value).await
    }
}
