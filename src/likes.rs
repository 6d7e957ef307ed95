//! User-facing like/unlike on top of the cached counter.

use crate::counter::CachedCounter;
use crate::error::{CounterError, CounterResult};
use crate::types::{EntityId, UserId};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{error, info};

/// Record of which user liked which thread.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LikeLedger: Send + Sync {
    /// `AlreadyExists` when the pair is already recorded.
    async fn insert(&self, user: UserId, thread: EntityId) -> CounterResult<()>;

    /// `NotFound` when the pair is not recorded.
    async fn remove(&self, user: UserId, thread: EntityId) -> CounterResult<()>;

    async fn contains(&self, user: UserId, thread: EntityId) -> CounterResult<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryLikeLedger {
    likes: DashSet<(UserId, EntityId)>,
}

impl MemoryLikeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded likes on `thread`.
    pub fn count_for(&self, thread: EntityId) -> i64 {
        self.likes.iter().filter(|pair| pair.1 == thread).count() as i64
    }
}

#[async_trait]
impl LikeLedger for MemoryLikeLedger {
    async fn insert(&self, user: UserId, thread: EntityId) -> CounterResult<()> {
        if self.likes.insert((user, thread)) {
            Ok(())
        } else {
            Err(CounterError::AlreadyExists(format!(
                "user {} already likes thread {}",
                user, thread
            )))
        }
    }

    async fn remove(&self, user: UserId, thread: EntityId) -> CounterResult<()> {
        self.likes
            .remove(&(user, thread))
            .map(|_| ())
            .ok_or_else(|| {
                CounterError::NotFound(format!("user {} does not like thread {}", user, thread))
            })
    }

    async fn contains(&self, user: UserId, thread: EntityId) -> CounterResult<bool> {
        Ok(self.likes.contains(&(user, thread)))
    }
}

/// Like/unlike of threads.
///
/// The ledger is written first. When the counter increment then fails the
/// ledger change is undone, so a like is never recorded without its count
/// having moved.
pub struct LikeService {
    ledger: Arc<dyn LikeLedger>,
    counter: Arc<CachedCounter>,
}

impl LikeService {
    pub fn new(ledger: Arc<dyn LikeLedger>, counter: Arc<CachedCounter>) -> Self {
        Self { ledger, counter }
    }

    /// Returns the new like count.
    pub async fn like(&self, user: UserId, thread: EntityId) -> CounterResult<i64> {
        self.ledger.insert(user, thread).await?;

        match self.counter.increment(thread, 1).await {
            Ok(count) => {
                info!(operation = "like", user_id = user, entity_id = thread, count);
                Ok(count)
            }
            Err(e) => {
                if let Err(rollback) = self.ledger.remove(user, thread).await {
                    error!(
                        user_id = user,
                        entity_id = thread,
                        error = %rollback,
                        "Failed to roll back like after counter failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Returns the new like count.
    pub async fn unlike(&self, user: UserId, thread: EntityId) -> CounterResult<i64> {
        self.ledger.remove(user, thread).await?;

        match self.counter.increment(thread, -1).await {
            Ok(count) => {
                info!(operation = "unlike", user_id = user, entity_id = thread, count);
                Ok(count)
            }
            Err(e) => {
                if let Err(rollback) = self.ledger.insert(user, thread).await {
                    error!(
                        user_id = user,
                        entity_id = thread,
                        error = %rollback,
                        "Failed to roll back unlike after counter failure"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn is_liked(&self, user: UserId, thread: EntityId) -> CounterResult<bool> {
        self.ledger.contains(user, thread).await
    }

    pub async fn count(&self, thread: EntityId) -> CounterResult<i64> {
        self.counter.get(thread).await
    }
}
