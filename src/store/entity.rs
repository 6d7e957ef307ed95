use super::DurableCounterStore;
use crate::error::{CounterError, CounterResult};
use crate::types::EntityId;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

/// In-process durable store: one counter column per registered entity.
///
/// Stands in for the relational `threads.like_count` column in tests and in
/// the demo runner. Every mutation holds the row's shard lock, which gives the
/// same atomicity as an `UPDATE ... SET like_count = like_count + ?` statement.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: DashMap<EntityId, i64>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entity row with an initial counter value.
    pub fn insert(&self, id: EntityId, value: i64) {
        self.rows.insert(id, value);
    }

    /// Delete the entity row.
    pub fn remove(&self, id: EntityId) -> Option<i64> {
        self.rows.remove(&id).map(|(_, value)| value)
    }

    /// Read the column without going through the async interface.
    pub fn peek(&self, id: EntityId) -> Option<i64> {
        self.rows.get(&id).map(|row| *row)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn missing(id: EntityId) -> CounterError {
    CounterError::NotFound(format!("entity {}", id))
}

#[async_trait]
impl DurableCounterStore for MemoryEntityStore {
    async fn get_counter(&self, id: EntityId) -> CounterResult<i64> {
        self.peek(id).ok_or_else(|| missing(id))
    }

    async fn add_to_counter(&self, id: EntityId, delta: i64) -> CounterResult<()> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| missing(id))?;
        *row = row.checked_add(delta).ok_or_else(|| {
            CounterError::InvalidArgument(format!("counter {} overflows adding {}", id, delta))
        })?;
        trace!(entity_id = id, delta, value = *row, "durable counter adjusted");
        Ok(())
    }

    async fn set_counter(&self, id: EntityId, value: i64) -> CounterResult<()> {
        let mut row = self.rows.get_mut(&id).ok_or_else(|| missing(id))?;
        *row = value;
        trace!(entity_id = id, value, "durable counter written");
        Ok(())
    }
}
