//! Synthetic like/read traffic for exercising the counter end to end.

use crate::error::CounterError;
use crate::likes::LikeService;
use crate::types::{EntityId, UserId};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Workload {
    /// Entities are numbered `1..=entities`
    pub entities: u64,
    /// Users are numbered `1..=users`
    pub users: u64,
    pub operations: usize,
    pub concurrency: usize,
    /// Fraction of operations that read the count instead of toggling a like
    pub read_ratio: f64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            entities: 16,
            users: 1_000,
            operations: 10_000,
            concurrency: 64,
            read_ratio: 0.8,
        }
    }
}

impl Workload {
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> {
        1..=self.entities.max(1)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadReport {
    pub likes: u64,
    pub unlikes: u64,
    pub reads: u64,
    /// Toggles that lost a race against the same user (already liked / not liked)
    pub rejected: u64,
    /// Operations that failed on a store
    pub failures: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Tally {
    likes: AtomicU64,
    unlikes: AtomicU64,
    reads: AtomicU64,
    rejected: AtomicU64,
    failures: AtomicU64,
}

enum Op {
    Read(EntityId),
    Toggle(UserId, EntityId),
}

impl Workload {
    fn next_op(&self) -> Op {
        let entity = fastrand::u64(1..=self.entities.max(1));
        if fastrand::f64() < self.read_ratio {
            Op::Read(entity)
        } else {
            Op::Toggle(fastrand::u64(1..=self.users.max(1)), entity)
        }
    }
}

/// Run `workload.operations` random operations with at most
/// `workload.concurrency` in flight.
pub async fn drive(service: Arc<LikeService>, workload: Workload) -> WorkloadReport {
    let started = Instant::now();
    let tally = Tally::default();

    info!(
        operation = "workload_start",
        entities = workload.entities,
        users = workload.users,
        operations = workload.operations,
        concurrency = workload.concurrency,
    );

    stream::iter(0..workload.operations)
        .for_each_concurrent(workload.concurrency.max(1), |_| {
            let service = Arc::clone(&service);
            let tally = &tally;
            let op = workload.next_op();
            async move {
                match op {
                    Op::Read(entity) => match service.count(entity).await {
                        Ok(_) => {
                            tally.reads.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!(entity_id = entity, error = %e, "Read failed");
                            tally.failures.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    Op::Toggle(user, entity) => toggle(&service, tally, user, entity).await,
                }
            }
        })
        .await;

    let report = WorkloadReport {
        likes: tally.likes.load(Ordering::Relaxed),
        unlikes: tally.unlikes.load(Ordering::Relaxed),
        reads: tally.reads.load(Ordering::Relaxed),
        rejected: tally.rejected.load(Ordering::Relaxed),
        failures: tally.failures.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    };

    info!(
        operation = "workload_complete",
        likes = report.likes,
        unlikes = report.unlikes,
        reads = report.reads,
        rejected = report.rejected,
        failures = report.failures,
        elapsed_ms = report.elapsed.as_millis() as u64,
    );

    report
}

async fn toggle(service: &LikeService, tally: &Tally, user: UserId, entity: EntityId) {
    let liked = match service.is_liked(user, entity).await {
        Ok(liked) => liked,
        Err(_) => {
            tally.failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let result = if liked {
        service.unlike(user, entity).await
    } else {
        service.like(user, entity).await
    };

    match result {
        Ok(_) if liked => {
            tally.unlikes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(_) => {
            tally.likes.fetch_add(1, Ordering::Relaxed);
        }
        Err(CounterError::AlreadyExists(_)) | Err(CounterError::NotFound(_)) => {
            tally.rejected.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            debug!(user_id = user, entity_id = entity, error = %e, "Toggle failed");
            tally.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
