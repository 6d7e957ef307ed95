use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;

/// How a caller took part in a coalesced unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// This caller ran the work.
    Led,
    /// This caller waited for another caller's run and received its result.
    Joined,
}

/// In-process request coalescing ("singleflight").
///
/// Concurrent callers using the same key share one execution of the work
/// and all receive a clone of its result. The key is deregistered once the
/// work has completed, so later callers start a fresh execution.
///
/// If the running caller is cancelled before finishing, one of the waiting
/// callers runs its own work instead. A cancelled caller with nobody waiting
/// leaves no registration behind.
pub struct Coalescer<K, T> {
    inflight: DashMap<K, Arc<OnceCell<T>>>,
}

impl<K, T> Coalescer<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `work` for `key`, or join the execution already in flight.
    pub async fn work<F, Fut>(&self, key: K, work: F) -> (T, Flight)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        // `cell` is bound after `_registration`, so it is released first and
        // deregistration only counts the callers still holding the flight.
        let (_registration, cell) = self.register(key);

        let mut ran = false;
        let value = cell
            .get_or_init(|| {
                ran = true;
                work()
            })
            .await
            .clone();

        let flight = if ran { Flight::Led } else { Flight::Joined };
        (value, flight)
    }

    fn register(&self, key: K) -> (Registration<'_, K, T>, Arc<OnceCell<T>>) {
        let cell = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let cell = Arc::new(OnceCell::new());
                entry.insert(Arc::clone(&cell));
                cell
            }
        };
        let registration = Registration {
            inflight: &self.inflight,
            key,
            cell: Arc::downgrade(&cell),
        };
        (registration, cell)
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Deregisters a flight when its caller finishes or is cancelled.
///
/// The entry goes once the work has completed, or once no caller is left to
/// run it. A cancelled leader with waiting followers leaves it in place so a
/// follower can take over.
struct Registration<'a, K: Hash + Eq, T> {
    inflight: &'a DashMap<K, Arc<OnceCell<T>>>,
    key: K,
    // Weak keeps the allocation alive, so the pointer cannot be reused by a
    // newer flight for the same key.
    cell: Weak<OnceCell<T>>,
}

impl<K: Hash + Eq, T> Drop for Registration<'_, K, T> {
    fn drop(&mut self) {
        let ours = self.cell.as_ptr();
        self.inflight.remove_if(&self.key, |_, registered| {
            std::ptr::eq(Arc::as_ptr(registered), ours)
                && (registered.initialized() || Arc::strong_count(registered) == 1)
        });
    }
}

impl<K, T> Default for Coalescer<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
