//! Cache coherence for per-entity counters.
//!
//! [`CachedCounter`] serves reads and increments from the fast store and
//! [`LikeCountFlusher`] reconciles dirty counters back to durable storage.

pub mod cached;
pub mod coalesce;
pub mod flusher;

pub use cached::{CachedCounter, PopulatePolicy};
pub use coalesce::{Coalescer, Flight};
pub use flusher::{FlushReport, FlusherHandle, LikeCountFlusher};
