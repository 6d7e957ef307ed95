//! Core identifiers shared by the stores and the coordinator.

pub mod keys;
pub mod token;

pub use keys::KeySpace;
pub use token::LockToken;

/// Identifier of the entity (thread) owning a counter.
pub type EntityId = u64;

/// Identifier of a user performing a like.
pub type UserId = u64;
