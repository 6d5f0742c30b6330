//! Durable store backends.
//!
//! The manager consumes the store through [`PersistenceManager`]. An
//! in-memory backend ships for embedding and tests.

pub mod memory;
pub mod traits;

pub use memory::InMemoryPersistenceManager;
pub use traits::PersistenceManager;
