//! In-memory collaborator implementations.
//!
//! These back the catalog, object store, and message queue contracts with
//! process-local state. They are used by tests and local development and are
//! not suitable for production: nothing is persisted or shared across processes.
//!
//! All three are thread-safe via `RwLock` and record enough about the calls they
//! receive for tests to assert on.

mod catalog;
mod object_store;
mod queue;

pub use catalog::MemoryCatalog;
pub use object_store::MemoryObjectStore;
pub use queue::{InMemoryQueue, QueueEntry};

use std::sync::PoisonError;

use crate::error::Error;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}
