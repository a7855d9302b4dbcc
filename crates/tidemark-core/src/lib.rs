//! # tidemark-core
//!
//! Shared primitives for tidemark, the catalog partition maintenance engine.
//!
//! - **Time bins**: the Hourly/Daily partition-key codec and range filters
//! - **Collaborator contracts**: catalog, object store, and message queue traits
//!   with their data model
//! - **In-memory collaborators**: implementations of those traits for tests and
//!   local development
//! - **Ambient support**: error types, configuration, logging, identifiers
//!
//! ## Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tidemark_core::prelude::*;
//!
//! let t = Utc.with_ymd_and_hms(2020, 1, 1, 5, 30, 0).unwrap();
//! let key = TimeBin::Hourly.to_key(t);
//! assert_eq!(TimeBin::Hourly.from_key(&key).unwrap(), TimeBin::Hourly.truncate(t));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod id;
pub mod memory;
pub mod object_store;
pub mod observability;
pub mod queue;
pub mod timebin;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::catalog::{
        Catalog, Column, ListPartitionsRequest, ListTablesRequest, Page, Partition,
        PartitionError, PartitionErrorCode, PartitionInput, StorageDescriptor, Table,
    };
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::id::TraceId;
    pub use crate::memory::{InMemoryQueue, MemoryCatalog, MemoryObjectStore};
    pub use crate::object_store::{ObjectLocation, ObjectStore, has_data};
    pub use crate::observability::LogFormat;
    pub use crate::queue::{EnqueueOptions, EnqueueResult, MessageQueue, QueueMessage};
    pub use crate::timebin::{PartitionFilter, PartitionKeyError, TimeBin};
}

pub use error::{Error, Result};
