//! # tidemark-sync
//!
//! Resumable maintenance jobs for time-partitioned catalog tables.
//!
//! - **Sync** rewrites partitions whose column schema has drifted from their
//!   table's schema.
//! - **Recovery** probes object storage for time bins that hold data but have
//!   no catalog partition, and registers them.
//!
//! Both jobs run under a working deadline. Whatever is left when it passes is
//! checkpointed into [`continuation::Envelope`]s and enqueued, so a later
//! invocation picks up where this one stopped.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tidemark_core::prelude::*;
//! use tidemark_sync::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let handler = TaskHandler::new(
//!     Collaborators {
//!         catalog: Arc::new(MemoryCatalog::new()),
//!         object_store: Arc::new(MemoryObjectStore::new()),
//!         queue: Arc::new(InMemoryQueue::new("tidemark-tasks")),
//!     },
//!     Config::default(),
//! );
//!
//! let request = SyncRequest {
//!     database: "logs".into(),
//!     ..SyncRequest::default()
//! };
//! let outcome = handler.start_sync(request, None).await;
//! assert!(outcome.is_complete());
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod continuation;
pub mod diff;
pub mod engine;
pub mod error;
mod fanout;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod reconciler;
pub mod recovery;
pub mod scanner;
pub mod stats;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::TaskContext;
    pub use crate::continuation::{Envelope, Limits, TaskState, advance};
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::handler::{
        Collaborators, HandlerOutcome, RecoverRequest, SyncRequest, TaskHandler,
    };
    pub use crate::reconciler::{SyncDatabaseTask, SyncTableTask};
    pub use crate::recovery::{RecoverDatabaseTask, RecoverTableTask, RecoveryWindow};
    pub use crate::stats::{RecoverStats, SyncStats, TaskStats};
}

pub use error::{Error, Result};
