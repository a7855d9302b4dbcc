//! Collaborators and settings shared by every task of one handler.

use std::sync::Arc;

use tidemark_core::catalog::{Catalog, Table};
use tidemark_core::config::Config;
use tidemark_core::object_store::ObjectStore;

use crate::context::TaskContext;
use crate::error::{Error, Result};
use crate::scanner::Scanner;

/// Catalog, object store, and configuration used by tasks.
#[derive(Clone)]
pub struct Engine {
    catalog: Arc<dyn Catalog>,
    object_store: Arc<dyn ObjectStore>,
    config: Arc<Config>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine.
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, object_store: Arc<dyn ObjectStore>, config: Config) -> Self {
        Self {
            catalog,
            object_store,
            config: Arc::new(config),
        }
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// Returns the object store.
    #[must_use]
    pub fn object_store(&self) -> &dyn ObjectStore {
        self.object_store.as_ref()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a scanner over the catalog.
    #[must_use]
    pub fn scanner(&self) -> Scanner {
        Scanner::new(Arc::clone(&self.catalog), self.config.partition_page_size)
    }

    /// Returns true if `database` is the primary event-time database.
    #[must_use]
    pub fn is_event_database(&self, database: &str) -> bool {
        self.config.event_database == database
    }

    /// Looks up a table, mapping absence to `Error::TableNotFound`.
    pub(crate) async fn get_table(
        &self,
        ctx: &TaskContext,
        database: &str,
        table: &str,
    ) -> Result<Table> {
        ctx.run(self.catalog.get_table(database, table))
            .await
            .map_err(|e| match e {
                Error::Core(core) if core.is_not_found() => Error::TableNotFound {
                    database: database.to_string(),
                    table: table.to_string(),
                },
                other => other,
            })
    }
}
