//! Shared fixtures for the job-level tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tidemark_core::catalog::{Column, Partition, StorageDescriptor, Table};
use tidemark_core::config::Config;
use tidemark_core::memory::{InMemoryQueue, MemoryCatalog, MemoryObjectStore};
use tidemark_core::timebin::TimeBin;
use tidemark_sync::handler::{Collaborators, TaskHandler};

/// In-memory collaborators wired into a handler.
pub struct Harness {
    pub catalog: Arc<MemoryCatalog>,
    pub store: Arc<MemoryObjectStore>,
    pub queue: Arc<InMemoryQueue>,
    pub handler: TaskHandler,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_catalog(MemoryCatalog::new(), config)
    }

    pub fn with_catalog(catalog: MemoryCatalog, config: Config) -> Self {
        let queue = InMemoryQueue::new(config.queue_name.clone());
        Self::from_parts(catalog, MemoryObjectStore::new(), queue, config)
    }

    pub fn with_store(store: MemoryObjectStore, config: Config) -> Self {
        let queue = InMemoryQueue::new(config.queue_name.clone());
        Self::from_parts(MemoryCatalog::new(), store, queue, config)
    }

    pub fn from_parts(
        catalog: MemoryCatalog,
        store: MemoryObjectStore,
        queue: InMemoryQueue,
        config: Config,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let handler = TaskHandler::new(
            Collaborators {
                catalog: catalog.clone(),
                object_store: store.clone(),
                queue: queue.clone(),
            },
            config,
        );
        Self {
            catalog,
            store,
            queue,
            handler,
        }
    }

    /// Writes a `size`-byte object into the bin of `t`.
    pub fn put_data(&self, table: &Table, t: DateTime<Utc>, size: u64) {
        let location = format!("{}part-0000.json.gz", table.partition_location(t));
        self.store.put(&location, size).unwrap();
    }

    /// Keys of the table's partitions, each joined with `/`.
    pub fn partition_keys(&self, table: &Table) -> Vec<String> {
        self.catalog
            .partitions(&table.database, &table.name)
            .unwrap()
            .into_iter()
            .map(|p| p.values.join("/"))
            .collect()
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, day, hour, 0, 0).unwrap()
}

pub fn table(database: &str, name: &str, created_at: DateTime<Utc>) -> Table {
    Table {
        database: database.into(),
        name: name.into(),
        created_at,
        bin: TimeBin::Hourly,
        storage: StorageDescriptor {
            columns: vec![
                Column::new("p_event_time", "timestamp"),
                Column::new("p_log_type", "string"),
                Column::new("message", "string"),
            ],
            location: format!("s3://data-lake/{database}/{name}/"),
            ..StorageDescriptor::default()
        },
    }
}

/// A partition of `table` at `t` whose descriptor lacks the newest column.
pub fn stale_partition(table: &Table, t: DateTime<Utc>) -> Partition {
    let mut partition = table.partition_input(t).into_partition();
    partition.storage.columns.pop();
    partition
}

/// A partition of `table` at `t` matching the table schema.
pub fn fresh_partition(table: &Table, t: DateTime<Utc>) -> Partition {
    table.partition_input(t).into_partition()
}
