//! Schema reconciliation.
//!
//! [`SyncTableTask`] scans one table's partitions page by page, diffs each
//! partition's columns against the table's, and rewrites drifted
//! descriptors through a fail-fast update pool. Its cursor is the catalog
//! page token of the next unprocessed page and only advances once every
//! update of a page has been applied, so a resumed task repeats at most one
//! page.
//!
//! [`SyncDatabaseTask`] runs a table task for every table in a database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidemark_core::catalog::{PartitionInput, Table};
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::diff::diff_partition;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fanout::{TableTask, run_tables};
use crate::metrics;
use crate::pool::run_pool;
use crate::stats::{SyncStats, count};

/// Reconciliation of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTableTask {
    /// Owning database.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Only scan partitions from the table's creation time onwards.
    pub after_table_create_time: bool,
    /// Count drift without updating anything.
    pub dry_run: bool,
    /// Concurrent partition updates.
    pub num_workers: usize,
    /// Page token of the next page to process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    /// Stats accumulated across invocations.
    #[serde(default)]
    pub stats: SyncStats,
    /// True once the last page was processed.
    #[serde(default)]
    pub completed: bool,
}

impl SyncTableTask {
    /// Creates a task starting at the first partition.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            after_table_create_time: false,
            dry_run: false,
            num_workers: 1,
            next_page: None,
            stats: SyncStats::default(),
            completed: false,
        }
    }

    /// Sets dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the number of update workers.
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Restricts the scan to partitions at or after the table's creation.
    #[must_use]
    pub const fn with_after_table_create_time(mut self, enabled: bool) -> Self {
        self.after_table_create_time = enabled;
        self
    }

    /// Runs until every page is processed.
    ///
    /// On `Error::DeadlineExceeded` the task's cursor and stats are the
    /// resumption checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::TableNotFound` if the table is gone, `Error::Validation`
    /// for a malformed partition key, the first failed update, or the
    /// deadline/cancellation that stopped the scan.
    #[tracing::instrument(skip_all, fields(database = %self.database, table = %self.table))]
    pub async fn run(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        if self.completed {
            return Ok(());
        }

        let table = engine.get_table(ctx, &self.database, &self.table).await?;
        let filter = self
            .after_table_create_time
            .then(|| table.bin.after(table.created_at));
        let mut pages = engine
            .scanner()
            .partitions(ctx, &table, filter, self.next_page.clone());

        while let Some(page) = pages.next().await {
            ctx.check()?;

            let mut page_stats = SyncStats {
                pages_scanned: 1,
                ..SyncStats::default()
            };
            let mut updates = Vec::new();
            for partition in &page.items {
                page_stats.partitions_observed += 1;
                // A malformed key fails the whole table scan.
                let t = table.bin.from_key(&partition.values).map_err(|e| {
                    Error::validation(format!("partition of {table}: {e}"))
                })?;
                page_stats.observe(t);
                if let Some(update) = diff_partition(&table, partition) {
                    updates.push(update);
                }
            }
            page_stats.diff_count = count(updates.len());

            if !self.dry_run && !updates.is_empty() {
                let (synced, result) =
                    apply_updates(engine, ctx, &table, updates, self.num_workers).await;
                metrics::record_synced(&self.database, synced);
                if let Err(e) = result {
                    self.stats.synced_count += synced;
                    return Err(e);
                }
                page_stats.synced_count = synced;
            }

            self.stats.merge(&page_stats);
            self.next_page = page.next_token;
            debug!(
                observed = page_stats.partitions_observed,
                diffs = page_stats.diff_count,
                synced = page_stats.synced_count,
                "processed partition page"
            );
        }
        pages.finish().await?;

        self.completed = true;
        info!(
            pages = self.stats.pages_scanned,
            observed = self.stats.partitions_observed,
            diffs = self.stats.diff_count,
            synced = self.stats.synced_count,
            dry_run = self.dry_run,
            "table sync complete"
        );
        Ok(())
    }
}

#[async_trait]
impl TableTask for SyncTableTask {
    fn is_completed(&self) -> bool {
        self.completed
    }

    async fn execute(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        self.run(engine, ctx).await
    }
}

/// Applies `updates` with a fail-fast pool and returns how many succeeded.
async fn apply_updates(
    engine: &Engine,
    ctx: &TaskContext,
    table: &Table,
    updates: Vec<PartitionInput>,
    num_workers: usize,
) -> (u64, Result<()>) {
    let outcome = run_pool(ctx, num_workers, updates, |ctx, queue| {
        let engine = engine.clone();
        let database = table.database.clone();
        let name = table.name.clone();
        async move {
            let mut synced = 0_u64;
            loop {
                let input = match queue.claim(&ctx) {
                    Ok(Some(input)) => input,
                    Ok(None) => return (synced, Ok(())),
                    Err(e) => return (synced, Err(e)),
                };
                let key = input.values.join("/");
                let updated = ctx
                    .run(engine.catalog().update_partition(&database, &name, input))
                    .await;
                if let Err(e) = updated {
                    if !e.is_cancelled() {
                        warn!(partition = %key, error = %e, "partition update failed");
                    }
                    return (synced, Err(e));
                }
                synced += 1;
            }
        }
    })
    .await;

    (outcome.states.iter().sum(), outcome.result)
}

/// Reconciliation of every table in a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDatabaseTask {
    /// Database to reconcile.
    pub database: String,
    /// Only tables whose name starts with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Count drift without updating anything.
    pub dry_run: bool,
    /// Concurrent tables, and concurrent updates within each table.
    pub num_workers: usize,
    /// Page token of the next table page to process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    /// Stats of completed tables.
    #[serde(default)]
    pub stats: SyncStats,
    /// Table tasks interrupted by the deadline, handed off as their own
    /// continuations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<SyncTableTask>,
    /// True once every table page was processed or handed off.
    #[serde(default)]
    pub completed: bool,
}

impl SyncDatabaseTask {
    /// Creates a task over every table in `database`.
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name_prefix: None,
            dry_run: false,
            num_workers: 1,
            next_page: None,
            stats: SyncStats::default(),
            pending: Vec::new(),
            completed: false,
        }
    }

    /// Restricts the task to tables whose name starts with `prefix`.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: Option<String>) -> Self {
        self.name_prefix = prefix;
        self
    }

    /// Sets dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    fn table_task(&self, engine: &Engine, table: &Table) -> SyncTableTask {
        SyncTableTask::new(&table.database, &table.name)
            .with_dry_run(self.dry_run)
            .with_num_workers(self.num_workers)
            .with_after_table_create_time(!engine.is_event_database(&self.database))
    }

    /// Runs until every table is reconciled.
    ///
    /// When the deadline interrupts a page of tables, the unfinished table
    /// tasks are moved to `pending` and the cursor advances past that page.
    ///
    /// # Errors
    ///
    /// Returns the first fatal table error or the deadline/cancellation that
    /// stopped the run.
    #[tracing::instrument(skip_all, fields(database = %self.database))]
    pub async fn run(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        if self.completed {
            return Ok(());
        }

        let mut tables = engine.scanner().tables(
            ctx,
            &self.database,
            self.name_prefix.as_deref(),
            self.next_page.clone(),
        );

        while let Some(page) = tables.next().await {
            ctx.check()?;

            let tasks = page
                .items
                .iter()
                .map(|table| self.table_task(engine, table))
                .collect();
            let fan = run_tables(engine, ctx, self.num_workers, tasks).await;
            for task in &fan.finished {
                self.stats.merge(&task.stats);
            }

            match fan.result {
                Ok(()) => {}
                Err(e) if e.is_deadline_exceeded() => {
                    self.completed = page.is_last();
                    self.next_page = page.next_token;
                    self.pending = fan.unfinished;
                    info!(pending = self.pending.len(), "deadline reached, handing off tables");
                    return Err(e);
                }
                Err(e) => {
                    for task in &fan.unfinished {
                        self.stats.merge(&task.stats);
                    }
                    return Err(e);
                }
            }
            self.next_page = page.next_token;
        }
        tables.finish().await?;

        self.completed = true;
        info!(
            observed = self.stats.partitions_observed,
            diffs = self.stats.diff_count,
            synced = self.stats.synced_count,
            "database sync complete"
        );
        Ok(())
    }
}
