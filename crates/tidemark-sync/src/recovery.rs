//! Partition recovery.
//!
//! Finds hours whose data exists in the object store but which have no
//! catalog partition, and creates the missing partitions.
//!
//! For one table the work is:
//!
//! 1. Compute the [`RecoveryWindow`] (whole days) once and freeze it into the
//!    task so continuations scan the same range.
//! 2. Build a [`PartitionIndex`] of partitions already in the window.
//! 3. Hand the window's days, in ascending order, to a pool of workers. A
//!    worker probes every unpartitioned bin of its day and creates the
//!    partitions that hold data with a single batch call per day.
//!
//! The resumption cursor is the latest day any worker completed. A day is
//! complete once its batch call returned, even if some items failed; those
//! failures stay in the task state and are reported when the window is done.
//! Stats only ever include completed days, so a resumed task never counts a
//! day twice. With several workers the watermark can run ahead of an earlier
//! day that was still in flight when the deadline hit, so a resumed task may
//! skip that day. Single-worker runs resume exactly.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidemark_core::catalog::{PartitionError, Table};
use tidemark_core::object_store::has_data;
use tidemark_core::timebin::TimeBin;
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fanout::{TableTask, run_tables};
use crate::metrics;
use crate::pool::{WorkQueue, run_pool};
use crate::stats::{RecoverStats, count};

/// Day-aligned scan range of one recovery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryWindow {
    /// First day scanned (inclusive, midnight UTC).
    pub start: DateTime<Utc>,
    /// Day after the last day scanned (exclusive, midnight UTC).
    pub end: DateTime<Utc>,
    /// Bins starting at or after this instant are neither probed nor counted.
    pub horizon: DateTime<Utc>,
}

impl RecoveryWindow {
    /// Computes the window for `table`.
    ///
    /// `start` defaults to the table's creation time and `end` to `now`.
    /// With `clamp`, the range is also limited to `[created_at, now)`. Both
    /// ends are then floored to midnight; an empty result is widened to one
    /// day.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the start is after the end.
    pub fn compute(
        table: &Table,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        clamp: bool,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut start = start.unwrap_or(table.created_at);
        let mut end = end.unwrap_or(now);
        if clamp {
            start = start.max(table.created_at);
            end = end.min(now);
        }
        if start > end {
            return Err(Error::validation(format!(
                "recovery window for {table} starts at {start}, after its end {end}"
            )));
        }

        let day_start = TimeBin::Daily.truncate(start);
        let mut day_end = TimeBin::Daily.truncate(end);
        if day_end == day_start {
            day_end = TimeBin::Daily.next(day_start);
        }
        let horizon = if end > start { end.min(day_end) } else { day_end };

        Ok(Self {
            start: day_start,
            end: day_end,
            horizon,
        })
    }
}

/// Partition keys known to exist for one task.
#[derive(Debug, Clone, Default)]
pub struct PartitionIndex {
    keys: HashSet<Vec<String>>,
}

impl PartitionIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a key.
    pub fn insert(&mut self, key: Vec<String>) {
        self.keys.insert(key);
    }

    /// Returns true if `key` is recorded.
    #[must_use]
    pub fn contains(&self, key: &[String]) -> bool {
        self.keys.contains(key)
    }

    /// Returns the number of recorded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Extend<Vec<String>> for PartitionIndex {
    fn extend<I: IntoIterator<Item = Vec<String>>>(&mut self, iter: I) {
        self.keys.extend(iter);
    }
}

/// Recovery of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverTableTask {
    /// Owning database.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Requested window start; defaults to the table's creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Requested window end; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Limit the window to `[created_at, now)`.
    pub clamp_window: bool,
    /// Probe and count without creating partitions.
    pub dry_run: bool,
    /// Concurrent day workers.
    pub num_workers: usize,
    /// Window computed on the first run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<RecoveryWindow>,
    /// Latest day fully processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_day: Option<DateTime<Utc>>,
    /// Stats accumulated across invocations.
    #[serde(default)]
    pub stats: RecoverStats,
    /// True once every day of the window was processed.
    #[serde(default)]
    pub completed: bool,
    /// Partitions that could not be created, reported once the window is done.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PartitionError>,
}

impl RecoverTableTask {
    /// Creates a task over the default window.
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            start: None,
            end: None,
            clamp_window: false,
            dry_run: false,
            num_workers: 1,
            window: None,
            last_processed_day: None,
            stats: RecoverStats::default(),
            completed: false,
            failures: Vec::new(),
        }
    }

    /// Overrides the window bounds.
    #[must_use]
    pub const fn with_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Enables clamping to `[created_at, now)`.
    #[must_use]
    pub const fn with_clamp_window(mut self, clamp: bool) -> Self {
        self.clamp_window = clamp;
        self
    }

    /// Sets dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the number of day workers.
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Runs until every day of the window is processed.
    ///
    /// On `Error::DeadlineExceeded` the task's watermark and stats are the
    /// resumption checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an inverted window,
    /// `Error::TableNotFound`, `Error::PartialFailure` when some partitions
    /// could not be created, or the fatal, deadline, or cancellation error
    /// that stopped the run.
    #[tracing::instrument(skip_all, fields(database = %self.database, table = %self.table))]
    pub async fn run(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        if self.completed {
            return report_failures(&mut self.failures);
        }

        let table = Arc::new(engine.get_table(ctx, &self.database, &self.table).await?);
        let window = match self.window {
            Some(window) => window,
            None => {
                let window = RecoveryWindow::compute(
                    &table,
                    self.start,
                    self.end,
                    self.clamp_window,
                    Utc::now(),
                )?;
                self.window = Some(window);
                window
            }
        };

        let scan_start = self
            .last_processed_day
            .map_or(window.start, |day| TimeBin::Daily.next(day))
            .max(window.start);
        if scan_start >= window.end {
            self.completed = true;
            return report_failures(&mut self.failures);
        }

        let mut index = build_index(engine, ctx, &table, scan_start, window.end).await?;
        debug!(existing = index.len(), start = %scan_start, end = %window.end, "built partition index");

        let settings = DaySettings {
            horizon: window.horizon,
            probe_page_size: engine.config().probe_page_size,
            dry_run: self.dry_run,
        };
        let shared_index = Arc::new(index.clone());
        let days: Vec<_> = TimeBin::Daily.bins_between(scan_start, window.end).collect();
        let outcome = run_pool(ctx, self.num_workers, days, |ctx, queue| {
            day_worker(
                engine.clone(),
                ctx,
                queue,
                Arc::clone(&table),
                Arc::clone(&shared_index),
                settings,
            )
        })
        .await;

        // Worker stats cover completed days only, all at or before the
        // watermark, so nothing merged here is scanned again on resume.
        let mut watermark: Option<DateTime<Utc>> = None;
        for worker in outcome.states {
            self.stats.merge(&worker.stats);
            index.extend(worker.created);
            self.failures.extend(worker.errors);
            watermark = watermark.max(worker.last_completed);
        }
        if watermark > self.last_processed_day {
            self.last_processed_day = watermark;
        }
        outcome.result?;

        self.completed = true;
        info!(
            recovered = self.stats.recovered,
            hits = self.stats.hits,
            misses = self.stats.misses,
            failed = self.stats.failed,
            partitions = index.len(),
            dry_run = self.dry_run,
            "table recovery complete"
        );
        report_failures(&mut self.failures)
    }
}

/// Hands accumulated item failures to the caller as one `PartialFailure`.
fn report_failures(failures: &mut Vec<PartitionError>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::PartialFailure {
            errors: std::mem::take(failures),
        })
    }
}

#[async_trait]
impl TableTask for RecoverTableTask {
    fn is_completed(&self) -> bool {
        self.completed
    }

    async fn execute(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        self.run(engine, ctx).await
    }
}

async fn build_index(
    engine: &Engine,
    ctx: &TaskContext,
    table: &Table,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<PartitionIndex> {
    let filter = table.bin.between(start, end);
    let mut pages = engine.scanner().partitions(ctx, table, Some(filter), None);
    let mut index = PartitionIndex::new();
    while let Some(page) = pages.next().await {
        index.extend(page.items.into_iter().map(|p| p.values));
    }
    pages.finish().await?;
    Ok(index)
}

#[derive(Debug, Clone, Copy)]
struct DaySettings {
    horizon: DateTime<Utc>,
    probe_page_size: usize,
    dry_run: bool,
}

#[derive(Debug, Default)]
struct DayOutcome {
    stats: RecoverStats,
    created: Vec<Vec<String>>,
    errors: Vec<PartitionError>,
}

#[derive(Debug, Default)]
struct DayWorker {
    stats: RecoverStats,
    created: Vec<Vec<String>>,
    errors: Vec<PartitionError>,
    last_completed: Option<DateTime<Utc>>,
}

async fn day_worker(
    engine: Engine,
    ctx: TaskContext,
    queue: WorkQueue<DateTime<Utc>>,
    table: Arc<Table>,
    index: Arc<PartitionIndex>,
    settings: DaySettings,
) -> (DayWorker, Result<()>) {
    let mut state = DayWorker::default();
    loop {
        let day = match queue.claim(&ctx) {
            Ok(Some(day)) => day,
            Ok(None) => return (state, Ok(())),
            Err(e) => return (state, Err(e)),
        };
        match recover_day(&engine, &ctx, &table, &index, day, settings).await {
            Ok(outcome) => {
                state.stats.merge(&outcome.stats);
                state.created.extend(outcome.created);
                state.errors.extend(outcome.errors);
                state.last_completed = Some(day);
            }
            Err(e) => return (state, Err(e)),
        }
    }
}

/// Probes and recovers the unpartitioned bins of one day.
async fn recover_day(
    engine: &Engine,
    ctx: &TaskContext,
    table: &Table,
    index: &PartitionIndex,
    day: DateTime<Utc>,
    settings: DaySettings,
) -> Result<DayOutcome> {
    let mut outcome = DayOutcome::default();
    let end = TimeBin::Daily.next(day).min(settings.horizon);

    let mut batch = Vec::new();
    for bin in table.bin.bins_between(day, end) {
        if index.contains(&table.bin.to_key(bin)) {
            continue;
        }
        let location = table.partition_location(bin);
        let found = ctx
            .run(has_data(engine.object_store(), &location, settings.probe_page_size))
            .await?;
        metrics::record_probe(found);
        if found {
            outcome.stats.hits += 1;
            batch.push(table.partition_input(bin));
        } else {
            outcome.stats.misses += 1;
        }
    }

    if batch.is_empty() {
        return Ok(outcome);
    }
    if settings.dry_run {
        info!(day = %day.date_naive(), count = batch.len(), "dry run, partitions not created");
        return Ok(outcome);
    }

    let keys: Vec<Vec<String>> = batch.iter().map(|input| input.values.clone()).collect();
    outcome.stats.recovered = count(batch.len());
    let failures = ctx
        .run(
            engine
                .catalog()
                .batch_create_partitions(&table.database, &table.name, batch),
        )
        .await?;

    let mut failed = HashSet::new();
    for failure in failures {
        outcome.stats.recovered = outcome.stats.recovered.saturating_sub(1);
        if failure.is_already_exists() {
            continue;
        }
        warn!(partition = %failure.values.join("/"), error = %failure.message, "partition creation failed");
        outcome.stats.failed += 1;
        failed.insert(failure.values.clone());
        outcome.errors.push(failure);
    }
    outcome.created = keys.into_iter().filter(|k| !failed.contains(k)).collect();

    metrics::record_recovered(&table.database, outcome.stats.recovered);
    metrics::record_failures(&table.database, outcome.stats.failed);
    debug!(day = %day.date_naive(), recovered = outcome.stats.recovered, "recovered day");
    Ok(outcome)
}

/// Recovery of every table in a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverDatabaseTask {
    /// Database to recover.
    pub database: String,
    /// Only tables whose name starts with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Requested window start for every table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Requested window end for every table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Probe and count without creating partitions.
    pub dry_run: bool,
    /// Concurrent tables, and concurrent days within each table.
    pub num_workers: usize,
    /// Page token of the next table page to process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    /// Stats of completed tables.
    #[serde(default)]
    pub stats: RecoverStats,
    /// Table tasks interrupted by the deadline, handed off as their own
    /// continuations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<RecoverTableTask>,
    /// True once every table page was processed or handed off.
    #[serde(default)]
    pub completed: bool,
    /// Item failures of completed tables, reported once the listing is done.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PartitionError>,
}

impl RecoverDatabaseTask {
    /// Creates a task over every table in `database`.
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name_prefix: None,
            start: None,
            end: None,
            dry_run: false,
            num_workers: 1,
            next_page: None,
            stats: RecoverStats::default(),
            pending: Vec::new(),
            completed: false,
            failures: Vec::new(),
        }
    }

    /// Restricts the task to tables whose name starts with `prefix`.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: Option<String>) -> Self {
        self.name_prefix = prefix;
        self
    }

    /// Overrides the window bounds for every table.
    #[must_use]
    pub const fn with_range(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start = start;
        self.end = end;
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

    fn table_task(&self, engine: &Engine, table: &Table) -> RecoverTableTask {
        RecoverTableTask::new(&table.database, &table.name)
            .with_range(self.start, self.end)
            .with_clamp_window(!engine.is_event_database(&self.database))
            .with_dry_run(self.dry_run)
            .with_num_workers(self.num_workers)
    }

    /// Runs until every table is recovered.
    ///
    /// Partial failures of one table do not stop the others; they are
    /// reported together once every table is done. Failures of tables that
    /// finished before a deadline travel in `failures` and are reported by
    /// the continuation.
    ///
    /// # Errors
    ///
    /// Returns `Error::PartialFailure` with every per-item failure, or the
    /// first fatal, deadline, or cancellation error.
    #[tracing::instrument(skip_all, fields(database = %self.database))]
    pub async fn run(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        if self.completed {
            return report_failures(&mut self.failures);
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
            self.failures.extend(fan.failures);

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
            recovered = self.stats.recovered,
            misses = self.stats.misses,
            failed = self.stats.failed,
            "database recovery complete"
        );
        report_failures(&mut self.failures)
    }
}
