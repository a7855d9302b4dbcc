//! Per-table fan-out shared by the database-level tasks.

use async_trait::async_trait;
use tidemark_core::catalog::PartitionError;

use crate::context::TaskContext;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{WorkQueue, run_pool};

/// A resumable unit of work scoped to one table.
#[async_trait]
pub(crate) trait TableTask: Send + 'static {
    /// Returns true once the task has nothing left to do.
    fn is_completed(&self) -> bool;

    /// Runs the task until it completes or fails.
    async fn execute(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()>;
}

/// Result of running one page of table tasks.
pub(crate) struct FanOut<T> {
    /// Tasks that completed.
    pub finished: Vec<T>,
    /// Tasks that were interrupted or never started.
    pub unfinished: Vec<T>,
    /// Per-item failures reported by completed tasks.
    pub failures: Vec<PartitionError>,
    /// The first fatal, deadline, or cancellation error.
    pub result: Result<()>,
}

/// Runs `tasks` in a fail-fast pool of `num_workers`.
///
/// Partial failures are collected instead of cancelling the other tables.
pub(crate) async fn run_tables<T: TableTask>(
    engine: &Engine,
    ctx: &TaskContext,
    num_workers: usize,
    tasks: Vec<T>,
) -> FanOut<T> {
    let outcome = run_pool(ctx, num_workers, tasks, |ctx, queue| {
        table_worker(engine.clone(), ctx, queue)
    })
    .await;

    let mut fan = FanOut {
        finished: Vec::new(),
        unfinished: outcome.remaining,
        failures: Vec::new(),
        result: outcome.result,
    };
    for (handled, failures) in outcome.states {
        fan.failures.extend(failures);
        for task in handled {
            if task.is_completed() {
                fan.finished.push(task);
            } else {
                fan.unfinished.push(task);
            }
        }
    }
    fan
}

async fn table_worker<T: TableTask>(
    engine: Engine,
    ctx: TaskContext,
    queue: WorkQueue<T>,
) -> ((Vec<T>, Vec<PartitionError>), Result<()>) {
    let mut handled = Vec::new();
    let mut failures = Vec::new();
    loop {
        let mut task = match queue.claim(&ctx) {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(e) => return ((handled, failures), Err(e)),
        };
        let result = task.execute(&engine, &ctx).await;
        handled.push(task);
        match result {
            Ok(()) => {}
            Err(Error::PartialFailure { errors }) => failures.extend(errors),
            Err(e) => return ((handled, failures), Err(e)),
        }
    }
    ((handled, failures), Ok(()))
}
