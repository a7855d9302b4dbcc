//! Fail-fast worker pools.
//!
//! A pool runs a fixed number of workers over a shared queue of items known
//! up front. Workers claim items in order. The first worker error cancels
//! the pool's context so siblings stop at their next check, but the join
//! always waits for every worker so their states can be merged.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;

use crate::context::TaskContext;
use crate::error::{Error, Result};

/// Ordered queue of pending items shared by the workers of one pool.
#[derive(Debug)]
pub struct WorkQueue<I> {
    items: Arc<Mutex<VecDeque<I>>>,
}

impl<I> Clone for WorkQueue<I> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<I> WorkQueue<I> {
    fn new(items: impl IntoIterator<Item = I>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items.into_iter().collect())),
        }
    }

    /// Claims the next item, or `None` once the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeadlineExceeded` or `Error::Cancelled` when the
    /// context says to stop; the item stays queued.
    pub fn claim(&self, ctx: &TaskContext) -> Result<Option<I>> {
        ctx.check()?;
        let mut items = self.items.lock().map_err(|_| Error::Internal {
            message: "work queue lock poisoned".into(),
        })?;
        Ok(items.pop_front())
    }

    fn drain(&self) -> Vec<I> {
        self.items
            .lock()
            .map(|mut items| items.drain(..).collect())
            .unwrap_or_default()
    }
}

/// What a pool run produced.
#[derive(Debug)]
pub struct PoolOutcome<I, S> {
    /// Final state of every worker that ran to completion or failure.
    pub states: Vec<S>,
    /// Items no worker claimed.
    pub remaining: Vec<I>,
    /// The highest-ranked worker error, if any.
    pub result: Result<()>,
}

/// Runs `num_workers` (at least one) workers over `items`.
///
/// Each worker receives a child context of `ctx` and the shared queue, and
/// returns its state together with its result. After all workers finish,
/// a cancellation of `ctx` itself is reported even if every worker stopped
/// quietly.
pub async fn run_pool<I, S, F, Fut>(
    ctx: &TaskContext,
    num_workers: usize,
    items: impl IntoIterator<Item = I>,
    worker: F,
) -> PoolOutcome<I, S>
where
    I: Send + 'static,
    S: Send + 'static,
    F: Fn(TaskContext, WorkQueue<I>) -> Fut,
    Fut: Future<Output = (S, Result<()>)> + Send + 'static,
{
    let group = ctx.child();
    let queue = WorkQueue::new(items);
    let mut set = JoinSet::new();

    for _ in 0..num_workers.max(1) {
        let token = group.clone();
        let fut = worker(group.clone(), queue.clone());
        set.spawn(async move {
            let (state, result) = fut.await;
            if result.is_err() {
                token.cancel();
            }
            (state, result)
        });
    }

    let mut states = Vec::with_capacity(num_workers.max(1));
    let mut failure: Option<Error> = None;
    while let Some(joined) = set.join_next().await {
        let error = match joined {
            Ok((state, result)) => {
                states.push(state);
                result.err()
            }
            Err(e) => {
                group.cancel();
                Some(Error::Internal {
                    message: format!("worker task failed: {e}"),
                })
            }
        };
        if let Some(error) = error {
            failure = Some(match failure {
                Some(current) => current.merge(error),
                None => error,
            });
        }
    }

    let result = match failure {
        Some(error) => Err(error),
        None => ctx.check(),
    };
    PoolOutcome {
        states,
        remaining: queue.drain(),
        result,
    }
}
