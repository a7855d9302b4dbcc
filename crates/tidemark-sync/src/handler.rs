//! Entry points invoked by the host.
//!
//! A [`TaskHandler`] turns a request or a redelivered [`Envelope`] into one
//! bounded run. When the run stops at its working deadline, the unfinished
//! work is advanced through the continuation guard and enqueued; the handler
//! itself never loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidemark_core::catalog::Catalog;
use tidemark_core::config::Config;
use tidemark_core::id::TraceId;
use tidemark_core::object_store::ObjectStore;
use tidemark_core::observability::{init_logging, task_span};
use tidemark_core::queue::{EnqueueOptions, MessageQueue};
use tokio::time::Instant;
use tracing::{Instrument, error, info, warn};

use crate::context::TaskContext;
use crate::continuation::{Envelope, Limits, TaskState, advance};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::metrics::{self, TaskTimer};
use crate::reconciler::SyncDatabaseTask;
use crate::recovery::RecoverDatabaseTask;
use crate::stats::{RecoverStats, TaskStats};

/// External systems the handler talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Metadata catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Object store holding the partition data.
    pub object_store: Arc<dyn ObjectStore>,
    /// Queue receiving continuations.
    pub queue: Arc<dyn MessageQueue>,
}

/// Request to reconcile a database's partitions with their table schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Database to sync.
    pub database: String,
    /// Restricts the run to tables whose names start with this prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Computes the diff without writing.
    #[serde(default)]
    pub dry_run: bool,
    /// Worker count; the configured default when absent.
    #[serde(default)]
    pub num_workers: Option<usize>,
}

/// Request to register partitions that have data but no catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    /// Database to recover.
    pub database: String,
    /// Window start; each table's creation time when absent.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Window end; the current time when absent.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Restricts the run to tables whose names start with this prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Probes without creating partitions.
    #[serde(default)]
    pub dry_run: bool,
    /// Worker count; the configured default when absent.
    #[serde(default)]
    pub num_workers: Option<usize>,
}

/// Result of one handler invocation.
#[derive(Debug)]
pub struct HandlerOutcome {
    /// Trace shared by every invocation of the job.
    pub trace_id: TraceId,
    /// Stats accumulated during this invocation's chain so far.
    pub stats: TaskStats,
    /// Continuations enqueued for the remaining work. On a failed handoff,
    /// the ones that were queued before the failure.
    pub continuations: Vec<Envelope>,
    /// Terminal result. `Ok` with continuations means the job goes on.
    pub result: Result<()>,
}

impl HandlerOutcome {
    /// Returns true if the job finished without errors and nothing is left.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.result.is_ok() && self.continuations.is_empty()
    }
}

/// Runs sync and recovery jobs one bounded invocation at a time.
pub struct TaskHandler {
    engine: Engine,
    queue: Arc<dyn MessageQueue>,
    limits: Limits,
    deadline_margin: Duration,
    default_num_workers: usize,
}

impl TaskHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: Config) -> Self {
        metrics::describe_metrics();
        let limits = Limits::from_config(&config);
        let deadline_margin = config.deadline_margin;
        let default_num_workers = config.default_num_workers;
        Self {
            engine: Engine::new(collaborators.catalog, collaborators.object_store, config),
            queue: collaborators.queue,
            limits,
            deadline_margin,
            default_num_workers,
        }
    }

    /// Creates a handler configured from the process environment.
    ///
    /// Installs logging in the configured format.
    ///
    /// # Errors
    ///
    /// Returns `Error::Core` if a variable holds an invalid value.
    pub fn from_env(collaborators: Collaborators) -> Result<Self> {
        Self::from_lookup(collaborators, |name| std::env::var(name).ok())
    }

    /// Creates a handler configured from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Core` if a variable holds an invalid value.
    pub fn from_lookup(
        collaborators: Collaborators,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let config = Config::from_lookup(lookup)?;
        init_logging(config.log_format);
        if collaborators.queue.queue_name() != config.queue_name {
            warn!(
                configured = %config.queue_name,
                actual = collaborators.queue.queue_name(),
                "continuation queue differs from the configured one"
            );
        }
        info!(
            event_database = %config.event_database,
            margin_secs = config.deadline_margin.as_secs(),
            "task handler configured"
        );
        Ok(Self::new(collaborators, config))
    }

    /// Returns the engine tasks run against.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Starts a new sync job.
    pub async fn start_sync(&self, request: SyncRequest, deadline: Option<Instant>) -> HandlerOutcome {
        let task = SyncDatabaseTask::new(request.database)
            .with_name_prefix(request.name_prefix)
            .with_dry_run(request.dry_run)
            .with_num_workers(request.num_workers.unwrap_or(self.default_num_workers));
        let envelope = Envelope::new(TraceId::generate(), TaskState::SyncDatabase(task));
        self.execute(envelope, deadline).await
    }

    /// Starts a new recovery job.
    ///
    /// A window whose start is after its end is rejected before any work.
    pub async fn start_recover(
        &self,
        request: RecoverRequest,
        deadline: Option<Instant>,
    ) -> HandlerOutcome {
        let trace_id = TraceId::generate();
        if let (Some(start), Some(end)) = (request.start, request.end) {
            if start > end {
                return HandlerOutcome {
                    trace_id,
                    stats: TaskStats::Recover(RecoverStats::default()),
                    continuations: Vec::new(),
                    result: Err(Error::validation(format!(
                        "recovery window start {start} is after end {end}"
                    ))),
                };
            }
        }

        let task = RecoverDatabaseTask::new(request.database)
            .with_name_prefix(request.name_prefix)
            .with_range(request.start, request.end)
            .with_dry_run(request.dry_run)
            .with_num_workers(request.num_workers.unwrap_or(self.default_num_workers));
        let envelope = Envelope::new(trace_id, TaskState::RecoverDatabase(task));
        self.execute(envelope, deadline).await
    }

    /// Resumes a task delivered by the queue.
    pub async fn continue_task(&self, envelope: Envelope, deadline: Option<Instant>) -> HandlerOutcome {
        self.execute(envelope, deadline).await
    }

    /// Decodes a queue message body and resumes the task it carries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the body is not an envelope.
    pub async fn continue_message(
        &self,
        body: &[u8],
        deadline: Option<Instant>,
    ) -> Result<HandlerOutcome> {
        let envelope = Envelope::from_slice(body)?;
        Ok(self.execute(envelope, deadline).await)
    }

    /// Working deadline: the invocation deadline minus the safety margin.
    ///
    /// An invocation with less time left than the margin runs unbounded
    /// rather than stopping before it starts.
    fn working_deadline(&self, deadline: Option<Instant>) -> Option<Instant> {
        let deadline = deadline?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < self.deadline_margin {
            warn!(
                remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                "invocation deadline is inside the safety margin; running without one"
            );
            return None;
        }
        Some(deadline - self.deadline_margin)
    }

    async fn execute(&self, envelope: Envelope, deadline: Option<Instant>) -> HandlerOutcome {
        let span = task_span(
            envelope.task.kind(),
            envelope.task.database(),
            &envelope.trace_id.to_string(),
        );
        self.execute_in_span(envelope, deadline).instrument(span).await
    }

    async fn execute_in_span(&self, envelope: Envelope, deadline: Option<Instant>) -> HandlerOutcome {
        let timer = TaskTimer::start(envelope.task.kind());
        let ctx = TaskContext::new(self.working_deadline(deadline));
        info!(
            call_count = envelope.call_count,
            no_progress_count = envelope.no_progress_count,
            task = %envelope.task.key(),
            "running task"
        );

        let mut state = envelope.task.clone();
        let result = state.run(&self.engine, &ctx).await;
        let stats = state.stats();

        let (continuations, result, outcome) = match result {
            Ok(()) => (Vec::new(), Ok(()), "completed"),
            Err(e) if e.is_retryable() => match self.hand_off(&envelope, state).await {
                (submitted, Ok(())) => (submitted, Ok(()), "continued"),
                (submitted, Err(e)) => {
                    error!(
                        error = %e,
                        submitted = submitted.len(),
                        "task could not be continued"
                    );
                    (submitted, Err(e), "failed")
                }
            },
            Err(e) => {
                error!(error = %e, "task failed");
                (Vec::new(), Err(e), "failed")
            }
        };
        timer.finish(outcome);

        HandlerOutcome {
            trace_id: envelope.trace_id,
            stats,
            continuations,
            result,
        }
    }

    /// Advances every unfinished state and enqueues it.
    ///
    /// Returns the envelopes actually submitted. Nothing is submitted when a
    /// guard refuses any state; a failed enqueue stops the remaining
    /// submissions but the ones already queued stay live.
    ///
    /// Enqueueing runs outside the task context: the working deadline has
    /// passed by now and the submission must still go out.
    async fn hand_off(&self, prev: &Envelope, state: TaskState) -> (Vec<Envelope>, Result<()>) {
        let mut envelopes = Vec::new();
        for next in state.into_continuations() {
            match advance(prev, next, &self.limits) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    metrics::record_continuation(false);
                    return (Vec::new(), Err(e));
                }
            }
        }

        let mut submitted = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            if let Err(e) = self.submit(&envelope).await {
                return (submitted, Err(e));
            }
            submitted.push(envelope);
        }
        (submitted, Ok(()))
    }

    async fn submit(&self, envelope: &Envelope) -> Result<()> {
        let message = envelope.to_message()?;
        let enqueued = self.queue.enqueue(message, EnqueueOptions::default()).await?;
        metrics::record_continuation(true);
        info!(
            queue = self.queue.queue_name(),
            message_id = enqueued.message_id(),
            call_count = envelope.call_count,
            task = %envelope.task.key(),
            "continuation submitted"
        );
        Ok(())
    }
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandler")
            .field("engine", &self.engine)
            .field("queue", &self.queue.queue_name())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_core::memory::{InMemoryQueue, MemoryCatalog, MemoryObjectStore};
    use tidemark_core::observability::LogFormat;

    fn collaborators() -> Collaborators {
        Collaborators {
            catalog: Arc::new(MemoryCatalog::new()),
            object_store: Arc::new(MemoryObjectStore::new()),
            queue: Arc::new(InMemoryQueue::new("tidemark-tasks")),
        }
    }

    #[test]
    fn from_lookup_applies_variables() {
        let handler = TaskHandler::from_lookup(collaborators(), |name| match name {
            "TIDEMARK_LOG_FORMAT" => Some("json".into()),
            "TIDEMARK_MAX_NO_PROGRESS" => Some("2".into()),
            "TIDEMARK_DEADLINE_MARGIN_SECS" => Some("30".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(handler.limits.max_no_progress, 2);
        assert_eq!(handler.deadline_margin, Duration::from_secs(30));
        assert_eq!(handler.engine().config().log_format, LogFormat::Json);
    }

    #[test]
    fn from_lookup_rejects_invalid_values() {
        let err = TaskHandler::from_lookup(collaborators(), |name| {
            (name == "TIDEMARK_MAX_CONTINUATIONS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Core(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_inside_margin_is_dropped() {
        let handler = TaskHandler::new(collaborators(), Config::default());
        let now = Instant::now();
        assert_eq!(handler.working_deadline(None), None);
        assert_eq!(handler.working_deadline(Some(now + Duration::from_secs(59))), None);
        assert_eq!(
            handler.working_deadline(Some(now + Duration::from_secs(90))),
            Some(now + Duration::from_secs(30))
        );
    }
}
