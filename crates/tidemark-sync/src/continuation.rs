//! Continuation protocol.
//!
//! A job that cannot finish before its invocation deadline is carried
//! forward as one or more [`Envelope`]s, each holding the state of an
//! unfinished task. The host re-delivers envelopes through the message queue
//! and a later invocation resumes them. The transition from one invocation
//! to the next is [`advance`], a pure function of the previous envelope and
//! the task's new state.
//!
//! Two counters bound a chain of continuations:
//!
//! - `call_count` counts every continuation and is capped by
//!   [`Limits::max_continuations`];
//! - `no_progress_count` counts continuations whose resumption cursor did
//!   not move and is capped by [`Limits::max_no_progress`].
//!
//! Neither counter ever decreases along a chain.

use serde::{Deserialize, Serialize};
use tidemark_core::config::Config;
use tidemark_core::id::TraceId;
use tidemark_core::queue::QueueMessage;

use crate::context::TaskContext;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::reconciler::{SyncDatabaseTask, SyncTableTask};
use crate::recovery::{RecoverDatabaseTask, RecoverTableTask};
use crate::stats::TaskStats;

/// State of a resumable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskState {
    /// Reconciliation of a database.
    SyncDatabase(SyncDatabaseTask),
    /// Reconciliation of one table.
    SyncTable(SyncTableTask),
    /// Recovery of a database.
    RecoverDatabase(RecoverDatabaseTask),
    /// Recovery of one table.
    RecoverTable(RecoverTableTask),
}

impl TaskState {
    /// Returns the task kind as a stable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SyncDatabase(_) => "sync_database",
            Self::SyncTable(_) => "sync_table",
            Self::RecoverDatabase(_) => "recover_database",
            Self::RecoverTable(_) => "recover_table",
        }
    }

    /// Returns the database the task works on.
    #[must_use]
    pub fn database(&self) -> &str {
        match self {
            Self::SyncDatabase(t) => &t.database,
            Self::SyncTable(t) => &t.database,
            Self::RecoverDatabase(t) => &t.database,
            Self::RecoverTable(t) => &t.database,
        }
    }

    /// Returns a key identifying the unit of work, stable across continuations.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::SyncDatabase(t) => format!(
                "{}:{}:{}",
                self.kind(),
                t.database,
                t.name_prefix.as_deref().unwrap_or("")
            ),
            Self::RecoverDatabase(t) => format!(
                "{}:{}:{}",
                self.kind(),
                t.database,
                t.name_prefix.as_deref().unwrap_or("")
            ),
            Self::SyncTable(t) => format!("{}:{}.{}", self.kind(), t.database, t.table),
            Self::RecoverTable(t) => format!("{}:{}.{}", self.kind(), t.database, t.table),
        }
    }

    /// Returns the resumption cursor.
    ///
    /// Page tokens for scans, the last processed day for table recovery. A
    /// database task whose table listing is done reports [`LISTING_DONE`].
    #[must_use]
    pub fn cursor(&self) -> Option<String> {
        match self {
            Self::SyncDatabase(t) => listing_cursor(t.completed, t.next_page.as_ref()),
            Self::SyncTable(t) => t.next_page.clone(),
            Self::RecoverDatabase(t) => listing_cursor(t.completed, t.next_page.as_ref()),
            Self::RecoverTable(t) => t.last_processed_day.map(|d| d.to_rfc3339()),
        }
    }

    /// Returns true once the task has nothing left to do.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        match self {
            Self::SyncDatabase(t) => t.completed,
            Self::SyncTable(t) => t.completed,
            Self::RecoverDatabase(t) => t.completed,
            Self::RecoverTable(t) => t.completed,
        }
    }

    /// Returns the stats accumulated by this task, including tables it handed off.
    #[must_use]
    pub fn stats(&self) -> TaskStats {
        match self {
            Self::SyncDatabase(t) => {
                let mut stats = t.stats.clone();
                for pending in &t.pending {
                    stats.merge(&pending.stats);
                }
                TaskStats::Sync(stats)
            }
            Self::SyncTable(t) => TaskStats::Sync(t.stats.clone()),
            Self::RecoverDatabase(t) => {
                let mut stats = t.stats;
                for pending in &t.pending {
                    stats.merge(&pending.stats);
                }
                TaskStats::Recover(stats)
            }
            Self::RecoverTable(t) => TaskStats::Recover(t.stats),
        }
    }

    /// Runs the task.
    ///
    /// # Errors
    ///
    /// Returns whatever the underlying task returned.
    pub async fn run(&mut self, engine: &Engine, ctx: &TaskContext) -> Result<()> {
        match self {
            Self::SyncDatabase(t) => t.run(engine, ctx).await,
            Self::SyncTable(t) => t.run(engine, ctx).await,
            Self::RecoverDatabase(t) => t.run(engine, ctx).await,
            Self::RecoverTable(t) => t.run(engine, ctx).await,
        }
    }

    /// Splits an interrupted task into the states to continue.
    ///
    /// Tables handed off by a database task become their own states; the
    /// database task itself continues only if it has tables left to list.
    #[must_use]
    pub fn into_continuations(self) -> Vec<Self> {
        match self {
            Self::SyncDatabase(mut t) => {
                let mut next: Vec<Self> = std::mem::take(&mut t.pending)
                    .into_iter()
                    .map(Self::SyncTable)
                    .collect();
                if !t.completed {
                    next.insert(0, Self::SyncDatabase(t));
                }
                next
            }
            Self::RecoverDatabase(mut t) => {
                let mut next: Vec<Self> = std::mem::take(&mut t.pending)
                    .into_iter()
                    .map(Self::RecoverTable)
                    .collect();
                // A finished listing still continues to report its failures.
                if !t.completed || !t.failures.is_empty() {
                    next.insert(0, Self::RecoverDatabase(t));
                }
                next
            }
            other if other.is_completed() => Vec::new(),
            other => vec![other],
        }
    }
}

/// Cursor of a database task whose table listing is done.
pub const LISTING_DONE: &str = "listing-done";

fn listing_cursor(completed: bool, next_page: Option<&String>) -> Option<String> {
    if completed {
        Some(LISTING_DONE.to_string())
    } else {
        next_page.cloned()
    }
}

/// A checkpointed task travelling between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Constant for every invocation of the job.
    pub trace_id: TraceId,
    /// Continuations issued so far in this chain.
    pub call_count: u32,
    /// Continuations so far whose cursor did not advance.
    pub no_progress_count: u32,
    /// The task to resume.
    pub task: TaskState,
}

impl Envelope {
    /// Wraps a new task with zeroed counters.
    #[must_use]
    pub const fn new(trace_id: TraceId, task: TaskState) -> Self {
        Self {
            trace_id,
            call_count: 0,
            no_progress_count: 0,
            task,
        }
    }

    /// Returns `{trace_id}-{call_count}-{task_key}`, unique per continuation.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}-{}", self.trace_id, self.call_count, self.task.key())
    }

    /// Encodes the envelope as a queue message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_message(&self) -> Result<QueueMessage> {
        let body = serde_json::to_vec(self)?;
        Ok(QueueMessage::new(self.idempotency_key(), body))
    }

    /// Decodes an envelope from a queue message body.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the body is not a valid envelope.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Guard limits on a continuation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum continuations in one chain.
    pub max_continuations: u32,
    /// Continuations without progress at which the chain is abandoned.
    pub max_no_progress: u32,
}

impl Limits {
    /// Reads the limits from the configuration.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            max_continuations: config.max_continuations,
            max_no_progress: config.max_no_progress,
        }
    }
}

/// Builds the envelope that continues `next` after `prev`'s invocation.
///
/// A state is counted as progress when its cursor moved or when it is a
/// different unit of work than `prev` (a table split off a database task).
///
/// # Errors
///
/// Returns `Error::RetryBudgetExceeded` if the chain would exceed
/// `max_continuations` continuations or reach `max_no_progress`
/// continuations without progress.
pub fn advance(prev: &Envelope, next: TaskState, limits: &Limits) -> Result<Envelope> {
    let call_count = prev.call_count.saturating_add(1);
    let progressed = prev.task.key() != next.key() || prev.task.cursor() != next.cursor();
    let no_progress_count = if progressed {
        prev.no_progress_count
    } else {
        prev.no_progress_count.saturating_add(1)
    };

    if call_count > limits.max_continuations {
        return Err(Error::RetryBudgetExceeded {
            message: format!(
                "{} would exceed the limit of {} continuations",
                next.key(),
                limits.max_continuations
            ),
            call_count,
            no_progress_count,
        });
    }
    if no_progress_count >= limits.max_no_progress {
        return Err(Error::RetryBudgetExceeded {
            message: format!(
                "{} made no progress in {} continuations (limit {})",
                next.key(),
                no_progress_count,
                limits.max_no_progress
            ),
            call_count,
            no_progress_count,
        });
    }

    Ok(Envelope {
        trace_id: prev.trace_id,
        call_count,
        no_progress_count,
        task: next,
    })
}
