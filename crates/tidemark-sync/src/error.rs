//! Error types for the sync engine.

use tidemark_core::catalog::PartitionError;

/// The result type used throughout tidemark-sync.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by reconciliation, recovery, and the continuation protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request or the data it touched is invalid. Never retried.
    #[error("validation error: {message}")]
    Validation {
        /// Description of what is invalid.
        message: String,
    },

    /// The table does not exist.
    #[error("table not found: {database}.{table}")]
    TableNotFound {
        /// Owning database.
        database: String,
        /// Table name.
        table: String,
    },

    /// The working deadline passed. Retried only through a continuation.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Work stopped because a sibling failed or the caller cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Some partition operations failed; the rest were applied.
    #[error("{} partition operation(s) failed, first: {}", .errors.len(), first_error(.errors))]
    PartialFailure {
        /// Every per-item failure, in the order observed.
        errors: Vec<PartitionError>,
    },

    /// A continuation guard limit was exceeded.
    #[error("retry budget exceeded: {message} (calls: {call_count}, without progress: {no_progress_count})")]
    RetryBudgetExceeded {
        /// Which limit was exceeded.
        message: String,
        /// Continuations issued so far, including the rejected one.
        call_count: u32,
        /// Continuations whose cursor did not advance, including the rejected one.
        no_progress_count: u32,
    },

    /// A continuation message could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A worker task failed unexpectedly.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// A collaborator call failed.
    #[error(transparent)]
    Core(#[from] tidemark_core::Error),
}

fn first_error(errors: &[PartitionError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true if the working deadline passed.
    #[must_use]
    pub const fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Returns true if the continuation protocol should resubmit the work.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_deadline_exceeded()
    }

    /// Returns true for sibling-induced cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Cancelled => 0,
            Self::PartialFailure { .. } => 1,
            Self::DeadlineExceeded => 2,
            _ => 3,
        }
    }

    /// Combines two errors from one task group into the one to report.
    ///
    /// Fatal errors win over deadline expiry, which wins over partial
    /// failures, which win over cancellation. Partial failures are
    /// concatenated.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::PartialFailure { mut errors }, Self::PartialFailure { errors: more }) => {
                errors.extend(more);
                Self::PartialFailure { errors }
            }
            (current, other) => {
                if other.rank() > current.rank() {
                    other
                } else {
                    current
                }
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
