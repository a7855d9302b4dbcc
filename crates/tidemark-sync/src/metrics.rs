//! Engine metrics.
//!
//! Recorded through the `metrics` facade; the host installs whichever
//! recorder it exports with. Without a recorder every call is a no-op.

use std::sync::Once;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Metric Names
// ============================================================================

/// Partitions whose descriptor was updated by sync.
pub const PARTITIONS_SYNCED_TOTAL: &str = "tidemark_partitions_synced_total";

/// Partitions created by recovery.
pub const PARTITIONS_RECOVERED_TOTAL: &str = "tidemark_partitions_recovered_total";

/// Object-store probes, labelled `result=hit|miss`.
pub const PROBE_TOTAL: &str = "tidemark_probe_total";

/// Per-item partition failures.
pub const PARTITION_FAILURES_TOTAL: &str = "tidemark_partition_failures_total";

/// Continuation decisions, labelled `outcome=submitted|budget_exceeded`.
pub const CONTINUATIONS_TOTAL: &str = "tidemark_continuations_total";

/// Handler invocation duration, labelled by `kind` and `outcome`.
pub const TASK_DURATION: &str = "tidemark_task_duration_seconds";

static DESCRIBE: Once = Once::new();

/// Registers metric descriptions with the installed recorder.
///
/// Safe to call multiple times.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!(PARTITIONS_SYNCED_TOTAL, "Partitions updated to the table schema");
        describe_counter!(PARTITIONS_RECOVERED_TOTAL, "Partitions created by recovery");
        describe_counter!(PROBE_TOTAL, "Object-store data probes by result");
        describe_counter!(PARTITION_FAILURES_TOTAL, "Per-item partition failures");
        describe_counter!(CONTINUATIONS_TOTAL, "Continuation decisions by outcome");
        describe_histogram!(TASK_DURATION, "Duration of one task invocation in seconds");
    });
}

/// Records partition updates applied by sync.
pub fn record_synced(database: &str, count: u64) {
    counter!(PARTITIONS_SYNCED_TOTAL, "database" => database.to_string()).increment(count);
}

/// Records partitions created by recovery.
pub fn record_recovered(database: &str, count: u64) {
    counter!(PARTITIONS_RECOVERED_TOTAL, "database" => database.to_string()).increment(count);
}

/// Records one object-store probe.
pub fn record_probe(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(PROBE_TOTAL, "result" => result).increment(1);
}

/// Records per-item partition failures.
pub fn record_failures(database: &str, count: u64) {
    if count > 0 {
        counter!(PARTITION_FAILURES_TOTAL, "database" => database.to_string()).increment(count);
    }
}

/// Records a continuation decision.
pub fn record_continuation(submitted: bool) {
    let outcome = if submitted { "submitted" } else { "budget_exceeded" };
    counter!(CONTINUATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Measures one handler invocation.
pub struct TaskTimer {
    kind: &'static str,
    start: Instant,
}

impl TaskTimer {
    /// Starts timing a task of the given kind.
    #[must_use]
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }

    /// Stops the timer and records the duration under `outcome`.
    pub fn finish(self, outcome: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!(TASK_DURATION, "kind" => self.kind, "outcome" => outcome).record(duration);
        tracing::debug!(kind = self.kind, outcome, duration_secs = duration, "recorded task duration");
    }
}
