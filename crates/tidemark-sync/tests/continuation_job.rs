//! Deadline handoff and resumption across handler invocations.

mod common;

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Harness, at, stale_partition, table};
use tidemark_core::catalog::PartitionErrorCode;
use tidemark_core::config::Config;
use tidemark_core::id::TraceId;
use tidemark_core::memory::{InMemoryQueue, MemoryCatalog, MemoryObjectStore};
use tidemark_sync::continuation::{Envelope, TaskState};
use tidemark_sync::error::Error;
use tidemark_sync::handler::SyncRequest;
use tidemark_sync::reconciler::SyncTableTask;
use tidemark_sync::recovery::{RecoverTableTask, RecoveryWindow};
use tokio::time::Instant;

const LIST_LATENCY: Duration = Duration::from_secs(10);
const STORE_LATENCY: Duration = Duration::from_secs(1);

fn sync_request() -> SyncRequest {
    SyncRequest {
        database: "logs".into(),
        num_workers: Some(1),
        ..SyncRequest::default()
    }
}

fn slow_harness(config: Config) -> Harness {
    Harness::with_catalog(MemoryCatalog::new().with_list_latency(LIST_LATENCY), config)
}

fn slow_store_harness() -> Harness {
    Harness::with_store(
        MemoryObjectStore::new().with_list_latency(STORE_LATENCY),
        Config::default(),
    )
}

fn recover_envelope(start: DateTime<Utc>, end: DateTime<Utc>, num_workers: usize) -> Envelope {
    let task = RecoverTableTask::new("logs", "events")
        .with_range(Some(start), Some(end))
        .with_num_workers(num_workers);
    Envelope::new(TraceId::generate(), TaskState::RecoverTable(task))
}

fn updated_hours(h: &Harness) -> Vec<String> {
    h.catalog
        .updated_keys()
        .unwrap()
        .into_iter()
        .map(|key| key[3].clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn interrupted_sync_resumes_after_the_last_completed_page() {
    let h = slow_harness(Config {
        partition_page_size: 2,
        ..Config::default()
    });
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    for hour in 0..6 {
        h.catalog.put_partition("logs", "events", stale_partition(&t, at(1, hour))).unwrap();
    }

    // 75s minus the 60s margin leaves 15s: one 10s page fits, the next does not.
    let deadline = Instant::now() + Duration::from_secs(75);
    let first = h.handler.start_sync(sync_request(), Some(deadline)).await;
    assert!(first.result.is_ok(), "{:?}", first.result);
    assert_eq!(first.continuations.len(), 1);
    let continuation = &first.continuations[0];
    assert_eq!(continuation.call_count, 1);
    assert_eq!(continuation.no_progress_count, 0);
    assert_eq!(continuation.task.kind(), "sync_table");
    assert_eq!(updated_hours(&h), ["00", "01"]);
    assert_eq!(first.stats.as_sync().unwrap().synced_count, 2);

    let entry = h.queue.take().unwrap().unwrap();
    assert_eq!(entry.message.idempotency_key, continuation.idempotency_key());
    let second = h
        .handler
        .continue_message(&entry.message.body, None)
        .await
        .unwrap();
    assert!(second.is_complete(), "{:?}", second.result);
    assert_eq!(second.trace_id, first.trace_id);
    assert_eq!(updated_hours(&h), ["00", "01", "02", "03", "04", "05"]);

    let stats = second.stats.as_sync().unwrap();
    assert_eq!(stats.pages_scanned, 3);
    assert_eq!(stats.synced_count, 6);
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn stalled_task_is_abandoned_by_the_no_progress_guard() {
    let h = slow_harness(Config {
        max_no_progress: 3,
        ..Config::default()
    });
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.catalog.put_partition("logs", "events", stale_partition(&t, at(1, 0))).unwrap();

    // 5s of working time never fits a 10s listing.
    let deadline = || Some(Instant::now() + Duration::from_secs(65));
    let mut outcome = h.handler.start_sync(sync_request(), deadline()).await;
    let mut invocations = 1;
    while outcome.result.is_ok() && !outcome.continuations.is_empty() {
        let entry = h.queue.take().unwrap().unwrap();
        outcome = h
            .handler
            .continue_message(&entry.message.body, deadline())
            .await
            .unwrap();
        invocations += 1;
    }

    assert_eq!(invocations, 4);
    assert!(
        matches!(
            outcome.result,
            Err(Error::RetryBudgetExceeded {
                call_count: 4,
                no_progress_count: 3,
                ..
            })
        ),
        "{:?}",
        outcome.result
    );
    assert!(h.queue.is_empty().unwrap());
    assert!(h.catalog.updated_keys().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn redelivered_envelope_enqueues_one_continuation() {
    let h = slow_harness(Config::default());
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();

    let envelope = Envelope::new(
        TraceId::generate(),
        TaskState::SyncTable(SyncTableTask::new("logs", "events")),
    );
    for _ in 0..2 {
        let deadline = Instant::now() + Duration::from_secs(65);
        let outcome = h.handler.continue_task(envelope.clone(), Some(deadline)).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.continuations.len(), 1);
    }
    assert_eq!(h.queue.len().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_inside_the_margin_runs_unbounded() {
    let h = slow_harness(Config::default());
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.catalog.put_partition("logs", "events", stale_partition(&t, at(1, 0))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let outcome = h.handler.start_sync(sync_request(), Some(deadline)).await;
    assert!(outcome.is_complete(), "{:?}", outcome.result);
    assert_eq!(updated_hours(&h), ["00"]);
}

#[tokio::test]
async fn recovery_resumes_after_the_last_processed_day() {
    let h = Harness::new(Config::default());
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.put_data(&t, at(1, 3), 64);
    h.put_data(&t, at(2, 4), 64);

    let mut task = RecoverTableTask::new("logs", "events")
        .with_range(Some(at(1, 0)), Some(at(3, 0)))
        .with_num_workers(1);
    task.window =
        Some(RecoveryWindow::compute(&t, task.start, task.end, false, Utc::now()).unwrap());
    task.last_processed_day = Some(at(1, 0));

    let envelope = Envelope::new(TraceId::generate(), TaskState::RecoverTable(task));
    let outcome = h.handler.continue_task(envelope, None).await;
    assert!(outcome.is_complete(), "{:?}", outcome.result);
    let stats = outcome.stats.as_recover().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 23);
    assert_eq!(h.partition_keys(&t), ["2020/01/02/04"]);
}

#[tokio::test(start_paused = true)]
async fn resumed_recovery_counts_each_day_once() {
    let h = slow_store_harness();
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.put_data(&t, at(1, 0), 64);
    h.catalog
        .fail_create(t.bin.to_key(at(1, 0)), PartitionErrorCode::Internal)
        .unwrap();

    // 30s of working time: day 1 takes 24 one-second listings, day 2 is cut short.
    let deadline = Instant::now() + Duration::from_secs(90);
    let first = h
        .handler
        .continue_task(recover_envelope(at(1, 0), at(4, 0), 1), Some(deadline))
        .await;
    assert!(first.result.is_ok(), "{:?}", first.result);
    assert_eq!(first.continuations.len(), 1);
    let stats = first.stats.as_recover().unwrap();
    assert_eq!((stats.hits, stats.misses, stats.failed), (1, 23, 1));

    let entry = h.queue.take().unwrap().unwrap();
    let second = h
        .handler
        .continue_message(&entry.message.body, None)
        .await
        .unwrap();
    let Err(Error::PartialFailure { errors }) = &second.result else {
        panic!("expected a partial failure, got {:?}", second.result);
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].values, t.bin.to_key(at(1, 0)));

    let stats = second.stats.as_recover().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 71);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.recovered, 0);
    assert!(second.continuations.is_empty());
    assert!(h.partition_keys(&t).is_empty());
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn item_failures_survive_a_deadline_after_a_clean_day() {
    let h = slow_store_harness();
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.put_data(&t, at(1, 0), 64);
    h.put_data(&t, at(2, 3), 64);
    h.catalog
        .fail_create(t.bin.to_key(at(1, 0)), PartitionErrorCode::Internal)
        .unwrap();

    // 60s of working time: days 1 and 2 complete, day 3 is cut short.
    let deadline = Instant::now() + Duration::from_secs(120);
    let first = h
        .handler
        .continue_task(recover_envelope(at(1, 0), at(4, 0), 1), Some(deadline))
        .await;
    assert!(first.result.is_ok(), "{:?}", first.result);
    let TaskState::RecoverTable(task) = &first.continuations[0].task else {
        panic!("expected a table continuation");
    };
    assert_eq!(task.last_processed_day, Some(at(2, 0)));
    assert_eq!(task.failures.len(), 1);

    let entry = h.queue.take().unwrap().unwrap();
    let second = h
        .handler
        .continue_message(&entry.message.body, None)
        .await
        .unwrap();
    assert!(
        matches!(&second.result, Err(Error::PartialFailure { errors }) if errors.len() == 1),
        "{:?}",
        second.result
    );
    let stats = second.stats.as_recover().unwrap();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 70);
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.partition_keys(&t), ["2020/01/02/03"]);
}

#[tokio::test(start_paused = true)]
async fn parallel_recovery_resumes_after_the_latest_completed_day() {
    let h = slow_store_harness();
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.put_data(&t, at(1, 5), 64);
    h.put_data(&t, at(3, 7), 64);
    h.put_data(&t, at(4, 1), 64);

    // Two workers finish days 1 and 2 together at 24s; days 3 and 4 are
    // still being listed when the 30s working window closes.
    let deadline = Instant::now() + Duration::from_secs(90);
    let first = h
        .handler
        .continue_task(recover_envelope(at(1, 0), at(5, 0), 2), Some(deadline))
        .await;
    assert!(first.result.is_ok(), "{:?}", first.result);
    let TaskState::RecoverTable(task) = &first.continuations[0].task else {
        panic!("expected a table continuation");
    };
    assert_eq!(task.last_processed_day, Some(at(2, 0)));
    assert_eq!(task.stats.hits, 1);
    assert_eq!(task.stats.misses, 47);
    assert_eq!(h.partition_keys(&t), ["2020/01/01/05"]);

    let entry = h.queue.take().unwrap().unwrap();
    let second = h
        .handler
        .continue_message(&entry.message.body, None)
        .await
        .unwrap();
    assert!(second.is_complete(), "{:?}", second.result);
    let stats = second.stats.as_recover().unwrap();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 93);
    assert_eq!(stats.recovered, 3);
    assert_eq!(
        h.partition_keys(&t),
        ["2020/01/01/05", "2020/01/03/07", "2020/01/04/01"]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_handoff_reports_the_continuations_already_queued() {
    let config = Config::default();
    let queue = InMemoryQueue::with_capacity(config.queue_name.clone(), 1);
    let h = Harness::from_parts(
        MemoryCatalog::new().with_list_latency(LIST_LATENCY),
        MemoryObjectStore::new(),
        queue,
        config,
    );
    for name in ["a", "b"] {
        let t = table("logs", name, at(1, 0));
        h.catalog.put_table(t.clone()).unwrap();
        h.catalog.put_partition("logs", name, stale_partition(&t, at(1, 0))).unwrap();
    }

    // Both tables are interrupted mid-listing; only one continuation fits.
    let deadline = Instant::now() + Duration::from_secs(65);
    let request = SyncRequest {
        num_workers: Some(2),
        ..sync_request()
    };
    let outcome = h.handler.start_sync(request, Some(deadline)).await;
    assert!(
        matches!(
            outcome.result,
            Err(Error::Core(tidemark_core::Error::Queue { .. }))
        ),
        "{:?}",
        outcome.result
    );
    assert_eq!(outcome.continuations.len(), 1);
    assert_eq!(outcome.continuations[0].task.kind(), "sync_table");

    let entry = h.queue.take().unwrap().unwrap();
    assert_eq!(
        entry.message.idempotency_key,
        outcome.continuations[0].idempotency_key()
    );
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn object_store_failure_is_not_handed_off() {
    let h = slow_store_harness();
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.store
        .fail_prefix("s3://data-lake/logs/events/year=2020/month=01/day=02/")
        .unwrap();

    let outcome = h
        .handler
        .continue_task(recover_envelope(at(1, 0), at(3, 0), 1), None)
        .await;
    assert!(
        matches!(
            outcome.result,
            Err(Error::Core(tidemark_core::Error::ObjectStore { .. }))
        ),
        "{:?}",
        outcome.result
    );
    assert!(outcome.continuations.is_empty());
    assert_eq!(outcome.stats.as_recover().unwrap().misses, 24);
    assert!(h.queue.is_empty().unwrap());
}
