//! End-to-end schema reconciliation through the handler.

mod common;

use common::{Harness, at, fresh_partition, stale_partition, table};
use tidemark_core::config::Config;
use tidemark_sync::handler::SyncRequest;
use tidemark_sync::stats::SyncStats;

fn request(database: &str) -> SyncRequest {
    SyncRequest {
        database: database.into(),
        num_workers: Some(3),
        ..SyncRequest::default()
    }
}

fn sync_stats(outcome: &tidemark_sync::handler::HandlerOutcome) -> SyncStats {
    outcome.stats.as_sync().cloned().unwrap()
}

#[tokio::test]
async fn sync_converges_and_is_idempotent() {
    let h = Harness::new(Config::default());
    for name in ["aws_cloudtrail", "aws_vpcflow"] {
        let t = table("logs", name, at(1, 0));
        h.catalog.put_table(t.clone()).unwrap();
        for hour in 0..4 {
            h.catalog.put_partition("logs", name, stale_partition(&t, at(1, hour))).unwrap();
        }
        h.catalog.put_partition("logs", name, fresh_partition(&t, at(1, 4))).unwrap();
    }

    let first = h.handler.start_sync(request("logs"), None).await;
    assert!(first.is_complete(), "{:?}", first.result);
    let stats = sync_stats(&first);
    assert_eq!(stats.partitions_observed, 10);
    assert_eq!(stats.diff_count, 8);
    assert_eq!(stats.synced_count, 8);
    assert_eq!(stats.min_time, Some(at(1, 0)));
    assert_eq!(stats.max_time, Some(at(1, 4)));

    for name in ["aws_cloudtrail", "aws_vpcflow"] {
        let t = table("logs", name, at(1, 0));
        for p in h.catalog.partitions("logs", name).unwrap() {
            assert_eq!(p.storage.columns, t.storage.columns);
        }
    }

    let second = h.handler.start_sync(request("logs"), None).await;
    assert!(second.is_complete());
    let stats = sync_stats(&second);
    assert_eq!(stats.partitions_observed, 10);
    assert_eq!(stats.diff_count, 0);
    assert_eq!(stats.synced_count, 0);
    assert_eq!(h.catalog.updated_keys().unwrap().len(), 8);
    assert!(h.queue.is_empty().unwrap());
}

#[tokio::test]
async fn dry_run_reports_drift_without_writing() {
    let h = Harness::new(Config::default());
    let t = table("logs", "okta_systemlog", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.catalog.put_partition("logs", "okta_systemlog", stale_partition(&t, at(1, 0))).unwrap();

    let outcome = h
        .handler
        .start_sync(
            SyncRequest {
                dry_run: true,
                ..request("logs")
            },
            None,
        )
        .await;
    assert!(outcome.is_complete());
    assert_eq!(sync_stats(&outcome).diff_count, 1);
    assert_eq!(sync_stats(&outcome).synced_count, 0);
    assert!(h.catalog.updated_keys().unwrap().is_empty());
}

#[tokio::test]
async fn name_prefix_limits_the_tables_synced() {
    let h = Harness::new(Config::default());
    for name in ["aws_s3", "gcp_audit"] {
        let t = table("logs", name, at(1, 0));
        h.catalog.put_table(t.clone()).unwrap();
        h.catalog.put_partition("logs", name, stale_partition(&t, at(1, 0))).unwrap();
    }

    let outcome = h
        .handler
        .start_sync(
            SyncRequest {
                name_prefix: Some("aws_".into()),
                ..request("logs")
            },
            None,
        )
        .await;
    assert!(outcome.is_complete());
    assert_eq!(sync_stats(&outcome).synced_count, 1);
    assert_eq!(h.catalog.updated_keys().unwrap(), [vec!["2020", "01", "01", "00"]]);
}

#[tokio::test]
async fn derived_tables_skip_partitions_before_creation() {
    let h = Harness::new(Config::default());
    let t = table("rules", "brute_force", at(2, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.catalog.put_partition("rules", "brute_force", stale_partition(&t, at(1, 23))).unwrap();
    h.catalog.put_partition("rules", "brute_force", stale_partition(&t, at(2, 0))).unwrap();

    let outcome = h.handler.start_sync(request("rules"), None).await;
    assert!(outcome.is_complete());
    assert_eq!(sync_stats(&outcome).partitions_observed, 1);
    assert_eq!(h.catalog.updated_keys().unwrap(), [vec!["2020", "01", "02", "00"]]);
}

#[tokio::test]
async fn failed_update_stops_the_job() {
    let h = Harness::new(Config::default());
    let t = table("logs", "events", at(1, 0));
    h.catalog.put_table(t.clone()).unwrap();
    h.catalog.put_partition("logs", "events", stale_partition(&t, at(1, 0))).unwrap();
    h.catalog
        .fail_update(t.bin.to_key(at(1, 0)))
        .unwrap();

    let outcome = h.handler.start_sync(request("logs"), None).await;
    assert!(outcome.result.is_err());
    assert!(outcome.continuations.is_empty());
    assert!(h.queue.is_empty().unwrap());
}
