use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use ferry_store::{
    Condition, FerryConfig, FerryResult, JobId, JobLedger, LedgerStore, LimitsConfig, RowId,
    RowStatus, RowUpdate, Tuple,
};
use serde_json::{Map, json};
use tempfile::tempdir;

fn sample_tuples(count: usize) -> Vec<Tuple> {
    (0..count)
        .map(|index| Tuple::new(format!("user:u{index}"), "viewer", format!("doc:d{index}")))
        .collect()
}

fn config_with_limits(base: &Path, limits: LimitsConfig) -> FerryConfig {
    let mut config = FerryConfig::default_sqlite(base.join("ferry.sqlite").to_string_lossy());
    config.limits = Some(limits);
    config
}

async fn open(base: &Path) -> FerryResult<LedgerStore> {
    LedgerStore::connect_sqlite(&base.join("ferry.sqlite")).await
}

#[tokio::test]
async fn create_job_persists_pending_rows() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let mut tuples = sample_tuples(3);
    let mut context = Map::new();
    context.insert("ip".to_string(), json!("10.0.0.1"));
    tuples[1] = tuples[1]
        .clone()
        .with_condition(Condition::new("in_office").with_context(context));

    let job_id = ledger.create_job("store-a", tuples.clone()).await?;
    let progress = ledger.job_progress(job_id).await?;
    assert_eq!(progress.pending, 3);
    assert_eq!(progress.terminal(), 0);
    assert_eq!(ledger.get_total_and_remaining_tuples(job_id).await?, (3, 0));

    let rows = ledger.list_rows(job_id, None, 10).await?;
    assert_eq!(rows.len(), 3);
    assert!(rows.windows(2).all(|pair| pair[0].row_id < pair[1].row_id));
    assert!(rows.iter().all(|row| row.status == RowStatus::Pending));
    assert!(rows.iter().all(|row| row.imported_at.is_none()));
    assert_eq!(rows[1].tuple, tuples[1]);
    assert_eq!(rows[0].store_id, "store-a");
    Ok(())
}

#[tokio::test]
async fn create_job_rejects_empty_input() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let empty = ledger.create_job("store-a", Vec::new()).await;
    assert_eq!(empty.unwrap_err().code(), "validation");
    let no_store = ledger.create_job("  ", sample_tuples(1)).await;
    assert_eq!(no_store.unwrap_err().code(), "validation");
    let malformed = ledger
        .create_job("store-a", vec![Tuple::new("anne", "viewer", "doc:1")])
        .await;
    assert_eq!(malformed.unwrap_err().code(), "validation");
    assert!(ledger.list_jobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_create_leaves_no_partial_job() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let mut config = config_with_limits(
        base,
        LimitsConfig {
            max_create_batch: Some(2),
            claim_lease_ms: None,
        },
    );
    config.failpoints = Some(vec!["ledger.create_job.chunk".to_string()]);
    let ledger = LedgerStore::connect(&config, base).await?;
    let result = ledger.create_job("store-a", sample_tuples(5)).await;
    assert_eq!(result.unwrap_err().code(), "storage");
    assert!(ledger.list_jobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn claims_rows_in_row_order_without_redelivery() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let job_id = ledger.create_job("store-a", sample_tuples(5)).await?;

    let first = ledger.get_remaining_tuples(job_id, 2).await?;
    let second = ledger.get_remaining_tuples(job_id, 2).await?;
    let third = ledger.get_remaining_tuples(job_id, 2).await?;
    let fourth = ledger.get_remaining_tuples(job_id, 2).await?;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(third.len(), 1);
    assert!(fourth.is_empty());
    assert!(first[1].row_id < second[0].row_id);
    assert!(second[1].row_id < third[0].row_id);
    assert_eq!(first[0].tuple.user, "user:u0");
    assert!(first.iter().all(|row| row.status == RowStatus::Claimed));

    // Claimed rows still count as outstanding work.
    let progress = ledger.job_progress(job_id).await?;
    assert_eq!(progress.pending, 5);
    assert!(ledger.get_remaining_tuples(job_id, 0).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn status_updates_are_idempotent_and_guarded() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let job_id = ledger.create_job("store-a", sample_tuples(3)).await?;
    let rows = ledger.get_remaining_tuples(job_id, 3).await?;

    ledger
        .update_statuses(vec![
            RowUpdate::inserted(rows[0].row_id),
            RowUpdate::failed(rows[1].row_id, "cannot write a tuple which already exists"),
        ])
        .await?;
    ledger
        .update_status(rows[0].row_id, RowStatus::Inserted, None)
        .await?;

    let conflict = ledger
        .update_status(rows[0].row_id, RowStatus::Failed, Some("late".to_string()))
        .await;
    assert_eq!(conflict.unwrap_err().code(), "conflict");
    let back_to_pending = ledger
        .update_status(rows[2].row_id, RowStatus::Pending, None)
        .await;
    assert_eq!(back_to_pending.unwrap_err().code(), "validation");
    let missing = ledger
        .update_status(RowId(9_999), RowStatus::Inserted, None)
        .await;
    assert_eq!(missing.unwrap_err().code(), "not_found");

    let inserted = ledger
        .list_rows(job_id, Some(RowStatus::Inserted), 10)
        .await?;
    assert_eq!(inserted.len(), 1);
    assert!(inserted[0].imported_at.is_some());
    let failed = ledger.list_rows(job_id, Some(RowStatus::Failed), 10).await?;
    assert_eq!(
        failed[0].reason.as_deref(),
        Some("cannot write a tuple which already exists")
    );

    let progress = ledger.job_progress(job_id).await?;
    assert_eq!((progress.pending, progress.inserted, progress.failed), (1, 1, 1));
    Ok(())
}

#[tokio::test]
async fn expired_claims_are_recovered_after_reopen() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let config = config_with_limits(
        base,
        LimitsConfig {
            max_create_batch: None,
            claim_lease_ms: Some(0),
        },
    );
    let job_id = {
        let ledger = LedgerStore::connect(&config, base).await?;
        let job_id = ledger.create_job("store-a", sample_tuples(4)).await?;
        let claimed = ledger.get_remaining_tuples(job_id, 2).await?;
        ledger
            .update_statuses(vec![RowUpdate::inserted(claimed[0].row_id)])
            .await?;
        job_id
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reopened = LedgerStore::connect(&config, base).await?;
    let resumed = reopened.get_remaining_tuples(job_id, 10).await?;
    let users: Vec<&str> = resumed.iter().map(|row| row.tuple.user.as_str()).collect();
    assert_eq!(users, vec!["user:u1", "user:u2", "user:u3"]);
    let progress = reopened.job_progress(job_id).await?;
    assert_eq!(progress.inserted, 1);
    assert_eq!(progress.pending, 3);
    Ok(())
}

#[tokio::test]
async fn renewed_claims_outlast_their_original_lease() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let config = config_with_limits(
        base,
        LimitsConfig {
            max_create_batch: None,
            claim_lease_ms: Some(200),
        },
    );
    let ledger = LedgerStore::connect(&config, base).await?;
    assert_eq!(ledger.claim_lease(), Duration::from_millis(200));
    let job_id = ledger.create_job("store-a", sample_tuples(2)).await?;
    let claimed = ledger.get_remaining_tuples(job_id, 2).await?;
    let row_ids: Vec<RowId> = claimed.iter().map(|row| row.row_id).collect();
    ledger
        .update_statuses(vec![RowUpdate::inserted(row_ids[1])])
        .await?;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(ledger.renew_claims(&row_ids).await?, 1);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(ledger.get_remaining_tuples(job_id, 2).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let reclaimed = ledger.get_remaining_tuples(job_id, 2).await?;
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].row_id, row_ids[0]);
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_overlap() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let job_id = ledger.create_job("store-a", sample_tuples(40)).await?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let rows = ledger.get_remaining_tuples(job_id, 3).await?;
                if rows.is_empty() {
                    break;
                }
                let updates = rows.iter().map(|row| RowUpdate::inserted(row.row_id)).collect();
                seen.extend(rows.iter().map(|row| row.row_id));
                ledger.update_statuses(updates).await?;
            }
            FerryResult::Ok(seen)
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("join")?);
    }
    let unique: HashSet<RowId> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);
    assert!(ledger.job_progress(job_id).await?.is_complete());
    Ok(())
}

#[tokio::test]
async fn retry_resets_only_failed_rows() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let job_id = ledger.create_job("store-a", sample_tuples(3)).await?;
    let rows = ledger.get_remaining_tuples(job_id, 3).await?;
    ledger
        .update_statuses(vec![
            RowUpdate::inserted(rows[0].row_id),
            RowUpdate::failed(rows[1].row_id, "boom"),
            RowUpdate::failed(rows[2].row_id, "boom"),
        ])
        .await?;

    assert_eq!(ledger.retry_failed(job_id).await?, 2);
    let progress = ledger.job_progress(job_id).await?;
    assert_eq!((progress.pending, progress.inserted, progress.failed), (2, 1, 0));
    let retried = ledger.get_remaining_tuples(job_id, 10).await?;
    assert_eq!(retried.len(), 2);
    assert!(retried.iter().all(|row| row.reason.is_none()));
    assert_eq!(ledger.retry_failed(job_id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn lists_and_describes_jobs() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let ledger = open(dir.path()).await?;
    let first = ledger.create_job("store-a", sample_tuples(2)).await?;
    // Job ids only order across milliseconds.
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = ledger.create_job("store-b", sample_tuples(3)).await?;
    let rows = ledger.get_remaining_tuples(second, 1).await?;
    ledger
        .update_statuses(vec![RowUpdate::failed(rows[0].row_id, "nope")])
        .await?;

    let jobs = ledger.list_jobs().await?;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, first);
    assert_eq!(jobs[1].job_id, second);
    assert_eq!(jobs[1].store_id, "store-b");
    assert_eq!(jobs[1].progress.failed, 1);
    assert_eq!(jobs[1].progress.total(), 3);

    let summary = ledger.get_job(second).await?.expect("summary");
    assert_eq!(summary.store_id, "store-b");
    assert_eq!(summary.progress.pending, 2);
    assert!(summary.created_at > 0);

    let unknown = JobId::new();
    assert!(ledger.get_job(unknown).await?.is_none());
    assert_eq!(
        ledger.job_progress(unknown).await.unwrap_err().code(),
        "not_found"
    );
    Ok(())
}

#[tokio::test]
async fn update_failpoint_surfaces_storage_error() -> FerryResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let mut config = FerryConfig::default_sqlite(base.join("ferry.sqlite").to_string_lossy());
    config.failpoints = Some(vec!["ledger.update_statuses".to_string()]);
    let ledger = LedgerStore::connect(&config, base).await?;
    let job_id = ledger.create_job("store-a", sample_tuples(1)).await?;
    let rows = ledger.get_remaining_tuples(job_id, 1).await?;
    let err = ledger
        .update_statuses(vec![RowUpdate::inserted(rows[0].row_id)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "storage");
    Ok(())
}
