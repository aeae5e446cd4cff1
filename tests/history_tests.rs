mod common;

use chrono::{DateTime, Duration, Utc};
use cloud_offload::{
    db,
    models::{event::StorageKind, remote::RemoteFile, task::TaskStatus, task::UploadTask},
    services::history_service::{HistoryError, HistoryReconciler, Reconcile, ReconcileOutcome},
};
use common::task;
use sqlx::SqlitePool;
use std::sync::Arc;

const PATH: &str = "/media/movies/Dune (2021)/Dune.mkv";

async fn setup() -> (Arc<SqlitePool>, HistoryReconciler) {
    // One connection: every pooled connection to :memory: is its own database.
    let pool = Arc::new(db::connect("sqlite::memory:", 1).await.unwrap());
    db::run_migrations(&pool).await.unwrap();
    let reconciler = HistoryReconciler::new(
        pool.clone(),
        StorageKind::new("local"),
        StorageKind::new("u115"),
    );
    (pool, reconciler)
}

async fn insert_row(pool: &SqlitePool, local_path: &str, dest: &str, modified: DateTime<Utc>) {
    sqlx::query(
        "INSERT INTO transfer_history (local_path, dest_storage, title, season, episode, download_hash, last_modified)
         VALUES (?, ?, 'Dune', NULL, NULL, 'abc123', ?)",
    )
    .bind(local_path)
    .bind(dest)
    .bind(modified)
    .execute(pool)
    .await
    .unwrap();
}

fn uploaded(path: &str) -> UploadTask {
    let mut task = task(path);
    task.status = TaskStatus::Succeeded;
    task.attempts = 1;
    task.remote_path = Some("/remote/movies/Dune (2021)/Dune.mkv".into());
    task.remote_file = Some(RemoteFile {
        file_id: "fid-1".into(),
        parent_id: "dir-1".into(),
        remote_path: "/remote/movies/Dune (2021)/Dune.mkv".into(),
        size_bytes: 1024,
        deduplicated: false,
    });
    task
}

#[tokio::test]
async fn local_row_flips_to_remote() {
    let (pool, reconciler) = setup().await;
    let before = Utc::now() - Duration::days(1);
    insert_row(&pool, PATH, "local", before).await;

    let outcome = reconciler.reconcile(&uploaded(PATH)).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated);

    let record = reconciler.fetch_record(PATH).await.unwrap().unwrap();
    assert_eq!(record.dest_storage, "u115");
    assert_eq!(
        record.remote_path.as_deref(),
        Some("/remote/movies/Dune (2021)/Dune.mkv")
    );
    assert_eq!(record.remote_file_id.as_deref(), Some("fid-1"));
    assert!(record.last_modified > before);
    assert_eq!(record.title, "Dune");
}

#[tokio::test]
async fn missing_row_is_not_found() {
    let (_pool, reconciler) = setup().await;
    let outcome = reconciler.reconcile(&uploaded(PATH)).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::NotFound);
    assert!(reconciler.fetch_record(PATH).await.unwrap().is_none());
}

#[tokio::test]
async fn reconciled_row_is_left_alone() {
    let (pool, reconciler) = setup().await;
    let modified = DateTime::from_timestamp(Utc::now().timestamp() - 3 * 3600, 0).unwrap();
    insert_row(&pool, PATH, "u115", modified).await;

    let outcome = reconciler.reconcile(&uploaded(PATH)).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyReconciled);

    let record = reconciler.fetch_record(PATH).await.unwrap().unwrap();
    assert_eq!(record.last_modified, modified);
    assert!(record.remote_file_id.is_none());
}

#[tokio::test]
async fn foreign_storage_is_a_conflict() {
    let (pool, reconciler) = setup().await;
    insert_row(&pool, PATH, "alist", Utc::now()).await;

    let outcome = reconciler.reconcile(&uploaded(PATH)).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Conflict {
            current: "alist".into()
        }
    );
    let record = reconciler.fetch_record(PATH).await.unwrap().unwrap();
    assert_eq!(record.dest_storage, "alist");
}

#[tokio::test]
async fn second_reconcile_never_regresses() {
    let (pool, reconciler) = setup().await;
    insert_row(&pool, PATH, "local", Utc::now()).await;

    let task = uploaded(PATH);
    assert_eq!(
        reconciler.reconcile(&task).await.unwrap(),
        ReconcileOutcome::Updated
    );
    assert_eq!(
        reconciler.reconcile(&task).await.unwrap(),
        ReconcileOutcome::AlreadyReconciled
    );

    let record = reconciler.fetch_record(PATH).await.unwrap().unwrap();
    assert_eq!(record.dest_storage, "u115");
}

#[tokio::test]
async fn only_the_uploaded_row_changes() {
    let (pool, reconciler) = setup().await;
    let other = "/media/movies/Arrival (2016)/Arrival.mkv";
    insert_row(&pool, PATH, "local", Utc::now()).await;
    insert_row(&pool, other, "local", Utc::now()).await;

    reconciler.reconcile(&uploaded(PATH)).await.unwrap();

    let untouched = reconciler.fetch_record(other).await.unwrap().unwrap();
    assert_eq!(untouched.dest_storage, "local");
}

#[tokio::test]
async fn task_without_remote_file_is_rejected() {
    let (pool, reconciler) = setup().await;
    insert_row(&pool, PATH, "local", Utc::now()).await;

    let err = reconciler.reconcile(&task(PATH)).await.unwrap_err();
    assert!(matches!(err, HistoryError::NotUploaded(_)));

    let record = reconciler.fetch_record(PATH).await.unwrap().unwrap();
    assert_eq!(record.dest_storage, "local");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_on_a_shared_file_all_land() {
    let dir = tempfile::TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("history.db").display());
    let pool = Arc::new(db::connect(&url, 5).await.unwrap());
    db::run_migrations(&pool).await.unwrap();
    let reconciler = HistoryReconciler::new(
        pool.clone(),
        StorageKind::new("local"),
        StorageKind::new("u115"),
    );

    let paths: Vec<String> = (0..60)
        .map(|n| format!("/media/tv/Show/S01/E{:02}.mkv", n))
        .collect();
    for path in &paths {
        insert_row(&pool, path, "local", Utc::now()).await;
    }

    let calls: Vec<_> = paths
        .iter()
        .map(|path| {
            let reconciler = reconciler.clone();
            let task = uploaded(path);
            tokio::spawn(async move { reconciler.reconcile(&task).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), ReconcileOutcome::Updated);
    }

    let still_local: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM transfer_history WHERE dest_storage = 'local'")
            .fetch_one(&*pool)
            .await
            .unwrap();
    assert_eq!(still_local, 0);
}
