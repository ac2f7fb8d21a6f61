use chrono::{DateTime, Duration, TimeZone, Utc};
use gfs_backup::{
    errors::BackupError,
    models::{RotationPolicy, TransferRequest},
    services::{BackupOrchestrator, Clock},
    store::{InMemoryObjectStore, memory::StoreOp},
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Advances by `step` on every read.
struct SteppingClock {
    next: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl SteppingClock {
    fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock().unwrap();
        let now = *next;
        *next += self.step;
        now
    }
}

/// Tuesday midnight. Fifty hourly runs stay clear of Mondays and month starts.
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
}

fn request(dir: &TempDir, bucket_directory: &str) -> TransferRequest {
    let path = dir.path().join("db.dump");
    std::fs::write(&path, b"nightly dump").unwrap();
    TransferRequest {
        local_path: path,
        destination_key: "db".into(),
        bucket: "backups".into(),
        bucket_directory: bucket_directory.into(),
        deadline: Duration::seconds(30),
        worker_count: 5,
        chunk_size_mb: 1,
        apply_naming: true,
    }
}

fn store() -> InMemoryObjectStore {
    let store = InMemoryObjectStore::starting_at(start());
    store.create_bucket("backups");
    store
}

fn count_only(daily: usize) -> RotationPolicy {
    RotationPolicy {
        daily_retention_count: daily,
        enforce_retention_period: false,
        ..RotationPolicy::default()
    }
}

#[tokio::test]
async fn fifty_daily_backups_leave_the_newest_six() {
    let dir = TempDir::new().unwrap();
    let store = store();
    let orchestrator = BackupOrchestrator::new(
        Arc::new(store.clone()),
        count_only(6),
        Arc::new(SteppingClock::new(start(), Duration::hours(1))),
    )
    .unwrap();

    let mut uploaded = Vec::new();
    for _ in 0..50 {
        let report = orchestrator
            .run_backup(&request(&dir, "testdir/"), false)
            .await
            .unwrap();
        uploaded.push(report.key);
    }

    let remaining = store.keys("backups");
    assert_eq!(remaining.len(), 6);
    let newest: Vec<_> = uploaded[44..].to_vec();
    assert_eq!(remaining, newest);
    assert!(remaining.iter().all(|k| k.starts_with("testdir/daily_db_")));
}

#[tokio::test]
async fn deadline_during_backup_skips_rotation() {
    let dir = TempDir::new().unwrap();
    let store = store();
    store.insert_object("backups", "daily_db_old", "x", start() - Duration::days(90));
    store.stall_part_uploads();
    let orchestrator = BackupOrchestrator::new(
        Arc::new(store.clone()),
        count_only(0),
        Arc::new(SteppingClock::new(start(), Duration::hours(1))),
    )
    .unwrap();
    let req = TransferRequest {
        deadline: Duration::milliseconds(150),
        ..request(&dir, "")
    };

    let err = orchestrator.run_backup(&req, false).await.unwrap_err();

    let transfer = match err {
        BackupError::Transfer(transfer) => transfer,
        other => panic!("expected a transfer error, got {other}"),
    };
    assert!(transfer.is_deadline_exceeded());
    assert_eq!(
        store.count_operations(|op| matches!(op, StoreOp::AbortMultipart { .. })),
        1
    );
    assert_eq!(store.count_operations(|op| matches!(op, StoreOp::List { .. })), 0);
    assert_eq!(store.keys("backups"), vec!["daily_db_old"]);
}

#[tokio::test]
async fn dry_runs_never_mutate() {
    let dir = TempDir::new().unwrap();
    let store = store();
    for day in 1..=20 {
        let at = start() - Duration::days(day);
        store.insert_object("backups", &format!("daily_db_{day:02}"), "x", at);
    }
    store
        .insert_object("backups", "weekly_db_01", "x", start() - Duration::days(400));
    let orchestrator = BackupOrchestrator::new(
        Arc::new(store.clone()),
        count_only(6),
        Arc::new(SteppingClock::new(start(), Duration::hours(1))),
    )
    .unwrap();
    let before = store.keys("backups");

    let backup = orchestrator.run_backup(&request(&dir, ""), true).await.unwrap();
    let rotation = orchestrator.run_rotate_only("backups", "", true).await.unwrap();
    let cleanup = orchestrator.run_cleanup("backups", true).await.unwrap();

    // the backup plan counts the key it would have uploaded
    assert_eq!(backup.rotation.pruned.len(), 15);
    assert_eq!(rotation.pruned(), 14);
    assert!(cleanup.aborted.is_empty());
    assert_eq!(store.keys("backups"), before);
    assert_eq!(store.count_operations(StoreOp::is_mutating), 0);
}

#[tokio::test]
async fn rotate_only_reports_every_failed_delete() {
    let store = store();
    for day in 1..=10 {
        let at = start() - Duration::days(day);
        store.insert_object("backups", &format!("daily_db_{day:02}"), "x", at);
    }
    store.fail_delete_of("daily_db_09");
    store.fail_delete_of("daily_db_10");
    let orchestrator = BackupOrchestrator::new(
        Arc::new(store.clone()),
        count_only(6),
        Arc::new(SteppingClock::new(start(), Duration::hours(1))),
    )
    .unwrap();

    let err = orchestrator
        .run_rotate_only("backups", "", false)
        .await
        .unwrap_err();

    assert!(err.is_warning());
    let message = err.to_string();
    assert!(message.contains("2 operation(s) failed"), "got: {message}");
    assert!(message.contains("daily_db_09") && message.contains("daily_db_10"));
    assert_eq!(store.keys("backups").len(), 8);
}
