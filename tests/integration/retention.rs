use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use lapse::{
    FilterSpec, Measurement, PooledStorage, SqliteStorage, Storage, StorageConfig,
};
use serde_json::json;
use tempfile::tempdir;

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs_f64()
}

fn retention_config(path: &str, period_s: f64) -> StorageConfig {
    StorageConfig {
        path: path.to_string(),
        retention_enabled: true,
        retention_period_s: period_s,
        ..StorageConfig::default()
    }
}

fn record_started_at(started_at: f64) -> Measurement {
    Measurement {
        name: "aged".to_string(),
        method: "call".to_string(),
        args: json!([]),
        kwargs: json!({}),
        context: json!({}),
        started_at,
        ended_at: started_at + 0.01,
        elapsed: 0.01,
        profile_stats: None,
    }
}

#[test]
fn expired_record_is_deleted_once_then_buffered() {
    let storage =
        SqliteStorage::open(&retention_config(":memory:", 100.0)).expect("open storage");
    storage
        .insert(&record_started_at(now() - 200.0))
        .expect("insert aged record");

    assert!(storage.retention_deletion().expect("first pass"));
    assert!(storage
        .filter(&FilterSpec::default())
        .expect("filter")
        .is_empty());

    // Within the quarter-period buffer the next pass is a no-op.
    assert!(!storage.retention_deletion().expect("second pass"));
}

#[test]
fn young_records_survive_a_pass() {
    let storage =
        SqliteStorage::open(&retention_config(":memory:", 100.0)).expect("open storage");
    storage
        .insert(&record_started_at(now() - 50.0))
        .expect("insert young record");

    assert!(storage.retention_deletion().expect("pass runs"));
    assert_eq!(
        storage.filter(&FilterSpec::default()).expect("filter").len(),
        1
    );
}

#[test]
fn concurrent_passes_are_single_flight() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("retention.db");
    let storage = Arc::new(
        SqliteStorage::open(&retention_config(&path.to_string_lossy(), 100.0))
            .expect("open storage"),
    );
    storage
        .insert(&record_started_at(now() - 200.0))
        .expect("insert aged record");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || storage.retention_deletion().expect("pass"))
        })
        .collect();

    let results: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().expect("thread finished"))
        .collect();
    let swept = results.iter().filter(|r| **r).count();
    assert_eq!(swept, 1, "exactly one concurrent pass performs the deletion");
    assert!(storage
        .filter(&FilterSpec::default())
        .expect("filter")
        .is_empty());
}

#[test]
fn two_handles_to_one_file_stay_single_flight() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("shared.db");
    let config = retention_config(&path.to_string_lossy(), 100.0);

    let first = PooledStorage::open(&config).expect("open first handle");
    let second = PooledStorage::open(&config).expect("open second handle");

    first
        .insert(&record_started_at(now() - 200.0))
        .expect("insert aged record");

    assert!(first.retention_deletion().expect("first handle sweeps"));
    assert!(
        !second.retention_deletion().expect("second handle defers"),
        "metadata timestamp is shared through the file"
    );
}

#[test]
fn truncate_resets_the_retention_baseline() {
    let storage =
        SqliteStorage::open(&retention_config(":memory:", 100.0)).expect("open storage");

    assert!(storage.retention_deletion().expect("first pass"));
    assert!(!storage.retention_deletion().expect("buffered pass"));

    assert!(storage.truncate().expect("truncate"));
    assert!(
        storage.retention_deletion().expect("pass after truncate"),
        "truncate resets lastRetentionDeletionTime"
    );
}
