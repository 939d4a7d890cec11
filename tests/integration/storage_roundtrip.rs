use std::sync::Arc;
use std::thread;

use lapse::{FilterSpec, Measurement, SqliteStorage, Storage, StorageConfig};
use serde_json::json;
use tempfile::tempdir;

fn memory_storage() -> SqliteStorage {
    let config = StorageConfig {
        path: ":memory:".to_string(),
        ..StorageConfig::default()
    };
    SqliteStorage::open(&config).expect("open in-memory storage")
}

fn finished(name: &str, method: &str) -> Measurement {
    let mut m = Measurement::begin(name, method, json!([]), json!({}), json!({}));
    m.finish();
    m
}

#[test]
fn args_kwargs_context_round_trip_by_id() {
    let storage = memory_storage();
    let mut m = Measurement::begin(
        "roundtrip",
        "call",
        json!([1, 2]),
        json!({"k": "v"}),
        json!({"a": 1}),
    );
    m.finish();

    let id = storage.insert(&m).expect("insert");
    let record = storage.get(id).expect("get").expect("record present");

    assert_eq!(record.id, id);
    assert_eq!(record.args, json!([1, 2]));
    assert_eq!(record.kwargs, json!({"k": "v"}));
    assert_eq!(record.context, json!({"a": 1}));
    assert_eq!(record.name, "roundtrip");
    assert_eq!(record.method, "call");
}

#[test]
fn profile_stats_blob_round_trips_and_absent_stays_none() {
    let storage = memory_storage();

    let mut with_stats = finished("sampled", "call");
    with_stats.profile_stats = Some(json!({"frames": [{"fn": "main", "count": 3}]}));
    let id = storage.insert(&with_stats).expect("insert with stats");
    let record = storage.get(id).expect("get").expect("record present");
    assert_eq!(
        record.profile_stats,
        Some(json!({"frames": [{"fn": "main", "count": 3}]}))
    );

    let plain = finished("plain", "call");
    let id = storage.insert(&plain).expect("insert plain");
    let record = storage.get(id).expect("get").expect("record present");
    assert!(record.profile_stats.is_none());
}

#[test]
fn persisted_elapsed_is_rounded_up_to_four_places() {
    let storage = memory_storage();
    let mut m = finished("rounded", "call");
    m.elapsed = 0.1234001;

    let id = storage.insert(&m).expect("insert");
    let record = storage.get(id).expect("get").expect("record present");
    assert!(record.elapsed >= m.elapsed, "persisted value never undercounts");
    assert_eq!(record.elapsed, 0.1235);
}

#[test]
fn ids_stay_unique_and_monotonic_under_concurrent_inserts() {
    let dir = tempdir().expect("tempdir");
    let config = StorageConfig {
        path: dir
            .path()
            .join("concurrent.db")
            .to_string_lossy()
            .into_owned(),
        ..StorageConfig::default()
    };
    let storage = Arc::new(SqliteStorage::open(&config).expect("open storage"));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let m = finished(&format!("worker-{worker}-{i}"), "call");
                    ids.push(storage.insert(&m).expect("concurrent insert"));
                }
                ids
            })
        })
        .collect();

    let mut all_ids = Vec::new();
    for handle in handles {
        all_ids.extend(handle.join().expect("worker finished"));
    }
    all_ids.sort_unstable();
    let before = all_ids.len();
    all_ids.dedup();
    assert_eq!(before, 200, "every insert produced an id");
    assert_eq!(all_ids.len(), 200, "ids are unique");

    let spec = FilterSpec {
        limit: 500,
        ..FilterSpec::default()
    };
    assert_eq!(storage.filter(&spec).expect("filter").len(), 200);
}

#[test]
fn delete_then_get_is_none() {
    let storage = memory_storage();
    let id = storage.insert(&finished("gone", "call")).expect("insert");
    assert!(storage.delete(id).expect("delete"));
    assert!(storage.get(id).expect("get").is_none());
}
