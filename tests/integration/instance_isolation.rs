use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use lapse::{FilterSpec, Profiler, ProfilerConfig, StorageConfig, StorageEngine};
use tempfile::TempDir;

// Tests in this file touch the process-wide last-instance slot, so they
// run serialized.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn file_config(dir: &TempDir, file: &str) -> ProfilerConfig {
    ProfilerConfig {
        enabled: true,
        storage: StorageConfig {
            path: dir.path().join(file).to_string_lossy().into_owned(),
            ..StorageConfig::default()
        },
        ..ProfilerConfig::default()
    }
}

#[test]
fn instances_with_distinct_backends_are_isolated() {
    let _guard = serial();
    let dir = TempDir::new().expect("tempdir");
    let a = Profiler::initialize(file_config(&dir, "a.db")).expect("initialize a");
    let b = Profiler::initialize(file_config(&dir, "b.db")).expect("initialize b");

    for i in 0..5 {
        a.measure(&format!("a-call-{i}"), "call", None, || i);
    }

    assert_eq!(a.filter(&FilterSpec::default()).expect("filter a").len(), 5);
    assert!(
        b.filter(&FilterSpec::default()).expect("filter b").is_empty(),
        "b's backend never observes a's records"
    );

    b.measure("b-call", "call", None, || 1);
    assert_eq!(a.filter(&FilterSpec::default()).expect("filter a").len(), 5);
    assert_eq!(b.filter(&FilterSpec::default()).expect("filter b").len(), 1);
}

#[test]
fn reinitialization_replaces_fallback_but_not_live_instances() {
    let _guard = serial();
    let dir = TempDir::new().expect("tempdir");
    let first = Profiler::initialize(file_config(&dir, "first.db")).expect("initialize first");
    let second = Profiler::initialize(file_config(&dir, "second.db")).expect("initialize second");

    let last = Profiler::last().expect("a last instance exists");
    assert!(
        Arc::ptr_eq(&last, &second),
        "fallback points at the most recent instance"
    );

    // The earlier instance keeps working through its own handle.
    first.measure("still-alive", "call", None, || 0);
    assert_eq!(
        first.filter(&FilterSpec::default()).expect("filter").len(),
        1
    );
    assert!(second
        .filter(&FilterSpec::default())
        .expect("filter")
        .is_empty());
}

#[test]
fn pooled_engine_records_through_the_profiler() {
    let _guard = serial();
    let dir = TempDir::new().expect("tempdir");
    let mut config = file_config(&dir, "pooled.db");
    config.storage.engine = StorageEngine::Pooled;
    config.storage.pool_size = 2;
    let profiler = Profiler::initialize(config).expect("initialize pooled");

    for i in 0..10 {
        assert_eq!(profiler.measure("pooled-call", "call", None, || i), i);
    }
    assert_eq!(
        profiler.filter(&FilterSpec::default()).expect("filter").len(),
        10
    );
}

#[test]
fn toml_config_drives_the_flat_query_surface() {
    let _guard = serial();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("toml.db");
    let toml = format!(
        r#"
        enabled = true

        [storage]
        engine = "sqlite"
        path = {path:?}
        table = "calls"

        [basic_auth]
        enabled = true
        username = "admin"
        password = "hunter2"
        "#,
        path = path.to_string_lossy()
    );
    let config = ProfilerConfig::from_toml_str(&toml).expect("parse toml");
    let profiler = Profiler::initialize(config).expect("initialize");

    assert_eq!(profiler.auth().tag(), "basic");
    assert!(profiler.auth().verify("admin", "hunter2"));
    assert!(!profiler.auth().verify("admin", "nope"));

    profiler.measure("/api/people", "GET", None, || ());
    profiler.measure("/api/people", "GET", None, || ());

    let params: HashMap<String, String> = HashMap::new();
    assert_eq!(profiler.filter_params(&params).expect("filter").len(), 2);

    let summary = profiler.summary_params(&params).expect("summary");
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].count, 2);

    let distribution = profiler
        .method_distribution_params(&params)
        .expect("distribution");
    assert_eq!(distribution.get("GET"), Some(&2));

    let series = profiler.timeseries_params(&params).expect("timeseries");
    assert_eq!(series.values().sum::<u64>(), 2);

    let dump = profiler.dump_database().expect("dump");
    assert!(dump.get("summary").is_some());

    assert!(profiler.delete_database().expect("delete database"));
    assert!(profiler.filter_params(&params).expect("filter").is_empty());
}

#[test]
fn disabled_instance_rejects_query_surface() {
    let _guard = serial();
    let config = ProfilerConfig::default();
    let profiler = Profiler::initialize(config).expect("initialize disabled");
    assert!(!profiler.is_enabled());
    assert!(profiler.get(1).is_err());
    assert!(profiler.dump_database().is_err());
    assert!(!profiler.run_retention());
}
