use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use lapse::{
    FilterSpec, Profiler, ProfilerConfig, RequestMeta, SamplingPolicy, StorageConfig,
};
use serde_json::json;

fn memory_config(enabled: bool) -> ProfilerConfig {
    ProfilerConfig {
        enabled,
        storage: StorageConfig {
            path: ":memory:".to_string(),
            ..StorageConfig::default()
        },
        ..ProfilerConfig::default()
    }
}

fn profiler() -> Arc<Profiler> {
    Profiler::initialize(memory_config(true)).expect("initialize profiler")
}

#[test]
fn wrapped_function_returns_result_and_stores_one_measurement() {
    let profiler = profiler();
    let add = profiler.wrap("add", "call", None, |(a, b): (i32, i32)| a + b);

    assert_eq!(add((2, 3)), 5);

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.name, "add");
    assert_eq!(record.method, "call");
    assert!(record.elapsed >= 0.0);
    assert_eq!(record.args, json!([2, 3]));
}

#[test]
fn ignored_names_never_record_regardless_of_repetition() {
    let mut config = memory_config(true);
    config.ignore = vec!["^/static".to_string()];
    let profiler = Profiler::initialize(config).expect("initialize profiler");

    for _ in 0..20 {
        let out = profiler.measure("/static/app.js", "GET", None, || 7);
        assert_eq!(out, 7);
    }

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert!(records.is_empty());
}

#[test]
fn disabled_profiler_passes_through_and_has_no_storage() {
    let profiler = Profiler::initialize(memory_config(false)).expect("initialize profiler");
    assert!(!profiler.is_enabled());

    assert_eq!(profiler.measure("anything", "call", None, || 11), 11);
    assert!(profiler.filter(&FilterSpec::default()).is_err());
}

#[test]
fn sampling_predicate_false_suppresses_recording() {
    let profiler = lapse::Builder::new(memory_config(true))
        .sampling(SamplingPolicy::custom(|| false))
        .initialize()
        .expect("initialize profiler");

    assert_eq!(profiler.measure("sampled-out", "call", None, || 1), 1);
    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert!(records.is_empty());
}

#[test]
fn err_result_propagates_and_still_records() {
    let profiler = profiler();
    let out: Result<i32, String> =
        profiler.measure("fallible", "call", None, || Err("boom".to_string()));
    assert_eq!(out, Err("boom".to_string()));

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "fallible");
}

#[test]
fn unwinding_callable_still_records() {
    let profiler = profiler();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        profiler.measure("explodes", "call", None, || -> i32 { panic!("kaboom") })
    }));
    assert!(result.is_err(), "panic should propagate to the caller");

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "explodes");
    assert!(records[0].elapsed >= 0.0);
}

#[test]
fn request_variant_derives_name_method_and_context() {
    let profiler = profiler();
    let mut meta = RequestMeta {
        url: "http://localhost/api/people/john".to_string(),
        method: "GET".to_string(),
        route_rule: Some("/api/people/<firstname>".to_string()),
        endpoint: "get_person".to_string(),
        remote_addr: "127.0.0.1".to_string(),
        ..RequestMeta::default()
    };
    meta.query.insert("q".to_string(), "1".to_string());

    let out = profiler.measure_request(&meta, "get_person", || "john");
    assert_eq!(out, "john");

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.name, "/api/people/<firstname>");
    assert_eq!(record.method, "GET");
    assert_eq!(record.context["args"]["q"], "1");
    assert_eq!(record.context["func"], "get_person");
    assert_eq!(record.context["ip"], "127.0.0.1");
}

#[tokio::test]
async fn async_measurement_matches_sync_record_shape() {
    let profiler = profiler();

    let out = profiler
        .measure_async("fetch", "call", None, async { 21 * 2 })
        .await;
    assert_eq!(out, 42);

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.name, "fetch");
    assert_eq!(record.method, "call");
    assert_eq!(record.args, json!([]));
    assert_eq!(record.kwargs, json!({}));
    assert!(record.elapsed >= 0.0);
}

#[tokio::test]
async fn wrap_async_preserves_calling_convention() {
    let profiler = profiler();
    let double = profiler.wrap_async("double", "call", None, |x: i32| async move { x * 2 });

    assert_eq!(double(21).await, 42);

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "double");
    assert_eq!(records[0].args, json!([21]));
}

#[tokio::test]
async fn cancelled_future_records_nothing() {
    let profiler = profiler();

    let fut = profiler.measure_async("slow", "call", None, async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        1
    });
    drop(fut);

    let records = profiler.filter(&FilterSpec::default()).expect("filter");
    assert!(records.is_empty());
}
