//! The recording pipeline: ignore/sampling policy, timing capture, and the
//! push into storage.
//!
//! Policy decisions (ignore patterns, sampling) run per invocation before
//! timing starts. The synchronous path finishes its measurement through a
//! drop guard, so a callable that unwinds still produces a record; the
//! suspending path finishes only after the awaited future completes, so a
//! cancelled invocation records nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::{ProfilerError, Result};
use crate::measurement::Measurement;
use crate::storage::Storage;

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// External stack sampler seam. Implementations attach through
/// [`crate::Builder::sampler`] and supply one opaque blob per measurement.
pub trait ProfileSampler: Send + Sync {
    /// Called when timing starts for a recorded invocation.
    fn start(&self);
    /// Called when the invocation completes; the returned blob is stored
    /// verbatim as the measurement's profile stats.
    fn finish(&self) -> Option<Value>;
}

/// Per-invocation decision whether a call is recorded at all.
pub enum SamplingPolicy {
    /// Record every call.
    Always,
    /// Record a call with the given probability in `0.0..=1.0`.
    Rate(f64),
    /// Caller-supplied zero-argument predicate.
    Custom(Box<dyn Fn() -> bool + Send + Sync>),
}

impl SamplingPolicy {
    /// Probability-based sampling. Rates outside `0.0..=1.0` are a fatal
    /// configuration error.
    pub fn rate(rate: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ProfilerError::Config(format!(
                "sampling rate {rate} outside 0.0..=1.0"
            )));
        }
        Ok(SamplingPolicy::Rate(rate))
    }

    /// Wraps a caller-supplied predicate.
    pub fn custom(predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        SamplingPolicy::Custom(Box::new(predicate))
    }

    fn should_record(&self) -> bool {
        match self {
            SamplingPolicy::Always => true,
            SamplingPolicy::Rate(rate) => rand::thread_rng().gen::<f64>() < *rate,
            SamplingPolicy::Custom(predicate) => predicate(),
        }
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::Always
    }
}

impl fmt::Debug for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingPolicy::Always => f.write_str("Always"),
            SamplingPolicy::Rate(rate) => write!(f, "Rate({rate})"),
            SamplingPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Compiled ignore patterns, matched with search semantics against the
/// logical name.
pub(crate) struct IgnorePatterns(Vec<Regex>);

impl IgnorePatterns {
    pub(crate) fn compile(patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ProfilerError::Config(format!("invalid ignore pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(compiled))
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.0.iter().any(|re| re.is_match(name))
    }
}

/// Request metadata for the HTTP-shaped instrumentation variant. The host
/// framework fills this in; the recorder derives the measurement name,
/// method, and context from it.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Request base URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Matched route template, when the router provides one. Preferred as
    /// the measurement name so all calls of one route group together.
    pub route_rule: Option<String>,
    /// Name of the matched endpoint handler.
    pub endpoint: String,
    /// Query-string arguments.
    pub query: BTreeMap<String, String>,
    /// Form fields.
    pub form: BTreeMap<String, String>,
    /// Raw request body.
    pub body: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Peer address.
    pub remote_addr: String,
}

impl RequestMeta {
    pub(crate) fn derived_name(&self, fallback: &str) -> String {
        match &self.route_rule {
            Some(rule) => rule.clone(),
            None => fallback.to_string(),
        }
    }

    pub(crate) fn context_value(&self) -> Value {
        json!({
            "url": self.url,
            "args": self.query,
            "form": self.form,
            "body": self.body,
            "headers": self.headers,
            "func": self.endpoint,
            "ip": self.remote_addr,
        })
    }
}

/// The measurement-recording pipeline of one profiler instance.
pub(crate) struct Recorder {
    ignore: IgnorePatterns,
    sampling: SamplingPolicy,
    sampler: Option<Arc<dyn ProfileSampler>>,
    verbose: bool,
}

impl Recorder {
    pub(crate) fn new(
        ignore: IgnorePatterns,
        sampling: SamplingPolicy,
        sampler: Option<Arc<dyn ProfileSampler>>,
        verbose: bool,
    ) -> Self {
        Self {
            ignore,
            sampling,
            sampler,
            verbose,
        }
    }

    /// Ignore and sampling checks, evaluated before timing starts.
    pub(crate) fn should_record(&self, name: &str) -> bool {
        !self.ignore.matches(name) && self.sampling.should_record()
    }

    /// Measures a synchronous invocation. The drop guard finishes and
    /// persists the measurement on every exit path, unwinding included,
    /// and the callable's result passes through untouched.
    pub(crate) fn record_sync<T>(
        &self,
        storage: &dyn Storage,
        name: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        context: Value,
        f: impl FnOnce() -> T,
    ) -> T {
        if let Some(sampler) = &self.sampler {
            sampler.start();
        }
        let _guard = FinishGuard {
            recorder: self,
            storage,
            measurement: Some(Measurement::begin(name, method, args, kwargs, context)),
        };
        f()
    }

    /// Measures a suspending invocation. Persistence happens only after
    /// the future completes; a dropped (cancelled) future records nothing.
    pub(crate) async fn record_async<T>(
        &self,
        storage: &dyn Storage,
        name: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        context: Value,
        fut: impl Future<Output = T>,
    ) -> T {
        if let Some(sampler) = &self.sampler {
            sampler.start();
        }
        let mut measurement = Measurement::begin(name, method, args, kwargs, context);
        let out = fut.await;
        measurement.finish();
        self.store(storage, measurement);
        out
    }

    fn store(&self, storage: &dyn Storage, mut measurement: Measurement) {
        if !measurement.has_timing() {
            error!(
                name = %measurement.name,
                "measurement completed without timing stamps; record dropped"
            );
            return;
        }
        measurement.profile_stats = self.sampler.as_ref().and_then(|s| s.finish());
        if self.verbose {
            match serde_json::to_string(&measurement) {
                Ok(record) => debug!(%record, "measurement completed"),
                Err(_) => debug!(?measurement, "measurement completed"),
            }
        }
        if let Err(e) = storage.insert(&measurement) {
            error!(
                error = %e,
                name = %measurement.name,
                "failed to persist measurement"
            );
        }
    }
}

struct FinishGuard<'a> {
    recorder: &'a Recorder,
    storage: &'a dyn Storage,
    measurement: Option<Measurement>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut measurement) = self.measurement.take() {
            measurement.finish();
            self.recorder.store(self.storage, measurement);
        }
    }
}
