//! Profiler instance lifecycle and public surface.
//!
//! Each hosted application owns exactly one [`Profiler`] for its process
//! lifetime, built from configuration via [`Builder`]. The handle returned
//! at initialization is the primary access path; a process-wide
//! "last initialized" slot exists only as a best-effort convenience for
//! call sites that cannot thread the handle through.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{BasicAuthConfig, ProfilerConfig};
use crate::error::{ProfilerError, Result};
use crate::filters::{FilterSpec, Interval};
use crate::measurement::{epoch_now, MeasurementRecord, SummaryRow};
use crate::recorder::{empty_object, IgnorePatterns, ProfileSampler, Recorder, RequestMeta, SamplingPolicy};
use crate::storage::{open_storage, Storage};

static LAST_INSTANCE: RwLock<Option<Arc<Profiler>>> = RwLock::new(None);

/// How query-surface access is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// No protection. Initialization warns about this.
    None,
    /// HTTP basic auth with fixed credentials.
    Basic {
        /// Expected username.
        username: String,
        /// Expected password.
        password: String,
    },
}

impl AuthStrategy {
    fn from_config(config: &BasicAuthConfig) -> Self {
        if config.enabled {
            AuthStrategy::Basic {
                username: config.username.clone(),
                password: config.password.clone(),
            }
        } else {
            AuthStrategy::None
        }
    }

    /// Short tag for logs and diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            AuthStrategy::None => "none",
            AuthStrategy::Basic { .. } => "basic",
        }
    }

    /// Checks a credential pair. Always true when no auth is configured.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self {
            AuthStrategy::None => true,
            AuthStrategy::Basic {
                username: expected_user,
                password: expected_pass,
            } => {
                let ok = username == expected_user && password == expected_pass;
                if !ok {
                    warn!("query surface authentication failed");
                }
                ok
            }
        }
    }

    /// Checks an `Authorization` header value of the form `Basic <b64>`.
    pub fn verify_header(&self, header: &str) -> bool {
        match self {
            AuthStrategy::None => true,
            AuthStrategy::Basic { .. } => {
                let Some(encoded) = header.strip_prefix("Basic ") else {
                    return false;
                };
                let Ok(decoded) =
                    base64::engine::general_purpose::STANDARD.decode(encoded.trim())
                else {
                    return false;
                };
                let Ok(text) = String::from_utf8(decoded) else {
                    return false;
                };
                match text.split_once(':') {
                    Some((user, pass)) => self.verify(user, pass),
                    None => false,
                }
            }
        }
    }
}

/// Configures and initializes a [`Profiler`].
pub struct Builder {
    config: ProfilerConfig,
    sampling: SamplingPolicy,
    sampler: Option<Arc<dyn ProfileSampler>>,
}

impl Builder {
    /// Starts a builder from validated-later configuration.
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config,
            sampling: SamplingPolicy::default(),
            sampler: None,
        }
    }

    /// Sets the per-invocation sampling policy.
    pub fn sampling(mut self, policy: SamplingPolicy) -> Self {
        self.sampling = policy;
        self
    }

    /// Attaches an external stack sampler supplying one opaque blob per
    /// measurement.
    pub fn sampler(mut self, sampler: Arc<dyn ProfileSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Validates configuration, establishes the auth strategy, opens the
    /// storage backend, and publishes the instance as the process-wide
    /// fallback. Any configuration failure is fatal: the instance never
    /// reaches Ready.
    pub fn initialize(self) -> Result<Arc<Profiler>> {
        self.config.validate()?;
        let ignore = IgnorePatterns::compile(&self.config.ignore)?;

        if !self.config.enabled {
            info!("profiler disabled; calls pass through unrecorded");
            let instance = Arc::new(Profiler {
                enabled: false,
                recorder: Recorder::new(ignore, self.sampling, self.sampler, false),
                auth: AuthStrategy::None,
                storage: None,
                retention_enabled: false,
                retention_period_s: self.config.storage.retention_period_s,
                last_retention_check: AtomicU64::new(0),
            });
            *LAST_INSTANCE.write() = Some(Arc::clone(&instance));
            return Ok(instance);
        }

        let auth = AuthStrategy::from_config(&self.config.basic_auth);
        if auth == AuthStrategy::None {
            warn!("query surface is not protected; measurement data is exposed without authentication");
        }
        let storage = open_storage(&self.config.storage)?;
        let instance = Arc::new(Profiler {
            enabled: true,
            recorder: Recorder::new(
                ignore,
                self.sampling,
                self.sampler,
                self.config.verbose,
            ),
            auth,
            storage: Some(storage),
            retention_enabled: self.config.storage.retention_enabled,
            retention_period_s: self.config.storage.retention_period_s,
            last_retention_check: AtomicU64::new(0),
        });
        *LAST_INSTANCE.write() = Some(Arc::clone(&instance));
        info!(auth = instance.auth.tag(), "profiler ready");
        Ok(instance)
    }
}

/// One profiler instance: configuration, recording pipeline, and the
/// exclusively owned storage handle.
pub struct Profiler {
    enabled: bool,
    recorder: Recorder,
    auth: AuthStrategy,
    storage: Option<Box<dyn Storage>>,
    retention_enabled: bool,
    retention_period_s: f64,
    last_retention_check: AtomicU64,
}

impl Profiler {
    /// Initializes an instance with the default sampling policy and no
    /// external sampler. See [`Builder`] for the knobs.
    pub fn initialize(config: ProfilerConfig) -> Result<Arc<Self>> {
        Builder::new(config).initialize()
    }

    /// The most recently initialized instance, if any. Best-effort
    /// convenience for call sites that cannot thread the handle through;
    /// the handle returned by [`Profiler::initialize`] is the primary
    /// access path.
    pub fn last() -> Option<Arc<Self>> {
        LAST_INSTANCE.read().clone()
    }

    /// Whether this instance records measurements.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The configured auth strategy for the query surface.
    pub fn auth(&self) -> &AuthStrategy {
        &self.auth
    }

    fn storage(&self) -> Result<&dyn Storage> {
        self.storage.as_deref().ok_or(ProfilerError::Disabled)
    }

    // ---- recording surface -------------------------------------------------

    /// Measures one synchronous invocation under the given name/method and
    /// optional context. The callable's result (or unwind) passes
    /// through unchanged; the measurement persists on every completion.
    pub fn measure<T>(
        &self,
        name: &str,
        method: &str,
        context: Option<Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        self.measure_call(name, method, Value::Array(Vec::new()), empty_object(), context, f)
    }

    /// Like [`Profiler::measure`], recording the serialized argument tuple
    /// alongside the call.
    pub fn measure_with_args<A: Serialize, T>(
        &self,
        name: &str,
        method: &str,
        context: Option<Value>,
        args: &A,
        f: impl FnOnce() -> T,
    ) -> T {
        self.measure_call(name, method, args_value(args), empty_object(), context, f)
    }

    /// Measures one suspending invocation. Identical record shape to the
    /// synchronous path; a cancelled future records nothing.
    pub async fn measure_async<T>(
        &self,
        name: &str,
        method: &str,
        context: Option<Value>,
        fut: impl Future<Output = T>,
    ) -> T {
        self.measure_async_call(
            name,
            method,
            Value::Array(Vec::new()),
            empty_object(),
            context,
            fut,
        )
        .await
    }

    /// HTTP-shaped variant: derives name, method, and context from request
    /// metadata supplied by the host framework.
    pub fn measure_request<T>(
        &self,
        meta: &RequestMeta,
        fallback_name: &str,
        f: impl FnOnce() -> T,
    ) -> T {
        let name = meta.derived_name(fallback_name);
        self.measure_call(
            &name,
            &meta.method,
            Value::Array(Vec::new()),
            empty_object(),
            Some(meta.context_value()),
            f,
        )
    }

    /// Suspending HTTP-shaped variant.
    pub async fn measure_request_async<T>(
        &self,
        meta: &RequestMeta,
        fallback_name: &str,
        fut: impl Future<Output = T>,
    ) -> T {
        let name = meta.derived_name(fallback_name);
        self.measure_async_call(
            &name,
            &meta.method,
            Value::Array(Vec::new()),
            empty_object(),
            Some(meta.context_value()),
            fut,
        )
        .await
    }

    /// Wraps a plain callable into a measured one. The wrapper serializes
    /// the argument tuple into the record and preserves the calling
    /// convention; when the instance is disabled the inner callable runs
    /// untouched.
    pub fn wrap<A, T, F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        method: impl Into<String>,
        context: Option<Value>,
        f: F,
    ) -> impl Fn(A) -> T
    where
        A: Serialize,
        F: Fn(A) -> T,
    {
        let profiler = Arc::clone(self);
        let name = name.into();
        let method = method.into();
        move |args: A| {
            let serialized = args_value(&args);
            profiler.measure_call(
                &name,
                &method,
                serialized,
                empty_object(),
                context.clone(),
                || f(args),
            )
        }
    }

    /// Wraps a suspending callable into a measured one. Semantics match
    /// [`Profiler::wrap`]; the returned future is boxed so the wrapper has
    /// a nameable type.
    pub fn wrap_async<A, T, F, Fut>(
        self: &Arc<Self>,
        name: impl Into<String>,
        method: impl Into<String>,
        context: Option<Value>,
        f: F,
    ) -> impl Fn(A) -> Pin<Box<dyn Future<Output = T> + Send>>
    where
        A: Serialize + Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let profiler = Arc::clone(self);
        let name = name.into();
        let method = method.into();
        move |args: A| {
            let profiler = Arc::clone(&profiler);
            let name = name.clone();
            let method = method.clone();
            let context = context.clone();
            let f = f.clone();
            Box::pin(async move {
                let serialized = args_value(&args);
                profiler
                    .measure_async_call(
                        &name,
                        &method,
                        serialized,
                        empty_object(),
                        context,
                        f(args),
                    )
                    .await
            })
        }
    }

    fn measure_call<T>(
        &self,
        name: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        context: Option<Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        if !self.enabled {
            return f();
        }
        let Some(storage) = self.storage.as_deref() else {
            return f();
        };
        if !self.recorder.should_record(name) {
            return f();
        }
        let out = self.recorder.record_sync(
            storage,
            name,
            method,
            args,
            kwargs,
            context.unwrap_or_else(empty_object),
            f,
        );
        self.maybe_run_retention();
        out
    }

    async fn measure_async_call<T>(
        &self,
        name: &str,
        method: &str,
        args: Value,
        kwargs: Value,
        context: Option<Value>,
        fut: impl Future<Output = T>,
    ) -> T {
        if !self.enabled {
            return fut.await;
        }
        let Some(storage) = self.storage.as_deref() else {
            return fut.await;
        };
        if !self.recorder.should_record(name) {
            return fut.await;
        }
        let out = self
            .recorder
            .record_async(
                storage,
                name,
                method,
                args,
                kwargs,
                context.unwrap_or_else(empty_object),
                fut,
            )
            .await;
        self.maybe_run_retention();
        out
    }

    // ---- retention ---------------------------------------------------------

    /// Runs one retention pass now. Failures are logged and reported as
    /// `false`; this never propagates an error into a request path.
    pub fn run_retention(&self) -> bool {
        match self.storage() {
            Ok(storage) => match storage.retention_deletion() {
                Ok(swept) => swept,
                Err(e) => {
                    error!(error = %e, "retention pass failed");
                    false
                }
            },
            Err(_) => false,
        }
    }

    /// Opportunistic retention kick after a recorded call, locally gated
    /// to one attempt per quarter period so the exclusive lock is not
    /// taken on every insert.
    fn maybe_run_retention(&self) {
        if !self.retention_enabled {
            return;
        }
        let now = epoch_now() as u64;
        let gate = (self.retention_period_s / 4.0) as u64;
        let last = self.last_retention_check.load(Ordering::Relaxed);
        if now.saturating_sub(last) < gate {
            return;
        }
        if self
            .last_retention_check
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if self.run_retention() {
            debug!("opportunistic retention pass swept expired measurements");
        }
    }

    // ---- query surface -----------------------------------------------------

    /// Filtered records for a typed spec.
    pub fn filter(&self, spec: &FilterSpec) -> Result<Vec<MeasurementRecord>> {
        self.storage()?.filter(spec)
    }

    /// Filtered records for flat string parameters.
    pub fn filter_params(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<Vec<MeasurementRecord>> {
        self.storage()?.filter(&FilterSpec::from_params(params))
    }

    /// Grouped summary rows for a typed spec.
    pub fn summary(&self, spec: &FilterSpec) -> Result<Vec<SummaryRow>> {
        self.storage()?.summary(spec)
    }

    /// Grouped summary rows for flat string parameters.
    pub fn summary_params(&self, params: &HashMap<String, String>) -> Result<Vec<SummaryRow>> {
        self.storage()?.summary(&FilterSpec::from_params(params))
    }

    /// Point lookup by id; `None` when absent.
    pub fn get(&self, id: i64) -> Result<Option<MeasurementRecord>> {
        self.storage()?.get(id)
    }

    /// Dense bucket counts for a typed spec.
    pub fn timeseries(
        &self,
        spec: &FilterSpec,
        interval: Interval,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        self.storage()?.timeseries(spec, interval)
    }

    /// Dense bucket counts for flat string parameters; the `interval`
    /// parameter selects daily buckets, anything else is hourly.
    pub fn timeseries_params(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        let interval = Interval::from_param(params.get("interval").map(String::as_str));
        self.storage()?
            .timeseries(&FilterSpec::from_params(params), interval)
    }

    /// Per-method call counts for a typed spec.
    pub fn method_distribution(
        &self,
        spec: &FilterSpec,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        self.storage()?.method_distribution(spec)
    }

    /// Per-method call counts for flat string parameters.
    pub fn method_distribution_params(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        self.storage()?
            .method_distribution(&FilterSpec::from_params(params))
    }

    /// Full summary export over the default window, as a JSON value ready
    /// for an attachment-style download.
    pub fn dump_database(&self) -> Result<Value> {
        let rows = self.storage()?.summary(&FilterSpec::default())?;
        Ok(json!({ "summary": rows }))
    }

    /// Deletes every measurement and resets the retention baseline.
    pub fn delete_database(&self) -> Result<bool> {
        self.storage()?.truncate()
    }

    /// Releases the storage backend. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.close(),
            None => Ok(()),
        }
    }
}

fn args_value<A: Serialize>(args: &A) -> Value {
    match serde_json::to_value(args) {
        Ok(Value::Array(items)) => Value::Array(items),
        Ok(Value::Null) => Value::Array(Vec::new()),
        Ok(other) => Value::Array(vec![other]),
        Err(e) => {
            warn!(error = %e, "call arguments not serializable; recording empty args");
            Value::Array(Vec::new())
        }
    }
}
