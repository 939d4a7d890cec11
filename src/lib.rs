//! Call and request profiler with SQLite-backed measurement storage.
//!
//! Wrap a callable (synchronous or suspending) to measure wall-clock
//! timing and contextual metadata per invocation, persist completed
//! measurements into a queryable store, and read them back as filtered
//! records, `(method, name)` summaries, dense time buckets, or per-method
//! distributions, with optional bounded-retention cleanup that stays
//! single-flight across threads and processes.

pub mod config;
pub mod error;
pub mod filters;
pub mod measurement;
pub mod profiler;
pub mod recorder;
pub mod storage;

pub use config::{
    BasicAuthConfig, ProfilerConfig, StorageConfig, StorageEngine, DEFAULT_RETENTION_PERIOD_S,
};
pub use error::{ProfilerError, Result};
pub use filters::{FilterSpec, Interval, SortDirection};
pub use measurement::{Measurement, MeasurementRecord, SummaryRow};
pub use profiler::{AuthStrategy, Builder, Profiler};
pub use recorder::{ProfileSampler, RequestMeta, SamplingPolicy};
pub use storage::{open_storage, PooledStorage, SqliteStorage, Storage};
