//! Measurement storage engines.
//!
//! One abstract [`Storage`] contract over a fixed measurement schema, with
//! configuration-driven backend construction: a single mutex-serialized
//! connection, or a sized pool of WAL-mode connections. Both run the same
//! SQL through [`queries`].

pub mod pool;
pub(crate) mod queries;
pub mod sqlite;

use std::collections::BTreeMap;

use crate::config::{StorageConfig, StorageEngine};
use crate::error::Result;
use crate::filters::{FilterSpec, Interval};
use crate::measurement::{Measurement, MeasurementRecord, SummaryRow};

pub use pool::PooledStorage;
pub use sqlite::SqliteStorage;

/// Abstract contract every measurement backend implements.
///
/// Implementations must tolerate concurrent calls: identities stay unique
/// and monotonic under concurrent inserts, and retention deletion stays
/// single-flight across threads and processes.
pub trait Storage: Send + Sync {
    /// Appends one measurement and returns its assigned id. The record is
    /// durable before this returns.
    fn insert(&self, measurement: &Measurement) -> Result<i64>;

    /// Point lookup; `None` (not an error) when absent.
    fn get(&self, id: i64) -> Result<Option<MeasurementRecord>>;

    /// Time-windowed, elapsed-floored, exact-matched, sorted, paginated
    /// records. Computed eagerly; no snapshot isolation across re-reads.
    fn filter(&self, spec: &FilterSpec) -> Result<Vec<MeasurementRecord>>;

    /// Aggregates grouped by `(method, name)` over the same default window
    /// as [`Storage::filter`].
    fn summary(&self, spec: &FilterSpec) -> Result<Vec<SummaryRow>>;

    /// Dense bucket counts over the window: zero-count buckets included,
    /// labeled from the local wall-clock conversion of each bucket start.
    fn timeseries(&self, spec: &FilterSpec, interval: Interval) -> Result<BTreeMap<String, u64>>;

    /// Call counts per method tag within the window.
    fn method_distribution(&self, spec: &FilterSpec) -> Result<BTreeMap<String, u64>>;

    /// Deletes all measurements and resets the retention baseline.
    /// Idempotent.
    fn truncate(&self) -> Result<bool>;

    /// Removes one record; `false` when it was absent.
    fn delete(&self, id: i64) -> Result<bool>;

    /// One single-flight retention pass. `true` when this call performed
    /// the deletion; `false` when another caller holds the pass or the
    /// last pass is recent enough.
    fn retention_deletion(&self) -> Result<bool>;

    /// Releases backend resources. Safe to call more than once.
    fn close(&self) -> Result<()>;
}

/// Opens the backend selected by the configuration.
pub fn open_storage(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    match config.engine {
        StorageEngine::Sqlite => Ok(Box::new(SqliteStorage::open(config)?)),
        StorageEngine::Pooled => Ok(Box::new(PooledStorage::open(config)?)),
    }
}
