//! Single-connection SQLite backend.
//!
//! One `rusqlite::Connection` serialized behind a mutex: every operation
//! holds the lock for its duration and releases it on every exit path.
//! Suits a single process writing to a local file; `":memory:"` gives a
//! transient database for tests.

use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{acquire_lock, ProfilerError, Result};
use crate::filters::{FilterSpec, Interval};
use crate::measurement::{epoch_now, Measurement, MeasurementRecord, SummaryRow};
use crate::storage::{queries, Storage};

/// SQLite storage over one mutex-serialized connection.
pub struct SqliteStorage {
    conn: Mutex<Option<Connection>>,
    table: String,
    retention_period_s: f64,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database file and its schema.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let conn = Connection::open(&config.path)?;
        queries::configure_connection(&conn)?;
        queries::create_schema(&conn, &config.table)?;
        info!(path = %config.path, table = %config.table, "sqlite storage ready");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            table: config.table.clone(),
            retention_period_s: config.retention_period_s,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = acquire_lock(&self.conn, "sqlite connection")?;
        let conn = guard.as_mut().ok_or(ProfilerError::StorageClosed)?;
        f(conn)
    }
}

impl Storage for SqliteStorage {
    fn insert(&self, measurement: &Measurement) -> Result<i64> {
        self.with_conn(|conn| queries::insert_measurement(conn, &self.table, measurement))
    }

    fn get(&self, id: i64) -> Result<Option<MeasurementRecord>> {
        self.with_conn(|conn| queries::fetch_record(conn, &self.table, id))
    }

    fn filter(&self, spec: &FilterSpec) -> Result<Vec<MeasurementRecord>> {
        self.with_conn(|conn| queries::fetch_filtered(conn, &self.table, spec))
    }

    fn summary(&self, spec: &FilterSpec) -> Result<Vec<SummaryRow>> {
        self.with_conn(|conn| queries::fetch_summary(conn, &self.table, spec))
    }

    fn timeseries(
        &self,
        spec: &FilterSpec,
        interval: Interval,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        self.with_conn(|conn| queries::fetch_timeseries(conn, &self.table, spec, interval))
    }

    fn method_distribution(
        &self,
        spec: &FilterSpec,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        self.with_conn(|conn| queries::fetch_method_distribution(conn, &self.table, spec))
    }

    fn truncate(&self) -> Result<bool> {
        self.with_conn(|conn| queries::truncate_all(conn, &self.table))
    }

    fn delete(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| queries::delete_record(conn, &self.table, id))
    }

    fn retention_deletion(&self) -> Result<bool> {
        self.with_conn(|conn| {
            // Fail fast instead of queueing behind a concurrent pass; a held
            // lock means someone else is already sweeping.
            conn.busy_timeout(Duration::ZERO)?;
            let swept = queries::retention_sweep(conn, &self.table, self.retention_period_s, epoch_now());
            conn.busy_timeout(queries::BUSY_TIMEOUT)?;
            match swept {
                Err(ProfilerError::Storage(e)) if queries::is_busy(&e) => Ok(false),
                other => other,
            }
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = acquire_lock(&self.conn, "sqlite connection")?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| ProfilerError::Storage(e))?;
        }
        Ok(())
    }
}
