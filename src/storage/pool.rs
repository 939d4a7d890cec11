//! Pooled SQLite backend.
//!
//! A sized set of WAL-mode connections to one database file. Checkout
//! recycles connections past the configured age and, when pre-ping is on,
//! validates each one with a ping query before handing it out. Overflow
//! connections beyond the pool size are opened on demand and discarded on
//! return. Retention deletion stays single-flight across connections and
//! processes by acquiring the exclusive metadata transaction with a zero
//! busy timeout: a held lock yields `false` instead of a queued waiter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{ProfilerError, Result};
use crate::filters::{FilterSpec, Interval};
use crate::measurement::{epoch_now, Measurement, MeasurementRecord, SummaryRow};
use crate::storage::{queries, Storage};

struct PooledConn {
    conn: Connection,
    created: Instant,
}

struct PoolState {
    idle: Vec<PooledConn>,
    open: u32,
    closed: bool,
}

/// SQLite storage over a sized connection pool.
pub struct PooledStorage {
    path: String,
    table: String,
    pool_size: u32,
    max_overflow: u32,
    recycle: Option<Duration>,
    pre_ping: bool,
    retention_period_s: f64,
    state: Mutex<PoolState>,
}

impl PooledStorage {
    /// Opens the database file, creates the schema, and seeds the pool
    /// with one connection.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let storage = Self {
            path: config.path.clone(),
            table: config.table.clone(),
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            recycle: config.recycle_secs.map(Duration::from_secs),
            pre_ping: config.pre_ping,
            retention_period_s: config.retention_period_s,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
        };
        let conn = storage.open_connection()?;
        queries::create_schema(&conn, &storage.table)?;
        storage.state.lock().open = 1;
        storage.checkin(PooledConn {
            conn,
            created: Instant::now(),
        });
        info!(
            path = %storage.path,
            table = %storage.table,
            pool_size = storage.pool_size,
            "pooled sqlite storage ready"
        );
        Ok(storage)
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        queries::configure_connection(&conn)?;
        Ok(conn)
    }

    fn checkout(&self) -> Result<PooledConn> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ProfilerError::StorageClosed);
        }
        while let Some(pooled) = state.idle.pop() {
            if let Some(max_age) = self.recycle {
                if pooled.created.elapsed() >= max_age {
                    state.open -= 1;
                    debug!("recycling aged pool connection");
                    continue;
                }
            }
            if self.pre_ping && ping(&pooled.conn).is_err() {
                state.open -= 1;
                warn!("discarding pool connection that failed pre-ping");
                continue;
            }
            return Ok(pooled);
        }
        if state.open >= self.pool_size + self.max_overflow {
            return Err(ProfilerError::PoolExhausted(state.open));
        }
        state.open += 1;
        drop(state);
        match self.open_connection() {
            Ok(conn) => Ok(PooledConn {
                conn,
                created: Instant::now(),
            }),
            Err(e) => {
                self.state.lock().open -= 1;
                Err(e)
            }
        }
    }

    fn checkin(&self, pooled: PooledConn) {
        let mut state = self.state.lock();
        if state.closed || state.idle.len() as u32 >= self.pool_size {
            // Overflow (or late) connections are discarded on return.
            state.open -= 1;
            return;
        }
        state.idle.push(pooled);
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut pooled = self.checkout()?;
        let out = f(&mut pooled.conn);
        self.checkin(pooled);
        out
    }
}

impl Storage for PooledStorage {
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
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len() as u32);
            idle
        };
        for pooled in idle {
            if let Err((_, e)) = pooled.conn.close() {
                warn!(error = %e, "error closing pooled connection");
            }
        }
        Ok(())
    }
}

fn ping(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT 1", [], |row| row.get(0))
}
