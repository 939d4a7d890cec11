//! Shared SQL for the SQLite-backed storage engines.
//!
//! Both backends run the same statements; they differ only in how a
//! connection is acquired and how the retention lock is taken. Table names
//! are validated at configuration time and sort fields pass through the
//! allow-lists in [`crate::filters`], so the only identifiers interpolated
//! into SQL text are known-safe; every value position is a bound parameter.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Local, TimeZone};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::filters::{
    FilterSpec, Interval, SortDirection, FILTER_SORT_FIELDS, SUMMARY_SORT_FIELDS,
};
use crate::measurement::{persisted_elapsed, Measurement, MeasurementRecord, SummaryRow};

/// Busy timeout applied to every connection for regular operations.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const RECORD_COLUMNS: &str =
    "id, startedAt, endedAt, elapsed, method, args, kwargs, name, context, profileStats";

pub(crate) fn meta_table(table: &str) -> String {
    format!("{table}_meta")
}

pub(crate) fn configure_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

pub(crate) fn create_schema(conn: &Connection, table: &str) -> Result<()> {
    let meta = meta_table(table);
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            startedAt REAL,
            endedAt REAL,
            elapsed REAL,
            method TEXT,
            args TEXT,
            kwargs TEXT,
            name TEXT,
            context TEXT,
            profileStats TEXT
        );
        CREATE INDEX IF NOT EXISTS "{table}_window_idx"
            ON "{table}" (startedAt, endedAt, elapsed, name, method);
        CREATE TABLE IF NOT EXISTS "{meta}" (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            lastRetentionDeletionTime REAL NOT NULL
        );
        INSERT OR IGNORE INTO "{meta}" (id, lastRetentionDeletionTime) VALUES (1, 0);
        "#
    ))?;
    Ok(())
}

/// Appends one measurement, re-rounding elapsed up to persistence
/// precision, and returns the assigned id. Runs as a single autocommit
/// statement, durable before returning.
pub(crate) fn insert_measurement(conn: &Connection, table: &str, m: &Measurement) -> Result<i64> {
    let sql = format!(
        "INSERT INTO \"{table}\"
            (startedAt, endedAt, elapsed, method, args, kwargs, name, context, profileStats)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    );
    conn.execute(
        &sql,
        params![
            m.started_at,
            m.ended_at,
            persisted_elapsed(m.elapsed),
            m.method,
            m.args.to_string(),
            m.kwargs.to_string(),
            m.name,
            m.context.to_string(),
            m.profile_stats.as_ref().map(Value::to_string),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MeasurementRecord> {
    let profile_stats: Option<String> = row.get(9)?;
    let profile_stats = match profile_stats {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(MeasurementRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        elapsed: row.get(3)?,
        method: row.get(4)?,
        args: json_column(row, 5)?,
        kwargs: json_column(row, 6)?,
        name: row.get(7)?,
        context: json_column(row, 8)?,
        profile_stats,
    })
}

/// WHERE fragment and bound values for the spec's window plus, when
/// `with_exact` is set, the exact-match method/name filters.
fn window_clauses(spec: &FilterSpec, with_exact: bool) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["endedAt <= ?", "startedAt >= ?"];
    let mut values = vec![SqlValue::Real(spec.ended_at), SqlValue::Real(spec.started_at)];
    if let Some(min) = spec.elapsed_min {
        clauses.push("elapsed >= ?");
        values.push(SqlValue::Real(min));
    }
    if with_exact {
        if let Some(method) = &spec.method {
            clauses.push("method = ?");
            values.push(SqlValue::Text(method.clone()));
        }
        if let Some(name) = &spec.name {
            clauses.push("name = ?");
            values.push(SqlValue::Text(name.clone()));
        }
    }
    (clauses.join(" AND "), values)
}

pub(crate) fn fetch_record(
    conn: &Connection,
    table: &str,
    id: i64,
) -> Result<Option<MeasurementRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM \"{table}\" WHERE id = ?1");
    conn.query_row(&sql, params![id], record_from_row)
        .optional()
        .map_err(Into::into)
}

pub(crate) fn fetch_filtered(
    conn: &Connection,
    table: &str,
    spec: &FilterSpec,
) -> Result<Vec<MeasurementRecord>> {
    let (where_sql, mut values) = window_clauses(spec, true);
    let (field, direction) =
        spec.sanitized_sort(FILTER_SORT_FIELDS, "endedAt", SortDirection::Desc);
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM \"{table}\"
         WHERE {where_sql}
         ORDER BY {field} {dir}
         LIMIT ? OFFSET ?",
        dir = direction.as_sql(),
    );
    values.push(SqlValue::Integer(spec.limit as i64));
    values.push(SqlValue::Integer(spec.skip as i64));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), record_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub(crate) fn fetch_summary(
    conn: &Connection,
    table: &str,
    spec: &FilterSpec,
) -> Result<Vec<SummaryRow>> {
    let (where_sql, mut values) = window_clauses(spec, false);
    let (field, direction) = spec.sanitized_sort(SUMMARY_SORT_FIELDS, "count", SortDirection::Desc);
    let sql = format!(
        "SELECT method, name,
                count(id) as count,
                min(elapsed) as minElapsed,
                max(elapsed) as maxElapsed,
                avg(elapsed) as avgElapsed
         FROM \"{table}\"
         WHERE {where_sql}
         GROUP BY method, name
         ORDER BY {field} {dir}
         LIMIT ? OFFSET ?",
        dir = direction.as_sql(),
    );
    values.push(SqlValue::Integer(spec.limit as i64));
    values.push(SqlValue::Integer(spec.skip as i64));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok(SummaryRow {
            method: row.get(0)?,
            name: row.get(1)?,
            count: row.get::<_, i64>(2)? as u64,
            min_elapsed: row.get(3)?,
            max_elapsed: row.get(4)?,
            avg_elapsed: row.get(5)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn bucket_label(ts: i64, interval: Interval) -> Option<String> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(interval.label_format()).to_string())
}

/// Dense bucket counts over the spec window: every bucket between
/// `started_at` and `ended_at` is present, zero-count buckets included.
pub(crate) fn fetch_timeseries(
    conn: &Connection,
    table: &str,
    spec: &FilterSpec,
    interval: Interval,
) -> Result<BTreeMap<String, u64>> {
    let sql = format!(
        "SELECT startedAt FROM \"{table}\"
         WHERE endedAt <= ?1 AND startedAt >= ?2
         ORDER BY startedAt ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let stamps = stmt
        .query_map(params![spec.ended_at, spec.started_at], |row| {
            row.get::<_, f64>(0)
        })?
        .collect::<rusqlite::Result<Vec<f64>>>()?;

    let mut series = BTreeMap::new();
    let step = interval.step_secs();
    let mut t = spec.started_at as i64;
    let end = spec.ended_at as i64;
    while t <= end {
        if let Some(label) = bucket_label(t, interval) {
            series.insert(label, 0);
        }
        t += step;
    }
    for stamp in stamps {
        if let Some(label) = bucket_label(stamp as i64, interval) {
            *series.entry(label).or_insert(0) += 1;
        }
    }
    Ok(series)
}

pub(crate) fn fetch_method_distribution(
    conn: &Connection,
    table: &str,
    spec: &FilterSpec,
) -> Result<BTreeMap<String, u64>> {
    let sql = format!(
        "SELECT method, count(id) FROM \"{table}\"
         WHERE endedAt <= ?1 AND startedAt >= ?2
         GROUP BY method"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![spec.ended_at, spec.started_at], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    let mut distribution = BTreeMap::new();
    for row in rows {
        let (method, count) = row?;
        distribution.insert(method, count);
    }
    Ok(distribution)
}

/// Deletes every measurement and resets the retention baseline, as one
/// transaction. Idempotent.
pub(crate) fn truncate_all(conn: &mut Connection, table: &str) -> Result<bool> {
    let meta = meta_table(table);
    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
    tx.execute(
        &format!("UPDATE \"{meta}\" SET lastRetentionDeletionTime = 0 WHERE id = 1"),
        [],
    )?;
    tx.commit()?;
    Ok(true)
}

pub(crate) fn delete_record(conn: &Connection, table: &str, id: i64) -> Result<bool> {
    let affected = conn.execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), params![id])?;
    Ok(affected > 0)
}

/// One retention pass under an exclusive transaction scoped to the
/// metadata row. Updates the deletion timestamp and removes expired
/// measurements atomically, or rolls back untouched when the pass ran
/// within the last quarter period. The caller decides whether a busy
/// lock is an error or a plain `false`.
pub(crate) fn retention_sweep(
    conn: &mut Connection,
    table: &str,
    period_s: f64,
    now: f64,
) -> Result<bool> {
    let meta = meta_table(table);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let last: f64 = tx.query_row(
        &format!("SELECT lastRetentionDeletionTime FROM \"{meta}\" WHERE id = 1"),
        [],
        |row| row.get(0),
    )?;
    if last + period_s / 4.0 >= now {
        return Ok(false);
    }
    tx.execute(
        &format!("UPDATE \"{meta}\" SET lastRetentionDeletionTime = ?1 WHERE id = 1"),
        params![now],
    )?;
    let removed = tx.execute(
        &format!("DELETE FROM \"{table}\" WHERE startedAt + ?1 < ?2"),
        params![period_s, now],
    )?;
    tx.commit()?;
    debug!(removed, "retention sweep removed expired measurements");
    Ok(true)
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
