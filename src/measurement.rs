//! Measurement records and the timing/rounding contract.
//!
//! A [`Measurement`] is captured on the recording path; once a backend
//! assigns an identity it becomes a [`MeasurementRecord`]. Elapsed time is
//! rounded twice on purpose: half-up to six decimal places when the call
//! completes, then *up* to four decimal places at persistence so a stored
//! duration is never an undercount.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decimal places kept when a measurement completes.
const CAPTURE_DECIMALS: i32 = 6;
/// Decimal places kept by storage backends (ceiling-rounded).
const PERSIST_DECIMALS: i32 = 4;

/// Current wall-clock time as Unix epoch seconds.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn round_half_up(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Ceiling-round to `decimals` places. Biases durations upward so that a
/// persisted elapsed time never undercounts the real one. The epsilon
/// keeps binary representation noise from pushing an exact decimal value
/// across the ceiling boundary.
pub(crate) fn round_up(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale - 1e-9).ceil() / scale
}

pub(crate) fn persisted_elapsed(elapsed: f64) -> f64 {
    round_up(elapsed, PERSIST_DECIMALS)
}

/// One completed call, captured by the recorder and not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Logical identifier: a route template or an explicit label.
    pub name: String,
    /// HTTP verb or caller-supplied tag such as `"call"`.
    pub method: String,
    /// Positional call arguments, serialized opaquely (JSON array).
    pub args: Value,
    /// Named call arguments, serialized opaquely (JSON object).
    pub kwargs: Value,
    /// Auxiliary caller-supplied metadata (url, headers, remote address...).
    pub context: Value,
    /// Wall-clock start, Unix epoch seconds.
    pub started_at: f64,
    /// Wall-clock end, Unix epoch seconds.
    pub ended_at: f64,
    /// `ended_at - started_at`, rounded half-up to six decimal places.
    pub elapsed: f64,
    /// Opaque blob from an external stack sampler, when one is attached.
    pub profile_stats: Option<Value>,
}

impl Measurement {
    /// Starts a measurement, stamping `started_at` with the current wall
    /// clock. Timing begins here; ignore/sampling decisions happen earlier.
    pub fn begin(
        name: impl Into<String>,
        method: impl Into<String>,
        args: Value,
        kwargs: Value,
        context: Value,
    ) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            args,
            kwargs,
            context,
            started_at: epoch_now(),
            ended_at: 0.0,
            elapsed: 0.0,
            profile_stats: None,
        }
    }

    /// Stamps `ended_at` and computes the capture-precision elapsed time.
    pub fn finish(&mut self) {
        self.ended_at = epoch_now();
        self.elapsed = round_half_up(self.ended_at - self.started_at, CAPTURE_DECIMALS);
    }

    /// True when both timing stamps are present. A guard finishing a
    /// measurement that was never started is a logic error to surface,
    /// not a record to zero-fill.
    pub fn has_timing(&self) -> bool {
        self.started_at > 0.0 && self.ended_at > 0.0
    }
}

/// A persisted measurement with its storage-assigned identity.
///
/// The `id` is unique, monotonic, and immutable once assigned. `elapsed`
/// holds the four-decimal ceiling-rounded value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    /// Storage-assigned identity.
    pub id: i64,
    /// Logical identifier.
    pub name: String,
    /// HTTP verb or caller-supplied tag.
    pub method: String,
    /// Positional arguments as stored (JSON array).
    pub args: Value,
    /// Named arguments as stored (JSON object).
    pub kwargs: Value,
    /// Auxiliary metadata as stored (JSON object).
    pub context: Value,
    /// Wall-clock start, Unix epoch seconds.
    pub started_at: f64,
    /// Wall-clock end, Unix epoch seconds.
    pub ended_at: f64,
    /// Duration, ceiling-rounded to four decimal places.
    pub elapsed: f64,
    /// Opaque sampler blob, when one was captured.
    pub profile_stats: Option<Value>,
}

/// One `(method, name)` aggregation row produced by summary queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    /// Method tag of the group.
    pub method: String,
    /// Logical name of the group.
    pub name: String,
    /// Number of measurements in the group.
    pub count: u64,
    /// Smallest elapsed time in the group.
    pub min_elapsed: f64,
    /// Largest elapsed time in the group.
    pub max_elapsed: f64,
    /// Mean elapsed time in the group.
    pub avg_elapsed: f64,
}
