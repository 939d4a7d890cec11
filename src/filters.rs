//! Query filters, sort sanitization, and timeseries intervals.
//!
//! Filter input arrives either as a typed [`FilterSpec`] or as the flat
//! string-keyed parameters an external dashboard layer forwards. Sort
//! tokens are sanitized against per-operation allow-lists: an unknown
//! field or direction falls back to the operation default instead of
//! erroring, and only allow-listed identifiers ever reach ORDER BY text.

use std::collections::HashMap;

use crate::measurement::epoch_now;

/// Default query window reaches this far into the past.
const DEFAULT_WINDOW_SECS: f64 = 3600.0 * 24.0 * 7.0;
/// Pad on the window end so records inserted while the query runs are seen.
const WINDOW_END_PAD_SECS: f64 = 0.5;
/// Default page size.
const DEFAULT_LIMIT: u64 = 100;

/// Sort fields accepted for raw measurement filtering.
pub(crate) const FILTER_SORT_FIELDS: &[&str] =
    &["id", "startedAt", "endedAt", "elapsed", "method", "name"];
/// Sort fields accepted for summary aggregation.
pub(crate) const SUMMARY_SORT_FIELDS: &[&str] = &[
    "method",
    "name",
    "count",
    "minElapsed",
    "maxElapsed",
    "avgElapsed",
];

/// Sort direction of an ORDER BY clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl SortDirection {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// Granularity of a timeseries query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// One bucket per hour, labeled `YYYY-MM-DD HH`.
    Hourly,
    /// One bucket per day, labeled `YYYY-MM-DD`.
    Daily,
}

impl Interval {
    pub(crate) fn step_secs(self) -> i64 {
        match self {
            Interval::Hourly => 3600,
            Interval::Daily => 3600 * 24,
        }
    }

    pub(crate) fn label_format(self) -> &'static str {
        match self {
            Interval::Hourly => "%Y-%m-%d %H",
            Interval::Daily => "%Y-%m-%d",
        }
    }

    /// Parses the flat `interval` parameter; anything but `daily` is hourly.
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("daily") => Interval::Daily,
            _ => Interval::Hourly,
        }
    }
}

/// Ephemeral query input for filter, summary, and distribution operations.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    /// Window start (inclusive), Unix epoch seconds.
    pub started_at: f64,
    /// Window end (inclusive), Unix epoch seconds.
    pub ended_at: f64,
    /// Minimum elapsed time, when set.
    pub elapsed_min: Option<f64>,
    /// Exact-match method tag, when set.
    pub method: Option<String>,
    /// Exact-match logical name, when set.
    pub name: Option<String>,
    /// Raw sort field token; sanitized per operation before use.
    pub sort_field: String,
    /// Raw sort direction token; sanitized per operation before use.
    pub sort_direction: Option<SortDirection>,
    /// Rows to skip (pagination offset).
    pub skip: u64,
    /// Maximum rows to return.
    pub limit: u64,
}

impl Default for FilterSpec {
    fn default() -> Self {
        let now = epoch_now();
        Self {
            started_at: now - DEFAULT_WINDOW_SECS,
            ended_at: now + WINDOW_END_PAD_SECS,
            elapsed_min: None,
            method: None,
            name: None,
            sort_field: "endedAt".to_string(),
            sort_direction: Some(SortDirection::Desc),
            skip: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl FilterSpec {
    /// Builds a spec from the flat string-keyed parameters of the outbound
    /// query surface. Unparsable values fall back to their defaults; this
    /// path must never error on operator input.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let mut spec = Self::default();
        if let Some(v) = params.get("startedAt").and_then(|v| v.parse().ok()) {
            spec.started_at = v;
        }
        if let Some(v) = params.get("endedAt").and_then(|v| v.parse().ok()) {
            spec.ended_at = v;
        }
        if let Some(v) = params.get("elapsed").and_then(|v| v.parse().ok()) {
            spec.elapsed_min = Some(v);
        }
        if let Some(v) = params.get("method").filter(|v| !v.is_empty()) {
            spec.method = Some(v.clone());
        }
        if let Some(v) = params.get("name").filter(|v| !v.is_empty()) {
            spec.name = Some(v.clone());
        }
        if let Some(sort) = params.get("sort") {
            let mut parts = sort.splitn(2, ',');
            if let Some(field) = parts.next() {
                spec.sort_field = field.trim().to_string();
            }
            spec.sort_direction = parts.next().and_then(SortDirection::parse);
        }
        if let Some(v) = params.get("skip").and_then(|v| v.parse().ok()) {
            spec.skip = v;
        }
        if let Some(v) = params.get("limit").and_then(|v| v.parse().ok()) {
            spec.limit = v;
        }
        spec
    }

    /// Resolves the sort token against an allow-list. Unknown fields or
    /// directions collapse to the supplied defaults; the returned field is
    /// always one of `allowed` and safe to interpolate into ORDER BY.
    pub(crate) fn sanitized_sort(
        &self,
        allowed: &'static [&'static str],
        default_field: &'static str,
        default_direction: SortDirection,
    ) -> (&'static str, SortDirection) {
        let requested = if self.sort_field.eq_ignore_ascii_case("id") {
            "id"
        } else {
            self.sort_field.as_str()
        };
        let field = allowed
            .iter()
            .find(|f| **f == requested)
            .copied()
            .unwrap_or(default_field);
        let direction = self.sort_direction.unwrap_or(default_direction);
        (field, direction)
    }
}
