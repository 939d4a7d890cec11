//! Profiler configuration: serde structs, TOML loading, and validation.
//!
//! Configuration is flat data validated once at initialization. Knobs that
//! are code rather than data (the sampling predicate, the external stack
//! sampler) attach through [`crate::Builder`] methods instead.

use regex::Regex;
use serde::Deserialize;

use crate::error::{ProfilerError, Result};

/// Default retention window: one month, in seconds.
pub const DEFAULT_RETENTION_PERIOD_S: f64 = 2_629_743.0;

/// Which storage backend the factory opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    /// One serialized connection behind a mutex.
    Sqlite,
    /// A sized pool of WAL-mode connections to one database file.
    Pooled,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend engine to open.
    pub engine: StorageEngine,
    /// Database file path; `":memory:"` opens a transient database
    /// (sqlite engine only).
    pub path: String,
    /// Measurements table name. The metadata table derives from it.
    pub table: String,
    /// Pooled engine: number of connections kept open.
    pub pool_size: u32,
    /// Pooled engine: extra connections allowed beyond `pool_size`,
    /// discarded on return.
    pub max_overflow: u32,
    /// Pooled engine: connections older than this many seconds are
    /// reopened on checkout. `None` disables recycling.
    pub recycle_secs: Option<u64>,
    /// Pooled engine: validate a connection with a ping query on checkout.
    pub pre_ping: bool,
    /// Whether retention deletion runs at all.
    pub retention_enabled: bool,
    /// Maximum record age in seconds before retention deletes it.
    pub retention_period_s: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngine::Sqlite,
            path: "lapse.db".to_string(),
            table: "measurements".to_string(),
            pool_size: 5,
            max_overflow: 10,
            recycle_secs: None,
            pre_ping: true,
            retention_enabled: false,
            retention_period_s: DEFAULT_RETENTION_PERIOD_S,
        }
    }
}

/// Basic-auth credentials for the query surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    /// Whether basic auth protects the query surface.
    pub enabled: bool,
    /// Expected username.
    pub username: String,
    /// Expected password.
    pub password: String,
}

/// Top-level profiler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Master switch. Disabled instances never open storage and record
    /// nothing.
    pub enabled: bool,
    /// Dump each completed record through `tracing::debug!`.
    pub verbose: bool,
    /// Regex patterns; a logical name matching any of them (search
    /// semantics, not full match) is never recorded.
    pub ignore: Vec<String>,
    /// Storage backend settings.
    pub storage: StorageConfig,
    /// Query-surface auth settings.
    pub basic_auth: BasicAuthConfig,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verbose: false,
            ignore: Vec::new(),
            storage: StorageConfig::default(),
            basic_auth: BasicAuthConfig::default(),
        }
    }
}

impl ProfilerConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProfilerError::Config(e.to_string()))
    }

    /// Validates the configuration. Called once at initialization; any
    /// failure here is fatal and the instance never reaches Ready.
    pub fn validate(&self) -> Result<()> {
        if !valid_table_name(&self.storage.table) {
            return Err(ProfilerError::Config(format!(
                "invalid table name: {:?}",
                self.storage.table
            )));
        }
        for pattern in &self.ignore {
            Regex::new(pattern).map_err(|e| {
                ProfilerError::Config(format!("invalid ignore pattern {pattern:?}: {e}"))
            })?;
        }
        if self.storage.engine == StorageEngine::Pooled {
            if self.storage.path == ":memory:" {
                return Err(ProfilerError::Config(
                    "pooled engine cannot use an in-memory database".to_string(),
                ));
            }
            if self.storage.pool_size == 0 {
                return Err(ProfilerError::Config(
                    "pool_size must be at least 1".to_string(),
                ));
            }
        }
        if self.storage.retention_enabled && self.storage.retention_period_s <= 0.0 {
            return Err(ProfilerError::Config(
                "retention_period_s must be positive".to_string(),
            ));
        }
        if self.basic_auth.enabled
            && (self.basic_auth.username.is_empty() || self.basic_auth.password.is_empty())
        {
            return Err(ProfilerError::Config(
                "basic_auth requires username and password".to_string(),
            ));
        }
        Ok(())
    }
}

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
