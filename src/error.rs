use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Errors surfaced by the profiler and its storage backends.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend is closed")]
    StorageClosed,
    #[error("connection pool exhausted ({0} connections in use)")]
    PoolExhausted(u32),
    #[error("profiler is disabled")]
    Disabled,
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

pub(crate) fn acquire_lock<'a, T>(
    mutex: &'a Mutex<T>,
    what: &'static str,
) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        error!("{what} lock poisoned - fatal error");
        ProfilerError::LockPoisoned(what)
    })
}
