//! Error types for the enforcement engine
//!
//! This module defines the errors that can occur while reading, writing or
//! propagating enforcement state.

use sqlx::error::DatabaseError;
use thiserror::Error;

/// Errors that can occur during enforcement operations
#[derive(Debug, Error)]
pub enum EnforcementError {
    // === Store ===
    /// The durable store could not be reached in time (pool exhausted, I/O, closed)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A uniqueness constraint was hit, meaning two writers raced past coordination
    #[error("Conflict violation: {0}")]
    ConflictViolation(String),

    /// Enforcement record not found
    #[error("Enforcement record not found: {0}")]
    RecordNotFound(String),

    /// Any other database failure (schema, decoding, protocol)
    #[error("Database error: {0}")]
    Database(String),

    // === Propagation ===
    /// The change watermark fell further behind than the configured threshold
    #[error("Propagation lag exceeded: {lag_ms}ms behind at watermark {watermark}")]
    PropagationLagExceeded { lag_ms: u64, watermark: u64 },

    // === State machine ===
    /// Invalid state transition attempted
    #[error("Invalid state transition")]
    InvalidStateTransition,

    /// Action validation failed
    #[error("Action validation failed: {0}")]
    ValidationFailed(String),

    // === Engine ===
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// start/stop called out of order
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("Enforcement error: {0}")]
    Other(String),
}

impl EnforcementError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Pool exhaustion, lock contention and connection loss are transient;
    /// everything else is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Another writer held the lock for longer than the driver was willing to wait
#[cfg_attr(not(any(feature = "sqlite", feature = "mysql")), allow(unused_variables))]
fn is_lock_contention(db: &(dyn DatabaseError + 'static)) -> bool {
    #[cfg(feature = "sqlite")]
    {
        if db.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
            // Extended result codes keep the primary code in the low byte:
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            return db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6));
        }
    }
    #[cfg(feature = "mysql")]
    {
        if let Some(mysql) = db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
            // ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK
            return matches!(mysql.number(), 1205 | 1213);
        }
    }
    false
}

/// Classify driver errors into the engine's taxonomy
impl From<sqlx::Error> for EnforcementError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::StoreUnavailable("connection pool timed out".into()),
            sqlx::Error::PoolClosed => Self::StoreUnavailable("connection pool closed".into()),
            sqlx::Error::WorkerCrashed => Self::StoreUnavailable("database worker crashed".into()),
            sqlx::Error::Io(e) => Self::StoreUnavailable(e.to_string()),
            sqlx::Error::Tls(e) => Self::StoreUnavailable(e.to_string()),
            sqlx::Error::RowNotFound => Self::RecordNotFound("row not found".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::ConflictViolation(db.message().to_string())
            }
            sqlx::Error::Database(db) if is_lock_contention(db.as_ref()) => {
                Self::StoreUnavailable(db.message().to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

/// Convert a string into an EnforcementError
impl From<String> for EnforcementError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for enforcement operations
pub type EnforcementResult<T> = Result<T, EnforcementError>;
