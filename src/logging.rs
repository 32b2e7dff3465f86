use crate::enforcement::{EnforcementError, SubjectId};
use crate::{CONSOLE_TARGET, ERROR_TARGET, MUTATION_TARGET};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Mutation log file name
pub const MUTATION_LOG_FILE: &str = "enforcement";

/// Initialize the logging system with console and file outputs
///
/// # Errors
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed
pub fn init(log_dir: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    // Daily rotation
    let mutation_file = RollingFileAppender::new(Rotation::DAILY, log_dir, MUTATION_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // JSON file output for mutation and propagation logs
    let file_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(mutation_file);

    // RUST_LOG wins; otherwise INFO with the driver's per-query chatter filtered out
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("sqlx=warn".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(())
}

/// Log the start of a mutation; returns the start time for [`log_mutation_end`]
pub fn log_mutation_start(subject: SubjectId, operation: &str) -> Instant {
    info!(
        target: MUTATION_TARGET,
        subject_id = %subject,
        operation = %operation,
        event = "start",
        "Mutation started"
    );
    Instant::now()
}

/// Log the end of a mutation
pub fn log_mutation_end(subject: SubjectId, operation: &str, started: Instant, outcome: &str) {
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or_default();
    info!(
        target: MUTATION_TARGET,
        subject_id = %subject,
        operation = %operation,
        outcome = %outcome,
        duration_ms = duration_ms,
        event = "end",
        "Mutation completed"
    );
}

/// Log a failed mutation. Conflicts mean two writers got past coordination
/// and are logged louder than transient store failures.
pub fn log_mutation_error(subject: SubjectId, operation: &str, started: Instant, err: &EnforcementError) {
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or_default();
    match err {
        EnforcementError::ConflictViolation(_) => error!(
            target: ERROR_TARGET,
            subject_id = %subject,
            operation = %operation,
            duration_ms = duration_ms,
            error = %err,
            "Uniqueness conflict during mutation; writers were not serialized"
        ),
        _ => error!(
            target: ERROR_TARGET,
            subject_id = %subject,
            operation = %operation,
            duration_ms = duration_ms,
            retryable = err.is_retryable(),
            error = %err,
            "Mutation failed"
        ),
    }
}

pub fn log_console(message: impl AsRef<str>) {
    info!(
        target: CONSOLE_TARGET,
        message = %message.as_ref(),
        event = "console",
    );
}
