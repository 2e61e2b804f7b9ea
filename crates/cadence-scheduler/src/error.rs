use rusqlite::ErrorCode;
use thiserror::Error;

use cadence_core::types::TemplateId;
use cadence_core::CoreError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage could not be reached (dropped connection, timeout, poisoned handle).
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// `interval_code = custom` without an expression. The template gets disabled.
    #[error("Empty custom schedule expression")]
    EmptyCustomSchedule,

    /// The expression could not be normalized or was rejected by the evaluator.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// A persisted timestamp did not parse as RFC 3339.
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("Run template not found: {id}")]
    TemplateNotFound { id: TemplateId },

    /// The job-preparation collaborator refused or failed to create the job.
    #[error("Job preparation failed: {0}")]
    JobPreparation(String),

    /// The database never became reachable during startup.
    #[error("Storage unreachable after {attempts} attempts: {reason}")]
    StartupFailed { attempts: u32, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    /// Whether the error means storage is unreachable, as opposed to a problem
    /// with one template or row. Connectivity errors abort the current pass and
    /// send the daemon into reconnect; everything else is handled per template.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SchedulerError::Unavailable(_) => true,
            SchedulerError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                )
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
