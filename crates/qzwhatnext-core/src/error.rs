//! Core error types for qzwhatnext-core.
//!
//! This module defines the error hierarchy using thiserror. Component-local
//! errors (`SyncError`, `AvailabilityError`, `InferenceError`) convert into
//! `CoreError` at the pipeline boundary.

use thiserror::Error;

/// Core error type for qzwhatnext-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A write violated a hard constraint (dependency cycle, invalid
    /// duration, inconsistent flexibility window). Surfaced to the caller at
    /// write time and never swallowed.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(#[from] ConstraintViolation),

    /// The auth collaborator revoked access; the rebuild aborts and the user
    /// must reconnect.
    #[error("Unauthorized: access to the external calendar was revoked")]
    Unauthorized,

    /// External calendar reads failed beyond the snapshot staleness
    /// tolerance. The rebuild aborts and the last good schedule is kept.
    #[error("Availability unavailable: {0}")]
    AvailabilityUnavailable(String),

    /// Inference call failed or produced no usable proposals. Non-fatal at
    /// the pipeline level; recorded here only when a caller asks for it.
    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    /// External event diverged in a way the import rules do not cover.
    #[error("Sync conflict on event {event_id}: {message}")]
    SyncConflict { event_id: String, message: String },

    /// A rebuild was cancelled cooperatively at a suspension point.
    #[error("Rebuild cancelled")]
    Cancelled,

    /// Entity lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hard-constraint violations detected at write time.
#[derive(Error, Debug)]
pub enum ConstraintViolation {
    #[error("dependency cycle through task {task_id}")]
    DependencyCycle { task_id: String },

    #[error("duration {minutes} min outside allowed range [{min}, {max}]")]
    InvalidDuration { minutes: u32, min: u32, max: u32 },

    #[error("start_after {start_after} is later than deadline {deadline}")]
    StartAfterBeyondDeadline {
        start_after: chrono::NaiveDate,
        deadline: chrono::DateTime<chrono::Utc>,
    },

    #[error("flexibility window end {end} not after start {start}")]
    EmptyFlexibilityWindow {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    #[error("flexibility window does not contain [start_after, deadline]")]
    FlexibilityWindowTooNarrow,

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("duplicate task for dedupe key {key}")]
    Duplicate { key: String },
}

/// Result type alias for CoreError.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
