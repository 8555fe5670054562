use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Host directory error: {0}")]
    Directory(#[from] LookupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the job queue or its journal backend.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {state}, expected {expected}")]
    InvalidState {
        job_id: String,
        state: String,
        expected: &'static str,
    },

    #[error("Corrupt journal record at byte {offset}: {reason}")]
    CorruptJournal { offset: usize, reason: String },

    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Host directory lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Host not found: {0}")]
    NotFound(String),

    #[error("Host directory unavailable: {0}")]
    Unavailable(String),
}

/// Transport-level failures of a remote session. A non-zero exit status is not
/// a `SessionError`; it is reported through `ExitOutcome::exit_code`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
