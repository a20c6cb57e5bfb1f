//! Error types for the scheduler core.
//!
//! Library code returns one of these enums so callers can match on the
//! failure kind; the binary's command layer wraps them in `anyhow` and
//! flattens the result into the JSON envelope (see `schema::ErrorResponse`).

use thiserror::Error;

/// Failures from the streaming JSON decoder (component A).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected byte 0x{byte:02x} at offset {offset}: expected {expected}")]
    UnexpectedByte {
        byte: u8,
        offset: u64,
        expected: &'static str,
    },
    #[error("unexpected end of input while parsing a value (offset {offset})")]
    UnexpectedEof { offset: u64 },
    #[error("invalid UTF-8 sequence in string literal at offset {offset}")]
    InvalidUtf8 { offset: u64 },
    #[error("invalid \\u escape at offset {offset}")]
    InvalidUnicodeEscape { offset: u64 },
    #[error("io error reading input: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from the spawner (component C).
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    ForkFailed(String),
    #[error("exec failed: {0}")]
    ExecFailed(String),
    #[error("job directory {0} could not be created")]
    JobDirUnavailable(std::path::PathBuf),
}

/// Failures reported by the resource manager (component D).
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource name {0:?} appears more than once across exclusive/shared")]
    DuplicateResource(String),
    #[error("job {0} not found in its own queue for resource {1:?} (internal error)")]
    MissingFromQueue(String, String),
}

/// Failures from the worker-side wrapper (component B).
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("cannot chdir into job directory {0}: {1}")]
    ChdirFailed(std::path::PathBuf, std::io::Error),
    #[error("cannot redirect output to {0}: {1}")]
    RedirectFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to write result file {0}: {1}")]
    ResultWriteFailed(std::path::PathBuf, std::io::Error),
    #[error("unknown job type {0:?}")]
    UnknownJobType(String),
}

/// Failures from the durable store (the external "database" collaborator).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request {0} not found")]
    RequestNotFound(i64),
    #[error("job {0} not found")]
    JobNotFound(i64),
}

// Request-processing failures (Phase 2 of the loop) never abort the tick;
// they are recorded as a plain message on the `Request.result` column, which
// is itself a display string rather than a typed result. `process_submit`
// writes those messages directly instead of routing through an error enum.
