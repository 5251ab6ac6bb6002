//! Error types for the uploader

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Uploader result type
pub type Result<T> = std::result::Result<T, UploaderError>;

/// Errors that can occur during an upload run
///
/// Per-item upload and publish failures are not errors: they are collected
/// into a [`RunErrorSummary`](crate::report::RunErrorSummary) and surfaced
/// through [`UploaderError::RunFailed`] once the run has finished.
#[derive(Error, Debug)]
pub enum UploaderError {
    /// Parameter store request failed
    #[error("Parameter store error: {0}")]
    Store(String),

    /// Required parameter is absent from the store
    #[error("Parameter {0} not found")]
    MissingParameter(String),

    /// Stored counter is not an integer
    #[error("Parameter {key} holds a non-numeric value: {value:?}")]
    InvalidCounter { key: String, value: String },

    /// Conditional counter update kept losing to concurrent writers
    #[error("Gave up updating {key} after {attempts} conflicting writes")]
    WriteConflict { key: String, attempts: u32 },

    /// Lock was not acquired within the configured wait
    #[error("Timed out after {waited:?} waiting for lock {name}")]
    LockTimeout { name: String, waited: Duration },

    /// Object store request failed
    #[error("S3 error: {0}")]
    ObjectStore(String),

    /// Message bus request failed
    #[error("SNS error: {0}")]
    MessageBus(String),

    /// No topic matched the alert topic token
    #[error("No SNS topic matches {0:?}")]
    TopicNotFound(String),

    /// IO error with the offending path
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timestamp not in `YYYYMMDDTHHMMSS` form
    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// Input file has no entry for this job
    #[error("Input {path} has no timestamps for job index {job_index}")]
    MissingJob { path: PathBuf, job_index: i64 },

    /// The run finished with granule failures and the alert was sent
    #[error(
        "Run finished with {missing_checksum} missing checksum(s), \
         {upload} failed upload(s), {publish} failed publish(es)"
    )]
    RunFailed {
        missing_checksum: usize,
        upload: usize,
        publish: usize,
    },
}

impl UploaderError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Convert from an SSM SDK error
    pub fn from_ssm<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        Self::Store(aws_sdk_ssm::error::DisplayErrorContext(err).to_string())
    }

    /// Convert from an S3 SDK error
    pub fn from_s3<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        Self::ObjectStore(aws_sdk_s3::error::DisplayErrorContext(err).to_string())
    }

    /// Convert from an SNS SDK error
    pub fn from_sns<E>(err: E) -> Self
    where
        E: std::error::Error,
    {
        Self::MessageBus(aws_sdk_sns::error::DisplayErrorContext(err).to_string())
    }

    /// Whether this error aborted the run, as opposed to the failure report
    /// that ends a run which completed with per-granule failures
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RunFailed { .. })
    }
}
