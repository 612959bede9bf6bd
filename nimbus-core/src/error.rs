//! Error types.
//!
//! Job construction is all-or-nothing: every failure surfaces as a single
//! [`JobError`] returned from the builder call, and nothing partially built is
//! handed back. Collaborators ([`Storage`](crate::storage::Storage),
//! [`ComputeBackend`](crate::compute::ComputeBackend)) report plain
//! [`anyhow::Error`]s, which are mapped into this taxonomy at the boundary
//! where the pipeline knows what the failing step was.
//!
//! Dispatch failures are reported per call as [`DispatchError`] and never
//! abort sibling calls. Cleanup failures ([`CleanupError`]) are only ever
//! logged.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Error, Debug)]
pub enum JobError {
    /// Unknown backend, unknown environment kind, or a backend that failed to
    /// construct.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Arguments don't match the declared parameters of the function, or a
    /// chunk specification sets both a size and a count.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A declared module is neither in the catalog nor preinstalled or
    /// excluded.
    #[error("module resolution failed: {0}")]
    Resolution(String),

    #[error("serialization failed: {0}")]
    Serialization(#[source] anyhow::Error),

    #[error(
        "job {executor_id}/{job_id} is too large: {size} bytes exceeds the limit of {limit} bytes"
    )]
    SizeLimitExceeded {
        executor_id: String,
        job_id: String,
        size: u64,
        limit: u64,
    },

    /// An input object could not be found or measured.
    #[error("object unavailable: {reference}")]
    ObjectUnavailable {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upload of {key} failed")]
    Upload {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl JobError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }
}

/// A failure to dispatch one call of a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dispatch of call {call_index} of {executor_id}/{job_id} failed: {reason}")]
pub struct DispatchError {
    pub executor_id: String,
    pub job_id: String,
    pub call_index: usize,
    pub reason: String,
}

/// A failure to remove a job's artifacts.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("failed to delete artifacts of {executor_id}/{job_id}")]
    Delete {
        executor_id: String,
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed cleanup request {path}")]
    MalformedRequest {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
