//! Error types for nano-gcp-reporting.
//! (C) 2025 Enzo Lombardi

use thiserror::Error;

/// Failure modes of a metadata-service lookup.
///
/// Only [`MetadataError::Timeout`] is tolerated during reporter construction;
/// every other variant aborts it.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// The metadata service did not answer within the discovery timeout.
    #[error("metadata lookup timed out")]
    Timeout,

    /// The request failed before a response arrived (DNS, connect, TLS, body).
    #[error("metadata request failed: {0}")]
    Request(reqwest::Error),

    /// The metadata service answered with a non-success status.
    #[error("metadata service returned status {0}")]
    Status(reqwest::StatusCode),
}

impl MetadataError {
    /// True for the one failure mode construction swallows.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MetadataError::Timeout)
    }
}

/// Main error type for the nano-gcp-reporting library.
///
/// Construction-time failures are the only ones callers ever see;
/// once a reporter exists, reporting degrades to stderr instead of failing.
#[derive(Error, Debug)]
pub enum Error {
    /// Metadata discovery failed with something other than a timeout.
    #[error("metadata discovery failed: {0}")]
    Discovery(#[from] MetadataError),

    /// Connecting or authenticating against the backend failed.
    #[error("backend connection failed: {0}")]
    Connection(String),

    /// A publish attempt was rejected or could not reach the backend.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A publish was attempted on a handle that was already stopped.
    #[error("publish handle is stopped")]
    Stopped,
}

/// Result type alias for nano-gcp-reporting.
pub type Result<T> = std::result::Result<T, Error>;
