use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error response from the cluster API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Whether the error means the requested resource version is no longer available
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}

/// The error taxonomy shared by every overlook component
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A lookup by id or key found nothing
    #[error("{0} not found")]
    NotFound(String),

    /// A session request was malformed and rejected before allocating anything
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The cluster API could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The cluster API answered with a structured error
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// An invariant was violated
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A stable machine-readable code for the error
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::InvalidTarget(_) => "InvalidTarget",
            Error::UpstreamUnavailable(_) | Error::Api(_) => "UpstreamUnavailable",
            Error::Internal(_) => "Internal",
        }
    }
}
