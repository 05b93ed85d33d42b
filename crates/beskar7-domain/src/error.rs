use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, independent of which component produced it.
/// Drives the retry policy and the per-kind error metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Validation,
    Connection,
    Timeout,
    Query,
    Address,
    Power,
    Boot,
    VirtualMedia,
    Unknown,
}

impl ErrorKind {
    /// Whether the retry envelope applies. `Unknown` is retried like
    /// `Transient`, within the same capped budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::Query
                | ErrorKind::Unknown
        )
    }

    /// Kinds that, once retries are exhausted, park the host in `Error`
    /// until an operator clears it.
    pub fn is_terminal_after_retries(self) -> bool {
        matches!(
            self,
            ErrorKind::Permanent | ErrorKind::Power | ErrorKind::Boot | ErrorKind::VirtualMedia
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Validation => "validation",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Query => "query",
            ErrorKind::Address => "address",
            ErrorKind::Power => "power",
            ErrorKind::Boot => "boot",
            ErrorKind::VirtualMedia => "virtual_media",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid provider id: {0}")]
    InvalidProviderId(String),

    #[error("invalid redfish address '{0}': expected an http(s) URL")]
    InvalidRedfishAddress(String),

    #[error("invalid failure domain label '{label}': {message}")]
    InvalidFailureDomainLabel { label: String, message: String },

    #[error("too many failure domain labels: {count} (max {max})")]
    TooManyFailureDomainLabels { count: usize, max: usize },

    #[error("provisioning mode RemoteConfig requires a configURL")]
    MissingConfigUrl,

    #[error("provisioning mode PreBakedISO must not set a configURL")]
    UnexpectedConfigUrl,
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::InvalidRedfishAddress(_) => ErrorKind::Address,
            _ => ErrorKind::Validation,
        }
    }
}
