use beskar7_domain::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedfishError {
    #[error("connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    #[error("request to {address} timed out")]
    Timeout { address: String },

    #[error("invalid redfish address: {0}")]
    InvalidAddress(String),

    #[error("query failed: {message}")]
    Query { message: String },

    #[error("unexpected status {status} from {path}: {message}")]
    Http {
        status: u16,
        path: String,
        message: String,
    },

    #[error("power operation failed: {message}")]
    Power { message: String },

    #[error("boot configuration failed: {message}")]
    Boot { message: String },

    #[error("virtual media operation failed: {message}")]
    VirtualMedia { message: String },
}

impl RedfishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedfishError::Connection { .. } => ErrorKind::Connection,
            RedfishError::Timeout { .. } => ErrorKind::Timeout,
            RedfishError::InvalidAddress(_) => ErrorKind::Address,
            RedfishError::Query { .. } => ErrorKind::Query,
            // 4xx responses are not going to heal on retry.
            RedfishError::Http { status, .. } if (400..500).contains(status) => ErrorKind::Permanent,
            RedfishError::Http { .. } => ErrorKind::Transient,
            RedfishError::Power { .. } => ErrorKind::Power,
            RedfishError::Boot { .. } => ErrorKind::Boot,
            RedfishError::VirtualMedia { .. } => ErrorKind::VirtualMedia,
        }
    }

    pub(crate) fn from_reqwest(address: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RedfishError::Timeout { address: address.to_string() }
        } else if err.is_connect() {
            RedfishError::Connection { address: address.to_string(), message: err.to_string() }
        } else {
            RedfishError::Query { message: err.to_string() }
        }
    }
}
