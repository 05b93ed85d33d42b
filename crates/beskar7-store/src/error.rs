use beskar7_domain::{ErrorKind, ObjectKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// CAS rejection: the caller's observed resource version is stale.
    #[error("version conflict on {key}: observed {observed}, current {current}")]
    Conflict {
        key: ObjectKey,
        observed: u64,
        current: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } => ErrorKind::Transient,
            StoreError::NotFound { .. } | StoreError::AlreadyExists { .. } => ErrorKind::Query,
            StoreError::Serialization(_) => ErrorKind::Permanent,
            StoreError::Internal(_) => ErrorKind::Unknown,
        }
    }
}
