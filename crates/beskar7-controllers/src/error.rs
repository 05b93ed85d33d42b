use beskar7_coordinator::ClaimError;
use beskar7_domain::{DomainError, ErrorKind};
use beskar7_redfish::RedfishError;
use beskar7_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("redfish error: {0}")]
    Redfish(#[from] RedfishError),

    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("validation error: {0}")]
    Validation(#[from] DomainError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Store(e) => e.kind(),
            ReconcileError::Redfish(e) => e.kind(),
            ReconcileError::Claim(ClaimError::Store(e)) => e.kind(),
            ReconcileError::Claim(ClaimError::MissingMachineUid(_)) => ErrorKind::Validation,
            ReconcileError::Validation(e) => e.kind(),
            ReconcileError::Internal(_) => ErrorKind::Unknown,
        }
    }
}
