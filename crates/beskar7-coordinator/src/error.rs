use beskar7_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("machine {0} has no uid; refusing to claim")]
    MissingMachineUid(String),
}
