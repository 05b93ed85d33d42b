use crate::types::HostState;

/// Legal lifecycle transitions for a [`crate::PhysicalHost`].
///
/// ```text
/// None → Enrolling
/// Enrolling → Available | Error
/// Available → Claimed | Deprovisioning | Error
/// Claimed → Provisioning | Available (release) | Error
/// Provisioning → Provisioned | Error
/// Provisioned → Deprovisioning | Error
/// Deprovisioning → Available | Error
/// Error → Enrolling (operator-initiated clear)
/// Unknown → Enrolling
/// ```
///
/// Everything else is rejected; a reconciler that would perform an illegal
/// transition no-ops instead.
pub fn transition_allowed(from: HostState, to: HostState) -> bool {
    use HostState::*;
    matches!(
        (from, to),
        (None, Enrolling)
            | (Enrolling, Available)
            | (Enrolling, Error)
            | (Available, Claimed)
            | (Available, Deprovisioning)
            | (Available, Error)
            | (Claimed, Provisioning)
            | (Claimed, Available)
            | (Claimed, Error)
            | (Provisioning, Provisioned)
            | (Provisioning, Error)
            | (Provisioned, Deprovisioning)
            | (Provisioned, Error)
            | (Deprovisioning, Available)
            | (Deprovisioning, Error)
            | (Error, Enrolling)
            | (Unknown, Enrolling)
    )
}

impl HostState {
    /// See [`transition_allowed`].
    pub fn permits(self, next: HostState) -> bool {
        transition_allowed(self, next)
    }

    /// States that imply a live claim: a consumer ref must be present
    /// whenever the host is in one of these.
    pub fn requires_consumer(self) -> bool {
        matches!(
            self,
            HostState::Claimed | HostState::Provisioning | HostState::Provisioned
        )
    }
}
