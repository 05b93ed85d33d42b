use crate::error::DomainError;

/// Provider-ID prefix. Four slashes, kept verbatim for wire compatibility
/// with existing consumers.
pub const PROVIDER_ID_PREFIX: &str = "b7:////";

/// Render the provider ID for a bound host: `b7:////<namespace>/<name>`.
pub fn format_provider_id(namespace: &str, host_name: &str) -> String {
    format!("{}{}/{}", PROVIDER_ID_PREFIX, namespace, host_name)
}

/// Split a provider ID back into `(namespace, host_name)`.
pub fn parse_provider_id(provider_id: &str) -> Result<(String, String), DomainError> {
    let rest = provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .ok_or_else(|| DomainError::InvalidProviderId(provider_id.to_string()))?;
    match rest.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err(DomainError::InvalidProviderId(provider_id.to_string())),
    }
}
