use crate::error::DomainError;
use crate::types::{Beskar7Cluster, Beskar7Machine, ProvisioningMode};

pub const MAX_FAILURE_DOMAIN_LABELS: usize = 5;

/// Admission-style validation of a machine spec.
pub fn validate_machine(machine: &Beskar7Machine) -> Result<(), DomainError> {
    match machine.spec.provisioning_mode {
        ProvisioningMode::RemoteConfig => {
            if machine
                .spec
                .config_url
                .as_deref()
                .map_or(true, str::is_empty)
            {
                return Err(DomainError::MissingConfigUrl);
            }
        }
        ProvisioningMode::PreBakedIso => {
            if machine.spec.config_url.is_some() {
                return Err(DomainError::UnexpectedConfigUrl);
            }
        }
    }
    Ok(())
}

/// Admission-style validation of a cluster spec.
pub fn validate_cluster(cluster: &Beskar7Cluster) -> Result<(), DomainError> {
    let labels = &cluster.spec.failure_domain_labels;
    if labels.len() > MAX_FAILURE_DOMAIN_LABELS {
        return Err(DomainError::TooManyFailureDomainLabels {
            count: labels.len(),
            max: MAX_FAILURE_DOMAIN_LABELS,
        });
    }
    for label in labels {
        validate_label_key(label)?;
    }
    Ok(())
}

/// Validate a label key of the form `[prefix/]name` where each segment is a
/// DNS-label-style token: alphanumeric, `-`, `.`, `_`, starting and ending
/// alphanumeric, at most 63 chars for the name part.
fn validate_label_key(label: &str) -> Result<(), DomainError> {
    let err = |message: &str| DomainError::InvalidFailureDomainLabel {
        label: label.to_string(),
        message: message.to_string(),
    };

    let name = match label.rsplit_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() {
                return Err(err("empty prefix"));
            }
            name
        }
        None => label,
    };

    if name.is_empty() {
        return Err(err("empty name"));
    }
    if name.len() > 63 {
        return Err(err("name longer than 63 characters"));
    }
    let valid_inner = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_';
    if !name.chars().all(valid_inner) {
        return Err(err("name contains invalid characters"));
    }
    let starts_ok = name.chars().next().map_or(false, |c| c.is_ascii_alphanumeric());
    let ends_ok = name.chars().last().map_or(false, |c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(err("name must start and end with an alphanumeric character"));
    }
    Ok(())
}

pub fn validate_redfish_address(address: &str) -> Result<(), DomainError> {
    if address.starts_with("http://") || address.starts_with("https://") {
        Ok(())
    } else {
        Err(DomainError::InvalidRedfishAddress(address.to_string()))
    }
}

/// True when every selector entry is present with the same value in `labels`.
pub fn selector_matches(
    selector: &std::collections::BTreeMap<String, String>,
    labels: &std::collections::BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map_or(false, |lv| lv == v))
}
