//! Name Validators
//!
//! Syntax checks for subject common names and SAN entries.

use std::net::IpAddr;

/// Why a name failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameViolation {
    Syntax(String),
    Wildcard(String),
}

/// DNS name validator. A wildcard is only accepted as the whole left-most label.
pub fn validate_dns_name(name: &str, allow_wildcard: bool) -> Result<(), NameViolation> {
    if name.is_empty() {
        return Err(NameViolation::Syntax("Name cannot be empty".to_string()));
    }

    if name.len() > 253 {
        return Err(NameViolation::Syntax(format!("Name too long: {} characters", name.len())));
    }

    let labels: Vec<&str> = name.split('.').collect();
    for (index, label) in labels.iter().enumerate() {
        if label.contains('*') {
            if *label != "*" || index != 0 {
                return Err(NameViolation::Wildcard(format!(
                    "Wildcard must be the entire left-most label: {}", name
                )));
            }
            if !allow_wildcard {
                return Err(NameViolation::Wildcard(format!("Wildcard names not permitted: {}", name)));
            }
            if labels.len() < 3 {
                return Err(NameViolation::Wildcard(format!("Wildcard too broad: {}", name)));
            }
            continue;
        }

        validate_label(label).map_err(|reason| NameViolation::Syntax(format!("{}: {}", name, reason)))?;
    }

    Ok(())
}

fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("empty label".to_string());
    }
    if label.len() > 63 {
        return Err(format!("label '{}' exceeds 63 characters", label));
    }
    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(format!("invalid characters in label '{}'", label));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!("label '{}' starts or ends with a hyphen", label));
    }
    Ok(())
}

/// SAN entry validator accepting DNS names and, when permitted, IP addresses
pub fn validate_san(entry: &str, allow_wildcard: bool, allow_ip: bool) -> Result<(), NameViolation> {
    if entry.parse::<IpAddr>().is_ok() {
        if allow_ip {
            return Ok(());
        }
        return Err(NameViolation::Syntax(format!("IP address SANs not permitted: {}", entry)));
    }

    validate_dns_name(entry, allow_wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_dns_name("example.com", false).is_ok());
        assert!(validate_dns_name("api.example.com", false).is_ok());
        assert!(validate_dns_name("*.example.com", true).is_ok());
        assert!(validate_dns_name("internal-host", false).is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(validate_dns_name("", false), Err(NameViolation::Syntax(_))));
        assert!(matches!(validate_dns_name("exa mple.com", false), Err(NameViolation::Syntax(_))));
        assert!(matches!(validate_dns_name("-bad.example.com", false), Err(NameViolation::Syntax(_))));
        assert!(matches!(validate_dns_name("a..b", false), Err(NameViolation::Syntax(_))));
        assert!(validate_dns_name(&"a".repeat(254), false).is_err());
    }

    #[test]
    fn test_wildcard_placement() {
        assert!(matches!(validate_dns_name("*.example.com", false), Err(NameViolation::Wildcard(_))));
        assert!(matches!(validate_dns_name("api.*.example.com", true), Err(NameViolation::Wildcard(_))));
        assert!(matches!(validate_dns_name("*api.example.com", true), Err(NameViolation::Wildcard(_))));
        assert!(matches!(validate_dns_name("*.com", true), Err(NameViolation::Wildcard(_))));
    }

    #[test]
    fn test_ip_sans() {
        assert!(validate_san("10.0.0.1", false, true).is_ok());
        assert!(validate_san("2001:db8::1", false, true).is_ok());
        assert!(validate_san("10.0.0.1", false, false).is_err());
        assert!(validate_san("www.example.com", false, false).is_ok());
    }
}
