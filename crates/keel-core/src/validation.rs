//! Input validation for names and identifiers crossing the API boundary.
//!
//! Resource and type names become database keys and event fields, so they
//! are restricted to RFC 1123 subdomain labels before anything else sees
//! them.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length for resource, type, and webhook names.
pub const MAX_NAME_LENGTH: usize = 253;

/// Maximum length for a version string.
pub const MAX_VERSION_LENGTH: usize = 63;

static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").unwrap());

static VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9.-]*[a-z0-9])?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,

    #[error("name too long: {len} chars (max: {max})")]
    TooLong { len: usize, max: usize },

    #[error("invalid name '{name}': must be a lowercase RFC 1123 subdomain")]
    InvalidFormat { name: String },
}

/// Validate a resource, type, webhook, or finalizer name.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong {
            len: name.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    if !NAME_REGEX.is_match(name) {
        return Err(NameError::InvalidFormat {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a resource type version string (e.g. `v1`, `v1beta1`).
pub fn validate_version(version: &str) -> Result<(), NameError> {
    if version.is_empty() {
        return Err(NameError::Empty);
    }
    if version.len() > MAX_VERSION_LENGTH {
        return Err(NameError::TooLong {
            len: version.len(),
            max: MAX_VERSION_LENGTH,
        });
    }
    if !VERSION_REGEX.is_match(version) {
        return Err(NameError::InvalidFormat {
            name: version.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["bucket", "my-bucket-2", "a", "team.cache-7"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert!(matches!(
            validate_name("-leading-dash"),
            Err(NameError::InvalidFormat { .. })
        ));
        assert!(matches!(
            validate_name("Uppercase"),
            Err(NameError::InvalidFormat { .. })
        ));
        assert!(matches!(
            validate_name("trailing-"),
            Err(NameError::InvalidFormat { .. })
        ));
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(matches!(validate_name(&long), Err(NameError::TooLong { .. })));
    }

    #[test]
    fn versions_allow_dots() {
        assert!(validate_version("v1").is_ok());
        assert!(validate_version("v1beta1").is_ok());
        assert!(validate_version("2024.1").is_ok());
        assert!(validate_version("").is_err());
    }
}
