//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (window > 0, limits > 0, capacities > 0)
//! - Check that every static identity and trusted proxy parses
//! - Compile every threat signature so a broken matcher is fatal at startup
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProtectorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::ProtectorConfig;
use crate::security::identity::{normalize_identity, IdentitySet};
use crate::security::patterns::PatternCatalog;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bind_identity `{0}` is not a socket address")]
    InvalidBindAddress(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{list} entry `{entry}` is not a valid identity")]
    InvalidIdentity { list: &'static str, entry: String },

    #[error("identity `{0}` is in both allowed_identities and blocked_identities")]
    ConflictingIdentity(String),

    #[error("trusted proxy `{0}` is not an IP address")]
    InvalidTrustedProxy(String),

    #[error("{0}")]
    InvalidPattern(String),

    #[error("persistence.connection must be set when persistence is enabled")]
    MissingConnection,

    #[error("observability.metrics_address `{0}` is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProtectorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.bind_identity.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.bind_identity.clone()));
    }

    let ranges: [(&'static str, u64); 6] = [
        ("rate_limit.window_duration", config.rate_limit.window_duration_secs),
        ("rate_limit.max_requests", config.rate_limit.max_requests),
        ("rate_limit.cleanup_interval_secs", config.rate_limit.cleanup_interval_secs),
        ("max_body_bytes", config.max_body_bytes as u64),
        ("request_timeout_secs", config.request_timeout_secs),
        ("persistence.queue_capacity", config.persistence.queue_capacity as u64),
    ];
    for (field, value) in ranges {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    check_identities("allowed_identities", &config.allowed_identities, &mut errors);
    check_identities("blocked_identities", &config.blocked_identities, &mut errors);

    let allowed: HashSet<String> = config
        .allowed_identities
        .iter()
        .filter_map(|e| normalize_identity(e).ok())
        .collect();
    for entry in &config.blocked_identities {
        if let Ok(normalized) = normalize_identity(entry) {
            if allowed.contains(&normalized) {
                errors.push(ValidationError::ConflictingIdentity(normalized));
            }
        }
    }

    for proxy in &config.trusted_proxies {
        if proxy.trim().parse::<IpAddr>().is_err() {
            errors.push(ValidationError::InvalidTrustedProxy(proxy.clone()));
        }
    }

    if let Err(e) = PatternCatalog::compile(&config.threat_detection.patterns) {
        errors.push(ValidationError::InvalidPattern(e.to_string()));
    }

    if config.persistence.enabled && config.persistence.connection.trim().is_empty() {
        errors.push(ValidationError::MissingConnection);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_identities(list: &'static str, entries: &[String], errors: &mut Vec<ValidationError>) {
    for entry in entries {
        if IdentitySet::from_entries(std::slice::from_ref(entry)).is_err() {
            errors.push(ValidationError::InvalidIdentity {
                list,
                entry: entry.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PatternSpec;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ProtectorConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let mut config = ProtectorConfig::default();
        config.threat_detection.patterns = vec![PatternSpec::Bare("([a-z".into())];
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidPattern(_)));
    }

    #[test]
    fn test_conflicting_lists() {
        let mut config = ProtectorConfig::default();
        config.allowed_identities = vec!["10.1.1.1".into()];
        config.blocked_identities = vec!["10.1.1.1".into()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::ConflictingIdentity("10.1.1.1".into())]);
    }

    #[test]
    fn test_bad_identities_and_proxies() {
        let mut config = ProtectorConfig::default();
        config.allowed_identities = vec!["has space".into(), "10.0.0.0/40".into()];
        config.trusted_proxies = vec!["proxy.local".into()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_persistence_requires_connection() {
        let mut config = ProtectorConfig::default();
        config.persistence.enabled = true;
        config.persistence.connection = "  ".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::MissingConnection]);
    }
}
