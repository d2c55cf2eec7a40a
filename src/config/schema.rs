//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the protector.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the network protector.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtectorConfig {
    /// Socket address the HTTP listener binds to (e.g., "127.0.0.1:8080").
    pub bind_identity: String,

    /// Only statically or manually allowed identities may pass when set.
    pub private_mode: bool,

    /// Identities that always classify as allowed (IPs, CIDRs or opaque ids).
    pub allowed_identities: Vec<String>,

    /// Identities that always classify as blocked unless also allowed.
    pub blocked_identities: Vec<String>,

    /// Peers whose `X-Forwarded-For` header is honoured.
    pub trusted_proxies: Vec<String>,

    /// Require a valid bearer token on every request.
    pub require_auth: bool,

    /// Token seeded into the token store at startup.
    pub bootstrap_token: Option<String>,

    /// Maximum request body size buffered for inspection.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Threat detection configuration.
    pub threat_detection: ThreatDetectionConfig,

    /// Durable mirror configuration.
    pub persistence: PersistenceConfig,

    /// Administrative surface configuration.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ProtectorConfig {
    fn default() -> Self {
        Self {
            bind_identity: "127.0.0.1:8080".to_string(),
            private_mode: false,
            allowed_identities: vec!["127.0.0.1".to_string(), "::1".to_string()],
            blocked_identities: Vec::new(),
            trusted_proxies: Vec::new(),
            require_auth: false,
            bootstrap_token: None,
            max_body_bytes: 1024 * 1024,
            request_timeout_secs: 30,
            rate_limit: RateLimitConfig::default(),
            threat_detection: ThreatDetectionConfig::default(),
            persistence: PersistenceConfig::default(),
            admin: AdminConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Fixed window length in seconds.
    #[serde(alias = "window_duration")]
    pub window_duration_secs: u64,

    /// Maximum admitted requests per identity per window.
    pub max_requests: u64,

    /// How often idle windows are swept, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_duration_secs: 60,
            max_requests: 100,
            cleanup_interval_secs: 60,
        }
    }
}

/// A configured threat signature.
///
/// Accepts either a bare regex string or a table with an explicit category.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PatternSpec {
    Bare(String),
    Categorized { pattern: String, category: String },
}

impl PatternSpec {
    pub fn pattern(&self) -> &str {
        match self {
            PatternSpec::Bare(p) => p,
            PatternSpec::Categorized { pattern, .. } => pattern,
        }
    }

    pub fn category(&self) -> &str {
        match self {
            PatternSpec::Bare(_) => "suspicious_pattern",
            PatternSpec::Categorized { category, .. } => category,
        }
    }
}

/// Threat detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreatDetectionConfig {
    /// Enable pattern inspection.
    pub enabled: bool,

    /// Block the identity on a pattern match.
    pub auto_block: bool,

    /// Signatures, evaluated in declaration order.
    pub patterns: Vec<PatternSpec>,

    /// Bytes of request body included in the inspected view.
    pub body_preview_bytes: usize,

    /// Header names (lowercase) included in the inspected view.
    pub inspected_headers: Vec<String>,

    /// Threat events retained in memory for the admin surface.
    pub max_events_in_memory: usize,
}

impl Default for ThreatDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_block: true,
            patterns: default_patterns(),
            body_preview_bytes: 4096,
            inspected_headers: vec!["user-agent".to_string(), "referer".to_string()],
            max_events_in_memory: 1000,
        }
    }
}

fn default_patterns() -> Vec<PatternSpec> {
    [
        (r"\.\./|\.\.\\", "path_traversal"),
        (r"(?i)/(etc/passwd|etc/shadow|proc/self/environ)", "sensitive_file"),
        (r"(?i)/\.(env|git|svn|htaccess)\b", "sensitive_file"),
        (r"(?i)\bunion\b[\s\S]*\bselect\b", "sql_injection"),
        (r"(?i)'\s*or\s+'?\d+'?\s*=\s*'?\d+", "sql_injection"),
        (r"(?i);\s*(drop|delete|truncate)\s+table\b", "sql_injection"),
        (r"(?i)<script[^>]*>", "xss"),
        (r"(?i)javascript:|\bon(error|load)\s*=", "xss"),
        (r"(?i)(;|\|\||&&|`)\s*(cat|ls|rm|wget|curl|nc|bash|sh)\b", "command_injection"),
    ]
    .into_iter()
    .map(|(pattern, category)| PatternSpec::Categorized {
        pattern: pattern.to_string(),
        category: category.to_string(),
    })
    .collect()
}

/// Durable mirror configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Mirror registry state and threat events to a document store.
    pub enabled: bool,

    /// Store location: `file:///dir`, a bare directory path, or `memory:`.
    pub connection: String,

    /// Bounded queue between the request path and the writer.
    pub queue_capacity: usize,

    /// Startup hydration deadline in seconds.
    pub hydrate_timeout_secs: u64,

    /// Write attempts before a record is given up on.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connection: "file://./protector-data".to_string(),
            queue_capacity: 1024,
            hydrate_timeout_secs: 5,
            max_retries: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5000,
        }
    }
}

/// Administrative surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the `/protection` routes.
    pub enabled: bool,

    /// Restrict admin routes to statically allowed identities.
    pub allowlist_only: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist_only: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: ProtectorConfig = toml::from_str("require_auth = true").unwrap();
        assert!(config.require_auth);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert!(!config.threat_detection.patterns.is_empty());
        assert_eq!(config.allowed_identities, vec!["127.0.0.1", "::1"]);
    }

    #[test]
    fn test_pattern_forms() {
        let config: ProtectorConfig = toml::from_str(
            r#"
            [threat_detection]
            patterns = ['\.\./', { pattern = "(?i)<script", category = "xss" }]
            "#,
        )
        .unwrap();

        let patterns = &config.threat_detection.patterns;
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].category(), "suspicious_pattern");
        assert_eq!(patterns[0].pattern(), r"\.\./");
        assert_eq!(patterns[1].category(), "xss");
    }

    #[test]
    fn test_window_duration_alias() {
        let config: ProtectorConfig = toml::from_str(
            r#"
            [rate_limit]
            window_duration = 15
            max_requests = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.window_duration_secs, 15);
        assert_eq!(config.rate_limit.max_requests, 3);
    }
}
