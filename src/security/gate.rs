//! Request gate: the ordered decision pipeline every request passes.
//!
//! # State Machine
//! ```text
//! Start → CheckAccess → CheckRate → CheckThreat → CheckAuth → Admitted
//!              │             │            │             │
//!              └─────────────┴────────────┴─────────────┴──▶ Denied(reason)
//! ```
//!
//! The first stage to deny wins. Blocked identities never reach the rate,
//! threat or auth stages. Access and rate only need the request head, so the
//! middleware runs them through [`RequestGate::screen`] before reading the
//! body and the rest through [`RequestGate::inspect`]. A throttled request is still inspected for threats
//! so floods carrying attack payloads are recorded, but the decision stays
//! `rate_limited`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;

use crate::config::ProtectorConfig;
use crate::error::ProtectorResult;
use crate::observability::metrics;
use crate::persistence::{PersistenceHandle, PersistenceStatus, StoreSnapshot};
use crate::security::access_registry::{AccessRegistry, Classification, StaticLists};
use crate::security::identity::SourceIdentity;
use crate::security::patterns::PatternCatalog;
use crate::security::rate_limit::{RateDecision, RateWindowTracker};
use crate::security::threat::{Inspection, RequestDescriptor, ThreatDetector};
use crate::security::tokens::{TokenStatus, TokenStore};

/// Why a request was denied. Carries no pattern detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    PrivateMode,
    RateLimited,
    ThreatDetected,
    Unauthenticated,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Blocked => "blocked",
            DenyReason::PrivateMode => "private_mode",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::ThreatDetected => "threat_detected",
            DenyReason::Unauthenticated => "unauthenticated",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DenyReason::Blocked | DenyReason::PrivateMode | DenyReason::ThreatDetected => StatusCode::FORBIDDEN,
            DenyReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenyReason::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// Generic caller-facing text.
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::Blocked | DenyReason::PrivateMode | DenyReason::ThreatDetected => "Access denied",
            DenyReason::RateLimited => "Too many requests",
            DenyReason::Unauthenticated => "Authentication required",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Access,
    Rate,
    Threat,
    Auth,
}

const HEAD_STAGES: [Stage; 2] = [Stage::Access, Stage::Rate];
const CONTENT_STAGES: [Stage; 2] = [Stage::Threat, Stage::Auth];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny { stage: Stage, reason: DenyReason },
}

/// Request-path settings fixed at construction.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub private_mode: bool,
    pub rate_limit_enabled: bool,
    pub threat_detection_enabled: bool,
    pub trusted_proxies: Vec<IpAddr>,
    pub inspected_headers: Vec<String>,
    pub body_preview_bytes: usize,
    pub max_body_bytes: usize,
}

impl GateSettings {
    pub fn from_config(config: &ProtectorConfig) -> Self {
        Self {
            private_mode: config.private_mode,
            rate_limit_enabled: config.rate_limit.enabled,
            threat_detection_enabled: config.threat_detection.enabled,
            trusted_proxies: config
                .trusted_proxies
                .iter()
                .filter_map(|p| p.trim().parse::<IpAddr>().ok())
                .map(|ip| ip.to_canonical())
                .collect(),
            inspected_headers: config
                .threat_detection
                .inspected_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            body_preview_bytes: config.threat_detection.body_preview_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Default)]
struct DecisionCounters {
    allowed: AtomicU64,
    blocked: AtomicU64,
    throttled: AtomicU64,
    unauthenticated: AtomicU64,
}

/// Read-only snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionStats {
    /// Requests admitted.
    pub allowed_count: u64,
    /// Requests denied with 403 (blocked, private mode, threat).
    pub blocked_count: u64,
    /// Requests denied with 429.
    pub throttled_count: u64,
    /// Requests denied with 401.
    pub unauthenticated_count: u64,
    /// Threat events recorded, including hydrated ones.
    pub threat_event_count: u64,
    /// Identities with a live rate window.
    pub active_identities: usize,
    /// Registry entries currently blocked.
    pub blocked_identities: usize,
    pub token_count: usize,
    pub pattern_count: usize,
    pub persistence: PersistenceStatus,
}

pub struct RequestGate {
    registry: Arc<AccessRegistry>,
    rate: Arc<RateWindowTracker>,
    detector: Arc<ThreatDetector>,
    tokens: Arc<TokenStore>,
    persistence: PersistenceHandle,
    settings: GateSettings,
    counters: DecisionCounters,
}

impl RequestGate {
    /// Assemble a gate from already-built components.
    pub fn new(
        registry: Arc<AccessRegistry>,
        rate: Arc<RateWindowTracker>,
        detector: Arc<ThreatDetector>,
        tokens: Arc<TokenStore>,
        persistence: PersistenceHandle,
        settings: GateSettings,
    ) -> Self {
        Self {
            registry,
            rate,
            detector,
            tokens,
            persistence,
            settings,
            counters: DecisionCounters::default(),
        }
    }

    /// Build every component from configuration around `persistence`.
    ///
    /// Fails if a pattern or static identity does not parse.
    pub fn from_config(config: &ProtectorConfig, persistence: PersistenceHandle) -> ProtectorResult<Self> {
        let catalog = PatternCatalog::compile(&config.threat_detection.patterns)?;
        let statics = StaticLists::from_config(&config.allowed_identities, &config.blocked_identities)?;

        let registry = Arc::new(AccessRegistry::new(statics, persistence.clone()));
        let rate = Arc::new(RateWindowTracker::new(
            Duration::from_secs(config.rate_limit.window_duration_secs),
            config.rate_limit.max_requests,
        ));
        let detector = Arc::new(ThreatDetector::new(
            catalog,
            registry.clone(),
            persistence.clone(),
            config.threat_detection.auto_block,
            config.threat_detection.max_events_in_memory,
        ));
        let tokens = Arc::new(TokenStore::new(config.require_auth));
        if let Some(token) = &config.bootstrap_token {
            tokens.seed(token);
        }

        Ok(Self::new(
            registry,
            rate,
            detector,
            tokens,
            persistence,
            GateSettings::from_config(config),
        ))
    }

    /// Run the whole pipeline for one request.
    pub fn evaluate(&self, identity: &SourceIdentity, request: &RequestDescriptor, token: Option<&str>) -> Decision {
        match self.screen(identity, request) {
            Decision::Admit => self.inspect(identity, request, token),
            denied => denied,
        }
    }

    /// Access and rate stages. `head` needs no body.
    pub fn screen(&self, identity: &SourceIdentity, head: &RequestDescriptor) -> Decision {
        self.run_stages(&HEAD_STAGES, identity, head, None)
            .unwrap_or(Decision::Admit)
    }

    /// Threat and auth stages for a request that passed [`screen`](Self::screen).
    pub fn inspect(&self, identity: &SourceIdentity, request: &RequestDescriptor, token: Option<&str>) -> Decision {
        if let Some(denied) = self.run_stages(&CONTENT_STAGES, identity, request, token) {
            return denied;
        }
        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        metrics::record_decision("admitted");
        Decision::Admit
    }

    fn run_stages(
        &self,
        stages: &[Stage],
        identity: &SourceIdentity,
        request: &RequestDescriptor,
        token: Option<&str>,
    ) -> Option<Decision> {
        for &stage in stages {
            let verdict = match stage {
                Stage::Access => self.check_access(identity),
                Stage::Rate => self.check_rate(identity, request),
                Stage::Threat => self.check_threat(identity, request),
                Stage::Auth => self.check_auth(token),
            };
            if let Err(reason) = verdict {
                self.record_denial(identity, request, reason);
                return Some(Decision::Deny { stage, reason });
            }
        }
        None
    }

    fn check_access(&self, identity: &SourceIdentity) -> Result<(), DenyReason> {
        match self.registry.classify(identity) {
            Classification::Blocked => Err(DenyReason::Blocked),
            Classification::Unclassified if self.settings.private_mode => Err(DenyReason::PrivateMode),
            Classification::Allowed | Classification::Unclassified => Ok(()),
        }
    }

    fn check_rate(&self, identity: &SourceIdentity, request: &RequestDescriptor) -> Result<(), DenyReason> {
        if !self.settings.rate_limit_enabled {
            return Ok(());
        }
        match self.rate.admit(identity) {
            RateDecision::Admit => Ok(()),
            RateDecision::Throttle => {
                if self.settings.threat_detection_enabled {
                    // side effects only; the throttle decides
                    let _ = self.detector.inspect(identity, request);
                }
                Err(DenyReason::RateLimited)
            }
        }
    }

    fn check_threat(&self, identity: &SourceIdentity, request: &RequestDescriptor) -> Result<(), DenyReason> {
        if !self.settings.threat_detection_enabled {
            return Ok(());
        }
        match self.detector.inspect(identity, request) {
            Inspection::Clean => Ok(()),
            Inspection::Matched { .. } => Err(DenyReason::ThreatDetected),
        }
    }

    fn check_auth(&self, token: Option<&str>) -> Result<(), DenyReason> {
        match self.tokens.validate(token) {
            TokenStatus::Valid => Ok(()),
            TokenStatus::Invalid => Err(DenyReason::Unauthenticated),
        }
    }

    fn record_denial(&self, identity: &SourceIdentity, request: &RequestDescriptor, reason: DenyReason) {
        let counter = match reason {
            DenyReason::Blocked | DenyReason::PrivateMode | DenyReason::ThreatDetected => &self.counters.blocked,
            DenyReason::RateLimited => &self.counters.throttled,
            DenyReason::Unauthenticated => &self.counters.unauthenticated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_decision(reason.code());
        tracing::warn!(
            identity = %identity,
            reason = reason.code(),
            method = %request.method,
            path = %request.path,
            "Request denied"
        );
    }

    /// Apply the reloadable parts of a new configuration.
    ///
    /// Everything is compiled before anything is swapped, so a bad config
    /// changes nothing.
    pub fn apply_reload(&self, config: &ProtectorConfig) -> ProtectorResult<()> {
        let catalog = PatternCatalog::compile(&config.threat_detection.patterns)?;
        let statics = StaticLists::from_config(&config.allowed_identities, &config.blocked_identities)?;

        tracing::info!(
            allowed = statics.allowed.len(),
            blocked = statics.blocked.len(),
            patterns = catalog.len(),
            "Applying configuration reload"
        );
        self.registry.replace_static_lists(statics);
        self.detector.replace_catalog(catalog);
        Ok(())
    }

    /// Seed in-memory state from a durable snapshot.
    pub fn hydrate(&self, snapshot: StoreSnapshot) {
        let entries = self.registry.restore(snapshot.access_entries);
        let events = self
            .detector
            .restore(snapshot.threat_events, snapshot.threat_event_total);
        tracing::info!(
            entries,
            events,
            total_events = snapshot.threat_event_total,
            "Hydrated protector state"
        );
    }

    pub fn stats(&self) -> ProtectionStats {
        let active_identities = self.rate.active_identities();
        metrics::set_active_identities(active_identities);
        ProtectionStats {
            allowed_count: self.counters.allowed.load(Ordering::Relaxed),
            blocked_count: self.counters.blocked.load(Ordering::Relaxed),
            throttled_count: self.counters.throttled.load(Ordering::Relaxed),
            unauthenticated_count: self.counters.unauthenticated.load(Ordering::Relaxed),
            threat_event_count: self.detector.event_count(),
            active_identities,
            blocked_identities: self.registry.blocked_count(),
            token_count: self.tokens.active_count(),
            pattern_count: self.detector.rule_count(),
            persistence: self.persistence.status(),
        }
    }

    pub fn registry(&self) -> &Arc<AccessRegistry> {
        &self.registry
    }

    pub fn rate(&self) -> &Arc<RateWindowTracker> {
        &self.rate
    }

    pub fn detector(&self) -> &Arc<ThreatDetector> {
        &self.detector
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternSpec;
    use crate::security::access_registry::AccessSource;
    use axum::http::HeaderMap;

    fn id(s: &str) -> SourceIdentity {
        SourceIdentity::parse(s).unwrap()
    }

    fn config() -> ProtectorConfig {
        let mut config = ProtectorConfig::default();
        config.allowed_identities = vec!["10.0.0.1".into()];
        config.rate_limit.max_requests = 3;
        config.threat_detection.patterns = vec![PatternSpec::Categorized {
            pattern: r"\.\./".into(),
            category: "path_traversal".into(),
        }];
        config
    }

    fn gate(config: &ProtectorConfig) -> RequestGate {
        RequestGate::from_config(config, PersistenceHandle::memory_only()).unwrap()
    }

    fn get(path: &str) -> RequestDescriptor {
        RequestDescriptor::from_parts("GET", path, None, &HeaderMap::new(), b"", &[], 1024)
    }

    #[test]
    fn test_clean_request_is_admitted() {
        let gate = gate(&config());
        assert_eq!(gate.evaluate(&id("198.51.100.1"), &get("/"), None), Decision::Admit);
        assert_eq!(gate.stats().allowed_count, 1);
    }

    #[test]
    fn test_blocked_identity_short_circuits() {
        let gate = gate(&config());
        let a = id("198.51.100.2");
        gate.registry().block(&a, "manual", AccessSource::Manual).unwrap();

        for _ in 0..10 {
            let decision = gate.evaluate(&a, &get("/../etc"), None);
            assert_eq!(
                decision,
                Decision::Deny {
                    stage: Stage::Access,
                    reason: DenyReason::Blocked
                }
            );
        }
        // no rate window opened, no threat recorded
        assert_eq!(gate.rate().active_identities(), 0);
        assert_eq!(gate.detector().event_count(), 0);
    }

    #[test]
    fn test_rate_bound() {
        let gate = gate(&config());
        let a = id("198.51.100.3");
        for _ in 0..3 {
            assert_eq!(gate.evaluate(&a, &get("/"), None), Decision::Admit);
        }
        assert_eq!(
            gate.evaluate(&a, &get("/"), None),
            Decision::Deny {
                stage: Stage::Rate,
                reason: DenyReason::RateLimited
            }
        );
        assert_eq!(gate.stats().throttled_count, 1);
    }

    #[test]
    fn test_threat_denies_then_blocks() {
        let gate = gate(&config());
        let a = id("198.51.100.4");

        let first = gate.evaluate(&a, &get("/files/%2e%2e%2fsecret"), None);
        assert_eq!(
            first,
            Decision::Deny {
                stage: Stage::Threat,
                reason: DenyReason::ThreatDetected
            }
        );

        let second = gate.evaluate(&a, &get("/"), None);
        assert_eq!(
            second,
            Decision::Deny {
                stage: Stage::Access,
                reason: DenyReason::Blocked
            }
        );
    }

    #[test]
    fn test_allow_listed_threat_denied_but_not_blocked() {
        let gate = gate(&config());
        let ops = id("10.0.0.1");

        assert!(matches!(gate.evaluate(&ops, &get("/../x"), None), Decision::Deny { stage: Stage::Threat, .. }));
        assert!(gate.registry().entry(&ops).is_none());
        assert_eq!(gate.evaluate(&ops, &get("/"), None), Decision::Admit);
    }

    #[test]
    fn test_throttled_request_still_inspected() {
        let mut config = config();
        config.rate_limit.max_requests = 1;
        let gate = gate(&config);
        let a = id("198.51.100.5");

        assert_eq!(gate.evaluate(&a, &get("/"), None), Decision::Admit);
        let decision = gate.evaluate(&a, &get("/../x"), None);
        assert_eq!(
            decision,
            Decision::Deny {
                stage: Stage::Rate,
                reason: DenyReason::RateLimited
            }
        );
        assert_eq!(gate.detector().event_count(), 1);
        assert_eq!(gate.registry().classify(&a), Classification::Blocked);
    }

    #[test]
    fn test_screen_then_inspect() {
        let gate = gate(&config());
        let a = id("198.51.100.10");
        let mut request = RequestDescriptor::from_head("POST", "/upload", None, &HeaderMap::new(), &[]);

        assert_eq!(gate.screen(&a, &request), Decision::Admit);
        assert_eq!(gate.stats().allowed_count, 0);

        request.attach_body(b"path=..%2fetc", 1024);
        assert_eq!(
            gate.inspect(&a, &request, None),
            Decision::Deny {
                stage: Stage::Threat,
                reason: DenyReason::ThreatDetected
            }
        );
        assert_eq!(
            gate.screen(&a, &request),
            Decision::Deny {
                stage: Stage::Access,
                reason: DenyReason::Blocked
            }
        );
    }

    #[test]
    fn test_auth_required() {
        let mut config = config();
        config.require_auth = true;
        let gate = gate(&config);
        let a = id("198.51.100.6");

        assert_eq!(
            gate.evaluate(&a, &get("/"), None),
            Decision::Deny {
                stage: Stage::Auth,
                reason: DenyReason::Unauthenticated
            }
        );

        let token = gate.tokens().issue();
        assert_eq!(gate.evaluate(&a, &get("/"), Some(&token)), Decision::Admit);

        gate.tokens().revoke(&token);
        assert!(matches!(gate.evaluate(&a, &get("/"), Some(&token)), Decision::Deny { stage: Stage::Auth, .. }));
    }

    #[test]
    fn test_private_mode() {
        let mut config = config();
        config.private_mode = true;
        let gate = gate(&config);

        assert_eq!(gate.evaluate(&id("10.0.0.1"), &get("/"), None), Decision::Admit);
        assert_eq!(
            gate.evaluate(&id("198.51.100.7"), &get("/"), None),
            Decision::Deny {
                stage: Stage::Access,
                reason: DenyReason::PrivateMode
            }
        );
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let mut config = config();
        config.rate_limit.enabled = false;
        config.threat_detection.enabled = false;
        let gate = gate(&config);
        let a = id("198.51.100.8");

        for _ in 0..10 {
            assert_eq!(gate.evaluate(&a, &get("/../x"), None), Decision::Admit);
        }
    }

    #[test]
    fn test_reload_swaps_lists_and_catalog() {
        let gate = gate(&config());
        let a = id("198.51.100.9");

        let mut next = config();
        next.allowed_identities = vec!["198.51.100.9".into()];
        next.threat_detection.patterns = vec![PatternSpec::Bare("forbidden".into())];
        gate.apply_reload(&next).unwrap();

        assert!(gate.registry().is_statically_allowed(&a));
        assert_eq!(gate.evaluate(&a, &get("/../x"), None), Decision::Admit);

        let mut broken = config();
        broken.threat_detection.patterns = vec![PatternSpec::Bare("(".into())];
        assert!(gate.apply_reload(&broken).is_err());
        assert!(gate.registry().is_statically_allowed(&a));
    }
}
