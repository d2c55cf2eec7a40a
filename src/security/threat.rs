//! Threat detection over a normalized view of each request.
//!
//! # Data Flow
//! ```text
//! RequestDescriptor (decoded path, query, body preview, selected headers)
//!     → PatternCatalog::first_match
//!     → Matched: ThreatEvent appended + persisted
//!                auto-block via AccessRegistry (unless statically allowed)
//! ```
//!
//! # Design Decisions
//! - Inputs are percent-decoded until stable so encoded traversal is caught
//! - Pattern text is kept for operators and never handed back to callers
//! - The catalog is an immutable snapshot; reload swaps the whole thing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::observability::metrics;
use crate::persistence::{PersistenceHandle, PersistenceOp};
use crate::security::access_registry::{AccessRegistry, AccessSource};
use crate::security::identity::SourceIdentity;
use crate::security::patterns::PatternCatalog;

const MAX_DECODE_PASSES: usize = 3;
const SNAPSHOT_FIELD_LIMIT: usize = 512;

/// Percent-decode until the value stops changing.
pub fn decode_component(raw: &str, plus_as_space: bool) -> String {
    let mut current = if plus_as_space {
        raw.replace('+', " ")
    } else {
        raw.to_string()
    };
    for _ in 0..MAX_DECODE_PASSES {
        let decoded = percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// The inspected view of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Body prefix as received.
    pub body_preview: String,
    /// Body prefix after decoding, whatever the declared content type.
    pub body_decoded: String,
    pub headers: Vec<(String, String)>,
}

impl RequestDescriptor {
    /// Build the normalized view of the request line and selected headers.
    pub fn from_head(
        method: &str,
        raw_path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        inspected_headers: &[String],
    ) -> Self {
        let headers = inspected_headers
            .iter()
            .filter_map(|name| {
                headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.clone(), decode_component(v, false)))
            })
            .collect();

        Self {
            method: method.to_string(),
            path: decode_component(raw_path, false),
            query: raw_query.map(|q| decode_component(q, true)).unwrap_or_default(),
            body_preview: String::new(),
            body_decoded: String::new(),
            headers,
        }
    }

    /// Add the first `body_preview_bytes` of the body.
    ///
    /// Both the raw and the decoded prefix are matched, so a mislabelled
    /// content type cannot hide an encoded payload.
    pub fn attach_body(&mut self, body: &[u8], body_preview_bytes: usize) {
        let preview = String::from_utf8_lossy(&body[..body.len().min(body_preview_bytes)]);
        self.body_decoded = decode_component(&preview, true);
        self.body_preview = preview.into_owned();
    }

    /// Head and body in one go.
    pub fn from_parts(
        method: &str,
        raw_path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
        inspected_headers: &[String],
        body_preview_bytes: usize,
    ) -> Self {
        let mut descriptor = Self::from_head(method, raw_path, raw_query, headers, inspected_headers);
        descriptor.attach_body(body, body_preview_bytes);
        descriptor
    }

    fn fields(&self) -> impl Iterator<Item = &str> + Clone {
        [
            self.path.as_str(),
            self.query.as_str(),
            self.body_preview.as_str(),
            self.body_decoded.as_str(),
        ]
        .into_iter()
        .chain(self.headers.iter().map(|(_, v)| v.as_str()))
    }

    fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            method: self.method.clone(),
            path: truncate_at_char_boundary(&self.path, SNAPSHOT_FIELD_LIMIT).to_string(),
            query: truncate_at_char_boundary(&self.query, SNAPSHOT_FIELD_LIMIT).to_string(),
            body_preview: truncate_at_char_boundary(&self.body_decoded, SNAPSHOT_FIELD_LIMIT).to_string(),
        }
    }
}

/// Bounded copy of the offending request, kept with the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub body_preview: String,
}

/// Append-only record of a signature match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub identity: SourceIdentity,
    pub matched_pattern: String,
    #[serde(default)]
    pub category: String,
    pub request_snapshot: RequestSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// Result of inspecting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Clean,
    Matched { category: String },
}

/// In-memory threat log: recent events plus a lifetime count.
struct ThreatLog {
    recent: Mutex<VecDeque<ThreatEvent>>,
    capacity: usize,
    total: AtomicU64,
}

impl ThreatLog {
    fn push(&self, event: ThreatEvent) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if self.capacity > 0 {
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ThreatDetector {
    catalog: ArcSwap<PatternCatalog>,
    registry: Arc<AccessRegistry>,
    persistence: PersistenceHandle,
    auto_block: bool,
    log: ThreatLog,
}

impl ThreatDetector {
    pub fn new(
        catalog: PatternCatalog,
        registry: Arc<AccessRegistry>,
        persistence: PersistenceHandle,
        auto_block: bool,
        max_events_in_memory: usize,
    ) -> Self {
        Self {
            catalog: ArcSwap::from_pointee(catalog),
            registry,
            persistence,
            auto_block,
            log: ThreatLog {
                recent: Mutex::new(VecDeque::new()),
                capacity: max_events_in_memory,
                total: AtomicU64::new(0),
            },
        }
    }

    /// Run the catalog against `request`, recording and escalating a match.
    pub fn inspect(&self, identity: &SourceIdentity, request: &RequestDescriptor) -> Inspection {
        let catalog = self.catalog.load();
        let Some(rule) = catalog.first_match(request.fields()) else {
            return Inspection::Clean;
        };

        let event = ThreatEvent {
            identity: identity.clone(),
            matched_pattern: rule.pattern().to_string(),
            category: rule.category().to_string(),
            request_snapshot: request.snapshot(),
            timestamp: Utc::now(),
        };
        tracing::warn!(
            identity = %identity,
            category = rule.category(),
            pattern = rule.pattern(),
            path = %event.request_snapshot.path,
            "Threat pattern matched"
        );
        metrics::record_threat(rule.category());

        self.log.push(event.clone());
        self.persistence.submit(PersistenceOp::AppendThreat(event));

        if self.auto_block {
            if self.registry.is_statically_allowed(identity) {
                tracing::info!(identity = %identity, "Statically allowed identity not auto-blocked");
            } else if let Err(e) = self.registry.block(identity, rule.category(), AccessSource::AutoThreat) {
                tracing::warn!(identity = %identity, error = %e, "Auto-block rejected");
            }
        }

        Inspection::Matched {
            category: rule.category().to_string(),
        }
    }

    /// Swap in a freshly compiled catalog.
    pub fn replace_catalog(&self, catalog: PatternCatalog) {
        tracing::info!(rules = catalog.len(), "Threat catalog replaced");
        self.catalog.store(Arc::new(catalog));
    }

    /// Seed the log from the durable store without re-persisting.
    ///
    /// `events` is the stored tail, oldest first; `total` is the size of the
    /// whole durable log and becomes the lifetime count.
    pub fn restore(&self, events: impl IntoIterator<Item = ThreatEvent>, total: u64) -> usize {
        let mut restored = 0;
        for event in events {
            self.log.push(event);
            restored += 1;
        }
        self.log.total.store(total.max(restored as u64), Ordering::Relaxed);
        restored
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<ThreatEvent> {
        self.log
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> u64 {
        self.log.total.load(Ordering::Relaxed)
    }

    pub fn rule_count(&self) -> usize {
        self.catalog.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternSpec;
    use crate::security::access_registry::{Classification, StaticLists};

    fn id(s: &str) -> SourceIdentity {
        SourceIdentity::parse(s).unwrap()
    }

    fn detector(auto_block: bool, allowed: &[&str]) -> (ThreatDetector, Arc<AccessRegistry>) {
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        let registry = Arc::new(AccessRegistry::new(
            StaticLists::from_config(&allowed, &[]).unwrap(),
            PersistenceHandle::memory_only(),
        ));
        let catalog = PatternCatalog::compile(&[
            PatternSpec::Categorized {
                pattern: r"\.\./".into(),
                category: "path_traversal".into(),
            },
            PatternSpec::Categorized {
                pattern: r"(?i)<script".into(),
                category: "xss".into(),
            },
        ])
        .unwrap();
        let detector = ThreatDetector::new(catalog, registry.clone(), PersistenceHandle::memory_only(), auto_block, 2);
        (detector, registry)
    }

    fn get(path: &str, query: Option<&str>) -> RequestDescriptor {
        RequestDescriptor::from_parts("GET", path, query, &HeaderMap::new(), b"", &[], 1024)
    }

    #[test]
    fn test_decoding() {
        assert_eq!(decode_component("/files/%2e%2e%2fsecret", false), "/files/../secret");
        assert_eq!(decode_component("%252e%252e%252f", false), "../");
        assert_eq!(decode_component("a+b%20c", true), "a b c");
        assert_eq!(decode_component("a+b", false), "a+b");
    }

    #[test]
    fn test_encoded_traversal_matches_and_blocks() {
        let (detector, registry) = detector(true, &[]);
        let a = id("198.51.100.7");

        let result = detector.inspect(&a, &get("/files/%2e%2e%2fsecret", None));
        assert_eq!(result, Inspection::Matched { category: "path_traversal".into() });
        assert_eq!(registry.classify(&a), Classification::Blocked);
        assert_eq!(detector.event_count(), 1);

        let event = &detector.recent_events(10)[0];
        assert_eq!(event.request_snapshot.path, "/files/../secret");
        assert_eq!(event.category, "path_traversal");
    }

    #[test]
    fn test_no_block_when_auto_block_disabled() {
        let (detector, registry) = detector(false, &[]);
        let a = id("198.51.100.8");

        assert!(matches!(detector.inspect(&a, &get("/x", Some("q=<SCRIPT>"))), Inspection::Matched { .. }));
        assert_eq!(registry.classify(&a), Classification::Unclassified);
    }

    #[test]
    fn test_static_allow_list_is_not_auto_blocked() {
        let (detector, registry) = detector(true, &["10.0.0.1"]);
        let ops = id("10.0.0.1");

        assert!(matches!(detector.inspect(&ops, &get("/../x", None)), Inspection::Matched { .. }));
        assert!(registry.entry(&ops).is_none());
        assert_eq!(registry.classify(&ops), Classification::Allowed);
    }

    #[test]
    fn test_body_and_headers_are_inspected() {
        let (detector, _) = detector(false, &[]);
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "<script>".parse().unwrap());
        headers.insert("content-type", "application/x-www-form-urlencoded".parse().unwrap());

        let ua = RequestDescriptor::from_parts("GET", "/", None, &headers, b"", &["user-agent".into()], 64);
        assert!(matches!(detector.inspect(&id("10.1.1.1"), &ua), Inspection::Matched { .. }));

        let form = RequestDescriptor::from_parts("POST", "/", None, &headers, b"file=%2E%2E%2Fetc", &[], 64);
        assert!(matches!(detector.inspect(&id("10.1.1.2"), &form), Inspection::Matched { .. }));

        let mut mixed_case = HeaderMap::new();
        mixed_case.insert("content-type", "Application/X-WWW-Form-Urlencoded; Charset=UTF-8".parse().unwrap());
        let body = b"text=%3Cscript%3Ealert(1)%3C%2Fscript%3E";
        let form = RequestDescriptor::from_parts("POST", "/", None, &mixed_case, body, &[], 64);
        assert_eq!(form.body_decoded, "text=<script>alert(1)</script>");
        assert!(matches!(detector.inspect(&id("10.1.1.4"), &form), Inspection::Matched { .. }));

        // no content type at all
        let bare = RequestDescriptor::from_parts("POST", "/", None, &HeaderMap::new(), body, &[], 64);
        assert!(matches!(detector.inspect(&id("10.1.1.5"), &bare), Inspection::Matched { .. }));

        // beyond the preview window
        let mut body = vec![b'a'; 100];
        body.extend_from_slice(b"../");
        let long = RequestDescriptor::from_parts("POST", "/", None, &HeaderMap::new(), &body, &[], 64);
        assert_eq!(detector.inspect(&id("10.1.1.3"), &long), Inspection::Clean);
    }

    #[test]
    fn test_log_is_bounded_but_count_is_not() {
        let (detector, _) = detector(false, &[]);
        for i in 0..5 {
            detector.inspect(&id(&format!("10.2.0.{i}")), &get("/../", None));
        }
        assert_eq!(detector.event_count(), 5);
        let recent = detector.recent_events(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].identity.as_str(), "10.2.0.4");
    }

    #[test]
    fn test_restore_keeps_durable_total() {
        let (live, registry) = detector(true, &[]);
        let a = id("10.4.0.1");
        live.inspect(&a, &get("/../", None));
        let tail = live.recent_events(10);

        let (restored, _) = detector(true, &[]);
        assert_eq!(restored.restore(tail, 40), 1);
        assert_eq!(restored.event_count(), 40);
        assert_eq!(registry.classify(&a), Classification::Blocked);
    }

    #[test]
    fn test_replace_catalog() {
        let (detector, _) = detector(false, &[]);
        detector.replace_catalog(PatternCatalog::default());
        assert_eq!(detector.rule_count(), 0);
        assert_eq!(detector.inspect(&id("10.3.0.1"), &get("/../", None)), Inspection::Clean);
    }
}
