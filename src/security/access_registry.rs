//! Authoritative allow/block classification of source identities.
//!
//! # Responsibilities
//! - Classify an identity as Allowed, Blocked or Unclassified
//! - Record manual and automatic blocks, manual allows and unblocks
//! - Enforce the static allow-list: it can never be blocked through the registry
//! - Mirror every change to the persistence synchronizer
//!
//! # Precedence
//! ```text
//! static allow-list > static block-list > registry entry > unclassified
//! ```
//!
//! # Design Decisions
//! - Entries are never deleted; unblock flips status so history is kept
//! - Static lists live behind `ArcSwap` so a reload replaces them atomically

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ProtectorError, ProtectorResult};
use crate::persistence::{PersistenceHandle, PersistenceOp};
use crate::security::identity::{IdentitySet, SourceIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Allowed,
    Blocked,
}

/// Who created the latest state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Manual,
    AutoThreat,
}

/// One record per classified identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub identity: SourceIdentity,
    pub status: AccessStatus,
    #[serde(default)]
    pub reason: String,
    pub source: AccessSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of classifying an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Blocked,
    Unclassified,
}

/// What an unblock call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockOutcome {
    Unblocked,
    NotBlocked,
}

/// Configuration-provided lists, swapped as a unit on reload.
#[derive(Debug, Default)]
pub struct StaticLists {
    pub allowed: IdentitySet,
    pub blocked: IdentitySet,
}

impl StaticLists {
    pub fn from_config(allowed: &[String], blocked: &[String]) -> ProtectorResult<Self> {
        Ok(Self {
            allowed: IdentitySet::from_entries(allowed)?,
            blocked: IdentitySet::from_entries(blocked)?,
        })
    }
}

pub struct AccessRegistry {
    entries: DashMap<SourceIdentity, AccessEntry>,
    statics: ArcSwap<StaticLists>,
    persistence: PersistenceHandle,
}

impl AccessRegistry {
    pub fn new(statics: StaticLists, persistence: PersistenceHandle) -> Self {
        Self {
            entries: DashMap::new(),
            statics: ArcSwap::from_pointee(statics),
            persistence,
        }
    }

    pub fn classify(&self, identity: &SourceIdentity) -> Classification {
        let statics = self.statics.load();
        if statics.allowed.contains(identity) {
            return Classification::Allowed;
        }
        if statics.blocked.contains(identity) {
            return Classification::Blocked;
        }
        match self.entries.get(identity).map(|e| e.status) {
            Some(AccessStatus::Allowed) => Classification::Allowed,
            Some(AccessStatus::Blocked) => Classification::Blocked,
            None => Classification::Unclassified,
        }
    }

    pub fn is_statically_allowed(&self, identity: &SourceIdentity) -> bool {
        self.statics.load().allowed.contains(identity)
    }

    /// Block `identity`. Re-blocking refreshes reason and timestamp in place.
    pub fn block(&self, identity: &SourceIdentity, reason: &str, source: AccessSource) -> ProtectorResult<AccessEntry> {
        if self.is_statically_allowed(identity) {
            return Err(ProtectorError::PolicyViolation(format!(
                "{identity} is on the static allow-list and cannot be blocked"
            )));
        }

        let entry = self.upsert(identity, AccessStatus::Blocked, reason, source);
        tracing::info!(identity = %identity, reason, source = ?source, "Identity blocked");
        Ok(entry)
    }

    /// Mark `identity` as allowed by an operator.
    pub fn allow(&self, identity: &SourceIdentity, reason: &str) -> ProtectorResult<AccessEntry> {
        if self.statics.load().blocked.contains(identity) {
            return Err(ProtectorError::PolicyViolation(format!(
                "{identity} is on the static block-list; change the configuration instead"
            )));
        }

        let entry = self.upsert(identity, AccessStatus::Allowed, reason, AccessSource::Manual);
        tracing::info!(identity = %identity, reason, "Identity allowed");
        Ok(entry)
    }

    /// Lift a block. Unknown or already-allowed identities succeed as no-ops.
    pub fn unblock(&self, identity: &SourceIdentity) -> ProtectorResult<UnblockOutcome> {
        if self.statics.load().blocked.contains(identity) && !self.is_statically_allowed(identity) {
            return Err(ProtectorError::PolicyViolation(format!(
                "{identity} is on the static block-list; change the configuration instead"
            )));
        }

        let changed = match self.entries.get_mut(identity) {
            Some(mut entry) if entry.status == AccessStatus::Blocked => {
                entry.status = AccessStatus::Allowed;
                entry.reason = "unblocked".to_string();
                entry.source = AccessSource::Manual;
                entry.updated_at = Utc::now();
                Some(entry.clone())
            }
            _ => None,
        };

        match changed {
            Some(entry) => {
                self.persistence.submit(PersistenceOp::UpsertAccess(entry));
                tracing::info!(identity = %identity, "Identity unblocked");
                Ok(UnblockOutcome::Unblocked)
            }
            None => Ok(UnblockOutcome::NotBlocked),
        }
    }

    fn upsert(&self, identity: &SourceIdentity, status: AccessStatus, reason: &str, source: AccessSource) -> AccessEntry {
        let now = Utc::now();
        let entry = {
            let mut slot = self.entries.entry(identity.clone()).or_insert_with(|| AccessEntry {
                identity: identity.clone(),
                status,
                reason: String::new(),
                source,
                created_at: now,
                updated_at: now,
            });
            slot.status = status;
            slot.reason = reason.to_string();
            slot.source = source;
            slot.updated_at = now;
            slot.clone()
        };
        // shard lock released before the (possibly synchronous) write
        self.persistence.submit(PersistenceOp::UpsertAccess(entry.clone()));
        entry
    }

    /// Load entries from the durable store without re-persisting them.
    ///
    /// A newer in-memory entry wins over a restored one.
    pub fn restore(&self, entries: impl IntoIterator<Item = AccessEntry>) -> usize {
        let mut restored = 0;
        for entry in entries {
            let mut keep = true;
            self.entries
                .entry(entry.identity.clone())
                .and_modify(|current| {
                    if current.updated_at >= entry.updated_at {
                        keep = false;
                    } else {
                        *current = entry.clone();
                    }
                })
                .or_insert_with(|| entry.clone());
            if keep {
                restored += 1;
            }
        }
        restored
    }

    pub fn replace_static_lists(&self, statics: StaticLists) {
        self.statics.store(Arc::new(statics));
    }

    pub fn entry(&self, identity: &SourceIdentity) -> Option<AccessEntry> {
        self.entries.get(identity).map(|e| e.clone())
    }

    pub fn entries(&self) -> Vec<AccessEntry> {
        let mut entries: Vec<AccessEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    pub fn blocked_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == AccessStatus::Blocked)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SourceIdentity {
        SourceIdentity::parse(s).unwrap()
    }

    fn registry(allowed: &[&str], blocked: &[&str]) -> AccessRegistry {
        let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        let blocked: Vec<String> = blocked.iter().map(|s| s.to_string()).collect();
        AccessRegistry::new(
            StaticLists::from_config(&allowed, &blocked).unwrap(),
            PersistenceHandle::memory_only(),
        )
    }

    #[test]
    fn test_block_is_idempotent() {
        let registry = registry(&[], &[]);
        let a = id("10.0.0.1");

        let first = registry.block(&a, "r1", AccessSource::Manual).unwrap();
        let second = registry.block(&a, "r2", AccessSource::Manual).unwrap();

        assert_eq!(registry.entries().len(), 1);
        assert_eq!(second.reason, "r2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(registry.classify(&a), Classification::Blocked);
    }

    #[test]
    fn test_unblock_is_idempotent() {
        let registry = registry(&[], &[]);
        let a = id("10.0.0.1");

        assert_eq!(registry.unblock(&a).unwrap(), UnblockOutcome::NotBlocked);
        registry.block(&a, "abuse", AccessSource::Manual).unwrap();
        assert_eq!(registry.unblock(&a).unwrap(), UnblockOutcome::Unblocked);
        assert_eq!(registry.unblock(&a).unwrap(), UnblockOutcome::NotBlocked);

        // status flipped, entry retained
        let entry = registry.entry(&a).unwrap();
        assert_eq!(entry.status, AccessStatus::Allowed);
        assert_eq!(registry.classify(&a), Classification::Allowed);
    }

    #[test]
    fn test_static_allow_list_cannot_be_blocked() {
        let registry = registry(&["10.0.0.0/24"], &[]);
        let ops = id("10.0.0.7");

        let err = registry.block(&ops, "false positive", AccessSource::AutoThreat).unwrap_err();
        assert!(matches!(err, ProtectorError::PolicyViolation(_)));
        assert!(registry.entry(&ops).is_none());
        assert_eq!(registry.classify(&ops), Classification::Allowed);
    }

    #[test]
    fn test_static_block_list() {
        let registry = registry(&[], &["203.0.113.0/24"]);
        let bad = id("203.0.113.50");

        assert_eq!(registry.classify(&bad), Classification::Blocked);
        assert!(registry.unblock(&bad).is_err());
        assert!(registry.allow(&bad, "please").is_err());
    }

    #[test]
    fn test_unclassified_by_default() {
        let registry = registry(&[], &[]);
        assert_eq!(registry.classify(&id("198.51.100.1")), Classification::Unclassified);
    }

    #[test]
    fn test_restore_keeps_newer_local_state() {
        let registry = registry(&[], &[]);
        let a = id("10.0.0.1");
        let mut stale = registry.block(&a, "local", AccessSource::Manual).unwrap();
        stale.reason = "from store".into();
        stale.updated_at -= chrono::Duration::seconds(60);

        let fresh = AccessEntry {
            identity: id("10.0.0.2"),
            status: AccessStatus::Blocked,
            reason: "from store".into(),
            source: AccessSource::AutoThreat,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(registry.restore([stale, fresh]), 1);
        assert_eq!(registry.entry(&a).unwrap().reason, "local");
        assert_eq!(registry.classify(&id("10.0.0.2")), Classification::Blocked);
    }

    #[test]
    fn test_reload_replaces_static_lists() {
        let registry = registry(&["10.0.0.1"], &[]);
        let a = id("10.0.0.1");
        assert_eq!(registry.classify(&a), Classification::Allowed);

        registry.replace_static_lists(StaticLists::default());
        assert_eq!(registry.classify(&a), Classification::Unclassified);
        assert!(registry.block(&a, "now allowed", AccessSource::AutoThreat).is_ok());
    }
}
