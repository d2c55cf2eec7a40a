//! Startup orchestration.
//!
//! # Design Decisions
//! - Fail fast on configuration errors, including invalid patterns
//! - Subsystems initialize in order, not concurrently
//! - The gate is returned only after hydration settled, so previously
//!   blocked identities are never seen as unclassified

use std::sync::Arc;
use std::time::Duration;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, PersistenceConfig, ProtectorConfig};
use crate::error::ProtectorResult;
use crate::persistence::synchronizer::{hydrate, start};
use crate::persistence::{open_store, PersistenceHandle, PersistenceWorker, StoreSnapshot};
use crate::security::gate::RequestGate;

/// A ready-to-serve gate plus the persistence worker backing it.
pub struct Protector {
    pub gate: Arc<RequestGate>,
    /// `None` in memory-only mode.
    pub worker: Option<PersistenceWorker>,
}

impl Protector {
    /// Drop the gate and wait for queued writes to land.
    ///
    /// Blocks; call from a blocking context. Any other clone of the gate must
    /// already be gone or this waits for it.
    pub fn shutdown(self) {
        let Protector { gate, worker } = self;
        drop(gate);
        if let Some(worker) = worker {
            worker.join();
        }
    }
}

/// Build the protector from a configuration.
pub async fn bootstrap(config: &ProtectorConfig) -> ProtectorResult<Protector> {
    validate_config(config).map_err(ConfigError::Validation)?;

    let (persistence, worker, snapshot) =
        attach_persistence(&config.persistence, config.threat_detection.max_events_in_memory).await;
    let gate = RequestGate::from_config(config, persistence)?;
    gate.hydrate(snapshot);

    tracing::info!(
        private_mode = config.private_mode,
        require_auth = config.require_auth,
        rate_limit = config.rate_limit.enabled,
        threat_detection = config.threat_detection.enabled,
        persistence = gate.persistence().status().mode,
        "Protector ready"
    );

    Ok(Protector {
        gate: Arc::new(gate),
        worker,
    })
}

/// Open, hydrate and start the durable mirror, or fall back to memory-only.
async fn attach_persistence(
    config: &PersistenceConfig,
    max_events: usize,
) -> (PersistenceHandle, Option<PersistenceWorker>, StoreSnapshot) {
    if !config.enabled {
        tracing::info!("Persistence disabled; running memory-only");
        return (PersistenceHandle::memory_only(), None, StoreSnapshot::default());
    }

    let store = match open_store(&config.connection) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(connection = %config.connection, error = %e, "Store unreachable; running memory-only");
            return (PersistenceHandle::memory_only(), None, StoreSnapshot::default());
        }
    };

    let timeout = Duration::from_secs(config.hydrate_timeout_secs);
    let snapshot = match hydrate(store.clone(), max_events, timeout).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(store = %store.describe(), error = %e, "Hydration failed; running memory-only");
            return (PersistenceHandle::memory_only(), None, StoreSnapshot::default());
        }
    };

    let description = store.describe();
    match start(store, config) {
        Ok((handle, worker)) => {
            tracing::info!(
                store = %description,
                entries = snapshot.access_entries.len(),
                events = snapshot.threat_events.len(),
                "Persistence attached"
            );
            (handle, Some(worker), snapshot)
        }
        Err(e) => {
            tracing::warn!(store = %description, error = %e, "Persistence worker failed to start; running memory-only");
            (PersistenceHandle::memory_only(), None, snapshot)
        }
    }
}
