//! Background mirroring of registry decisions and threat events.
//!
//! # Data Flow
//! ```text
//! request path ──try_send──▶ bounded queue ──▶ writer thread ──▶ DocumentStore
//!      │                          │                 └─ retry with backoff
//!      │                          └─ full: threat events dropped (counted)
//!      └─ full + access entry: synchronous write on the caller
//! ```
//!
//! The request path never awaits the store. Access entry writes are never
//! dropped; threat events are best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::PersistenceConfig;
use crate::observability::metrics;
use crate::persistence::store::{DocumentStore, StoreError, StoreSnapshot};
use crate::resilience::backoff::calculate_backoff;
use crate::security::access_registry::AccessEntry;
use crate::security::threat::ThreatEvent;

/// A write destined for the durable store.
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    UpsertAccess(AccessEntry),
    AppendThreat(ThreatEvent),
}

impl PersistenceOp {
    /// Block/unblock decisions must reach the store.
    pub fn is_critical(&self) -> bool {
        matches!(self, PersistenceOp::UpsertAccess(_))
    }

    fn apply(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        match self {
            PersistenceOp::UpsertAccess(entry) => store.upsert_access(entry),
            PersistenceOp::AppendThreat(event) => store.append_threat(event),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PersistenceOp::UpsertAccess(_) => "access_entry",
            PersistenceOp::AppendThreat(_) => "threat_event",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicU64,
    written: AtomicU64,
    failures: AtomicU64,
    dropped_events: AtomicU64,
}

/// Persistence health as reported through the stats endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PersistenceStatus {
    /// `durable` when a store is attached, `memory` otherwise.
    pub mode: &'static str,
    pub pending: u64,
    pub written: u64,
    pub failures: u64,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

struct Attached {
    tx: mpsc::Sender<PersistenceOp>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

/// Cheap, cloneable handle the request path uses to enqueue writes.
#[derive(Clone)]
pub struct PersistenceHandle {
    attached: Option<Arc<Attached>>,
    counters: Arc<Counters>,
}

impl PersistenceHandle {
    /// A handle that discards every write (memory-only mode).
    pub fn memory_only() -> Self {
        Self {
            attached: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.attached.is_some()
    }

    /// Enqueue a write without waiting for it.
    pub fn submit(&self, op: PersistenceOp) {
        let Some(attached) = &self.attached else {
            return;
        };

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match attached.tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) if op.is_critical() => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!("Persistence queue full; writing access entry synchronously");
                // single attempt: the caller is on the request path
                if let Err(e) = op.apply(attached.store.as_ref()) {
                    self.record_failure(&op, &e);
                } else {
                    self.counters.written.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Full(op)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                metrics::record_persistence_dropped();
                tracing::warn!(kind = op.kind(), "Persistence queue full; dropping event");
            }
            Err(TrySendError::Closed(op)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(kind = op.kind(), "Persistence worker stopped; write lost");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn status(&self) -> PersistenceStatus {
        PersistenceStatus {
            mode: if self.is_durable() { "durable" } else { "memory" },
            pending: self.counters.pending.load(Ordering::SeqCst),
            written: self.counters.written.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
        }
    }

    /// Wait until the queue drains or `timeout` elapses. Returns whether it drained.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.counters.pending.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn record_failure(&self, op: &PersistenceOp, error: &StoreError) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_persistence_failure(op.kind());
        tracing::error!(kind = op.kind(), error = %error, "Persistence write failed");
    }
}

/// Owns the writer thread. Dropping every handle and calling
/// [`PersistenceWorker::join`] flushes what is queued.
pub struct PersistenceWorker {
    thread: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    /// Wait for the writer to drain its queue and exit.
    ///
    /// Only returns once every [`PersistenceHandle`] has been dropped.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Persistence worker panicked");
            }
        }
    }
}

/// Attach `store` and start the writer thread.
pub fn start(store: Arc<dyn DocumentStore>, config: &PersistenceConfig) -> std::io::Result<(PersistenceHandle, PersistenceWorker)> {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let counters = Arc::new(Counters::default());
    let retry = RetryPolicy::from(config);

    let handle = PersistenceHandle {
        attached: Some(Arc::new(Attached {
            tx,
            store: store.clone(),
            retry,
        })),
        counters: counters.clone(),
    };

    let worker_handle = PersistenceHandle {
        attached: None,
        counters,
    };
    let thread = std::thread::Builder::new()
        .name("persistence-writer".into())
        .spawn(move || run_writer(rx, store, retry, worker_handle))?;

    tracing::info!(queue_capacity = config.queue_capacity, "Persistence worker started");
    Ok((handle, PersistenceWorker { thread: Some(thread) }))
}

fn run_writer(
    mut rx: mpsc::Receiver<PersistenceOp>,
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
    handle: PersistenceHandle,
) {
    while let Some(op) = rx.blocking_recv() {
        write_with_retry(&op, store.as_ref(), retry, &handle);
        handle.counters.pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::info!(store = %store.describe(), "Persistence worker drained and stopped");
}

fn write_with_retry(op: &PersistenceOp, store: &dyn DocumentStore, retry: RetryPolicy, handle: &PersistenceHandle) {
    for attempt in 1..=retry.max_attempts {
        match op.apply(store) {
            Ok(()) => {
                handle.counters.written.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < retry.max_attempts => {
                let delay = calculate_backoff(attempt, retry.base_delay_ms, retry.max_delay_ms);
                tracing::warn!(kind = op.kind(), attempt, delay = ?delay, error = %e, "Retrying persistence write");
                std::thread::sleep(delay);
            }
            Err(e) => handle.record_failure(op, &e),
        }
    }
}

/// Load the durable snapshot, keeping at most `max_events` recent threat
/// events, giving up after `timeout`.
pub async fn hydrate(
    store: Arc<dyn DocumentStore>,
    max_events: usize,
    timeout: Duration,
) -> Result<StoreSnapshot, StoreError> {
    let load = tokio::task::spawn_blocking(move || store.load_snapshot(max_events));
    match tokio::time::timeout(timeout, load).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StoreError::Unavailable(format!("hydration task failed: {join_error}"))),
        Err(_) => Err(StoreError::Unavailable(format!(
            "hydration did not finish within {timeout:?}"
        ))),
    }
}
