//! Durable mirror of access decisions and threat events.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     store.rs (open connection) → synchronizer::hydrate (bounded by timeout)
//!     → registry + threat log restored → gate starts admitting
//!     unreachable store → memory-only mode, logged
//!
//! Runtime:
//!     registry / detector → PersistenceHandle::submit → writer thread → store
//! ```
//!
//! # Design Decisions
//! - The store only replays and backs up state; it never makes decisions
//! - Write failures are retried off the request path and surfaced via stats

pub mod store;
pub mod synchronizer;

pub use store::{open_store, DocumentStore, FileStore, MemoryStore, StoreError, StoreSnapshot};
pub use synchronizer::{PersistenceHandle, PersistenceOp, PersistenceStatus, PersistenceWorker};
