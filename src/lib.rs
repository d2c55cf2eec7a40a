//! Inbound access-control layer ("network protector") for Axum services.

pub mod admin;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod persistence;
pub mod resilience;
pub mod security;

pub use config::schema::ProtectorConfig;
pub use error::{ProtectorError, ProtectorResult};
pub use http::{protect, AppState, HttpServer};
pub use lifecycle::{bootstrap, Protector, Shutdown};
pub use security::{Decision, DenyReason, RequestGate, SourceIdentity};
