//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gate decisions, threat detections, persistence failures:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all log lines of a request via the trace span
//! - Metric calls are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
