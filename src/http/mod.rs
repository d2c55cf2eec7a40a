//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, tower-http layers)
//!     → request.rs (request ID assigned and propagated)
//!     → middleware/protection.rs (buffer body, resolve identity, run gate)
//!     → admitted: admin routes or the protected application
//!     → denied: response.rs (JSON reason code, no pattern detail)
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{protect, AppState, HttpServer};
