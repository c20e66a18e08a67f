//! HTTP surface of the caching module proxy.
//!
//! This crate provides:
//! - The module proxy protocol endpoints (`@v/list`, `.info`, `.mod`, `.zip`, `@latest`)
//! - A health endpoint backed by the object store
//! - Prometheus request metrics

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
