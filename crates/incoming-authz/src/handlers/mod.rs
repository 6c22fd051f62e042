//! HTTP request handlers.

pub mod check;
pub mod health;
pub mod metrics;
pub mod snapshot;

pub use check::check;
pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;
pub use snapshot::get_snapshot;
