//! Observability: metrics definitions and recording helpers.

pub mod metrics;
