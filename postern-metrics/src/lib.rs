//! Observability: the metric registry, readiness state, and the HTTP
//! endpoints exposing both.

pub mod health;
pub mod registry;
pub mod server;

pub use health::{HealthState, Readiness};
pub use registry::Metrics;
pub use server::{AdminError, AdminServer, AdminState};
