pub mod address;
pub mod config;
pub mod envelope;
pub mod logging;
pub mod status;

pub use tracing;

/// Broadcast to every long-running task when the process is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
