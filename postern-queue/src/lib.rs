//! Durable mail queue with lease-based in-flight semantics.

pub mod message;
pub mod queue;
pub mod retry;

pub use message::QueueMessage;
pub use queue::{DEFAULT_LEASE_TIMEOUT, DEFAULT_MAX_DEPTH, MailQueue, QueueError};
pub use retry::{BACKOFF_TABLE, backoff};
