//! Outbound delivery: the SMTP client, MX-ordered relay, retry worker,
//! content scanners, and the HA leader gate.

pub mod client;
pub mod leader;
pub mod relay;
pub mod scan;
pub mod worker;

pub use client::{ClientError, Reply, SmtpClient};
pub use leader::LeaderLock;
pub use relay::{DeliveryResult, Relay};
pub use scan::{ClamAvScanner, RetroIndex, ScanVerdict, Scanner, ScannerSet, content_hash};
pub use worker::RetryWorker;
