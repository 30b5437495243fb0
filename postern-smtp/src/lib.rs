//! SMTP ingress: the RFC 5321 state machine, STARTTLS, SASL, DATA framing,
//! and the connection/rate admission layer in front of it all.

pub mod command;
pub mod connection;
pub mod limits;
pub mod sasl;
pub mod server;
pub mod session;
pub mod state;

pub use command::Command;
pub use connection::{Connection, ConnectionError, MAX_LINE_LENGTH};
pub use limits::{ConnectionLedger, LimitsConfig, RateLimiter};
pub use server::{ServerError, SmtpServer};
pub use session::{Session, SessionServices};
pub use state::{Action, Gates, State};
