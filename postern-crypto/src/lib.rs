//! TLS context construction and credential hashing.
//!
//! Everything here fails fast: a server that cannot load its certificate or
//! users file should not come up half-secured.

pub mod password;
pub mod tls;

pub use password::{
    constant_time_eq, hash_password, is_hashed, migrate_users_file, verify_password,
};
pub use tls::{TlsError, TlsInfo, TlsSettings};
