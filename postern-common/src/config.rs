//! Server configuration.
//!
//! Deserialized from a TOML file with per-field defaults, then validated.
//! A handful of secrets (admin token, TLS material) can be overridden from
//! the environment so they never have to live in the config file.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_MESSAGE_SIZE: usize = 1024;
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot parse users file: {0}")]
    ParseUsers(#[from] serde_yaml::Error),

    #[error("invalid config: {key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Mail domain this server answers for. The only required option.
    pub domain: String,

    #[serde(default = "defaults::host")]
    pub host: String,

    /// Plaintext-with-STARTTLS listener port.
    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,

    /// Implicit-TLS listener port; 0 disables the listener.
    #[serde(default)]
    pub smtps_port: u16,

    /// Accepted for compatibility; the IMAP frontend is a separate process
    /// that reads the mail root directly.
    #[serde(default = "defaults::imap_port")]
    pub imap_port: u16,

    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    #[serde(default = "defaults::mail_root")]
    pub mail_root: PathBuf,

    #[serde(default = "defaults::queue_root")]
    pub queue_root: PathBuf,

    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// Refuse MAIL/RCPT/DATA on sessions that never negotiated TLS.
    #[serde(default)]
    pub tls_required: bool,

    /// Refuse AUTH before STARTTLS.
    #[serde(default = "defaults::yes")]
    pub require_starttls: bool,

    /// 1/2/3 select a TLS 1.0/1.1/1.2 floor. See `postern-crypto` for the
    /// clamping applied to 1 and 2.
    #[serde(default = "defaults::min_tls_version")]
    pub min_tls_version: u8,

    #[serde(default = "defaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "defaults::log_level")]
    pub log_level: LogLevel,

    #[serde(default = "defaults::users_file")]
    pub users_file: PathBuf,

    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default = "defaults::global_max_connections")]
    pub global_max_connections: usize,

    #[serde(default = "defaults::max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    #[serde(default = "defaults::max_messages_per_hour")]
    pub max_messages_per_hour: u32,

    #[serde(default = "defaults::commands_per_minute")]
    pub commands_per_minute: u32,

    /// Bytes accepted in a single DATA phase. Validated to 1 KiB..=100 MiB.
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    /// Per-command read timeout, seconds.
    #[serde(default = "defaults::smtp_timeout")]
    pub smtp_timeout: u64,

    /// DATA-phase read timeout, seconds.
    #[serde(default = "defaults::data_timeout")]
    pub data_timeout: u64,

    #[serde(default = "defaults::max_queue_depth")]
    pub max_queue_depth: usize,

    /// Seconds to wait for in-flight sessions during shutdown.
    #[serde(default = "defaults::drain_timeout")]
    pub drain_timeout: u64,

    /// When set, the retry worker only runs while holding the leader lock.
    #[serde(default)]
    pub ha_enabled: bool,

    #[serde(default = "defaults::dns_server")]
    pub dns_server: String,

    /// Identifier stamped into `Authentication-Results`; defaults to `domain`.
    #[serde(default)]
    pub authserv_id: Option<String>,

    #[serde(default = "defaults::clamav_addr")]
    pub clamav_addr: String,

    #[serde(default = "defaults::yes")]
    pub scan_enabled: bool,
}

mod defaults {
    use std::path::PathBuf;

    use super::LogLevel;

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }

    pub const fn smtp_port() -> u16 {
        2525
    }

    pub const fn imap_port() -> u16 {
        1430
    }

    pub const fn admin_port() -> u16 {
        8025
    }

    pub fn mail_root() -> PathBuf {
        PathBuf::from("data/mail")
    }

    pub fn queue_root() -> PathBuf {
        PathBuf::from("data/queue")
    }

    pub const fn yes() -> bool {
        true
    }

    pub const fn min_tls_version() -> u8 {
        3
    }

    pub fn log_file() -> PathBuf {
        PathBuf::from("logs/postern.log")
    }

    pub const fn log_level() -> LogLevel {
        LogLevel::Info
    }

    pub fn users_file() -> PathBuf {
        PathBuf::from("users.yml")
    }

    pub const fn global_max_connections() -> usize {
        500
    }

    pub const fn max_connections_per_ip() -> usize {
        10
    }

    pub const fn max_messages_per_hour() -> u32 {
        600
    }

    pub const fn commands_per_minute() -> u32 {
        120
    }

    pub const fn max_message_size() -> usize {
        10 * 1024 * 1024
    }

    pub const fn smtp_timeout() -> u64 {
        300
    }

    pub const fn data_timeout() -> u64 {
        600
    }

    pub const fn max_queue_depth() -> usize {
        100_000
    }

    pub const fn drain_timeout() -> u64 {
        30
    }

    pub fn dns_server() -> String {
        "8.8.8.8:53".to_string()
    }

    pub fn clamav_addr() -> String {
        "127.0.0.1:3310".to_string()
    }
}

impl ServerConfig {
    /// Loads, applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, unparsable, or any option is out
    /// of its documented range.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
        for var in ["TLS_CERT", "TLS_CERT_PATH"] {
            if let Ok(path) = std::env::var(var) {
                self.tls_cert = Some(PathBuf::from(path));
            }
        }
        for var in ["TLS_KEY", "TLS_KEY_PATH"] {
            if let Ok(path) = std::env::var(var) {
                self.tls_key = Some(PathBuf::from(path));
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "domain",
                reason: "must not be empty".to_string(),
            });
        }
        if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&self.max_message_size) {
            return Err(ConfigError::Invalid {
                key: "max_message_size",
                reason: format!(
                    "{} outside {MIN_MESSAGE_SIZE}..={MAX_MESSAGE_SIZE}",
                    self.max_message_size
                ),
            });
        }
        if self.smtp_timeout < 30 {
            return Err(ConfigError::Invalid {
                key: "smtp_timeout",
                reason: format!("{} below minimum of 30", self.smtp_timeout),
            });
        }
        if self.data_timeout < 60 {
            return Err(ConfigError::Invalid {
                key: "data_timeout",
                reason: format!("{} below minimum of 60", self.data_timeout),
            });
        }
        if !(1..=3).contains(&self.min_tls_version) {
            return Err(ConfigError::Invalid {
                key: "min_tls_version",
                reason: format!("{} outside 1..=3", self.min_tls_version),
            });
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid {
                key: "tls_key",
                reason: "tls_cert and tls_key must be set together".to_string(),
            });
        }
        if self.smtps_port != 0 && self.tls_cert.is_none() {
            return Err(ConfigError::Invalid {
                key: "smtps_port",
                reason: "implicit TLS requires tls_cert/tls_key".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn authserv_id(&self) -> &str {
        self.authserv_id.as_deref().unwrap_or(&self.domain)
    }
}

/// The YAML users file:
///
/// ```yaml
/// users:
///   alice: { password: "$pbkdf2-sha256$100000$...$..." }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: BTreeMap<String, UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub password: String,
}

impl UsersFile {
    /// # Errors
    ///
    /// Fails when the file is unreadable or not valid YAML.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
