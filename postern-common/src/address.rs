use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("missing domain in '{0}'")]
    MissingDomain(String),

    #[error("unparsable address '{0}': {1}")]
    Unparsable(String, String),
}

/// A validated `local@domain` mailbox, as carried in `MAIL FROM`/`RCPT TO`
/// paths. Group syntax is rejected; angle brackets are stripped on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    addr: String,
    at: usize,
}

impl Address {
    /// Parses a forward/reverse path such as `<user@example.org>`.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] when the input is empty, has no domain part,
    /// or fails RFC 5322 address parsing.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let stripped = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);

        if stripped.is_empty() {
            return Err(AddressError::Empty);
        }

        let parsed = mailparse::addrparse(stripped)
            .map_err(|e| AddressError::Unparsable(stripped.to_string(), e.to_string()))?;

        let addr = match parsed.first() {
            Some(MailAddr::Single(single)) => single.addr.clone(),
            _ => return Err(AddressError::Unparsable(stripped.to_string(), "not a single mailbox".to_string())),
        };

        let at = addr
            .rfind('@')
            .filter(|at| *at > 0 && at + 1 < addr.len())
            .ok_or_else(|| AddressError::MissingDomain(addr.clone()))?;

        Ok(Self { addr, at })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.addr[..self.at]
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.addr[self.at + 1..]
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}
