//! `Authentication-Results` rendering (RFC 8601 subset).

use crate::dkim::DkimOutcome;
use crate::dmarc::{DmarcOutcome, DmarcPolicy};
use crate::spf::SpfOutcome;

/// The three sub-results attached to one inbound DATA, rendered exactly once
/// into the header prepended to the stored message.
#[derive(Debug, Clone)]
pub struct AuthResults {
    pub spf: SpfOutcome,
    pub dkim: DkimOutcome,
    pub dmarc: DmarcOutcome,
}

impl AuthResults {
    /// `<authserv-id>; spf=<r> smtp.mailfrom=<addr>; dkim=<r> header.d=<d>;
    /// dmarc=<r>[ policy=<p>]`
    #[must_use]
    pub fn to_header_value(&self, authserv_id: &str) -> String {
        let mut header = format!("{authserv_id}; spf={}", self.spf.result.as_str());
        if !self.spf.mail_from.is_empty() {
            header.push_str(&format!(" smtp.mailfrom={}", self.spf.mail_from));
        }

        header.push_str(&format!("; dkim={}", self.dkim.result.as_str()));
        if !self.dkim.domain.is_empty() {
            header.push_str(&format!(" header.d={}", self.dkim.domain));
        }

        header.push_str(&format!("; dmarc={}", self.dmarc.result.as_str()));
        match self.dmarc.policy {
            DmarcPolicy::None => {}
            DmarcPolicy::Quarantine => header.push_str(" policy=quarantine"),
            DmarcPolicy::Reject => header.push_str(" policy=reject"),
        }

        header
    }

    /// The full header line, CRLF-terminated, ready to prepend to the raw
    /// message.
    #[must_use]
    pub fn to_header_line(&self, authserv_id: &str) -> String {
        format!(
            "Authentication-Results: {}\r\n",
            self.to_header_value(authserv_id)
        )
    }
}
