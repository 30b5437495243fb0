//! The authenticity pipeline: SPF, DKIM and DMARC evaluation for inbound
//! mail, rendered into a single `Authentication-Results` header.

pub mod dkim;
pub mod dmarc;
pub mod results;
pub mod spf;

#[cfg(test)]
pub(crate) mod test_support;

use std::net::IpAddr;
use std::sync::Arc;

use mailparse::MailAddr;

use postern_dns::Lookup;

pub use dkim::{DkimOutcome, DkimResult};
pub use dmarc::{DmarcOutcome, DmarcPolicy, DmarcResult};
pub use results::AuthResults;
pub use spf::{SpfOutcome, SpfResult};

/// Extracts the RFC 5322 From domain from a raw header block.
#[must_use]
pub fn from_domain(headers: &str) -> Option<String> {
    let fields = dkim::canon::unfold_headers(headers);
    let (_, value) = fields.iter().find(|(name, _)| name == "from")?;

    let parsed = mailparse::addrparse(value.trim()).ok()?;
    let addr = match parsed.first()? {
        MailAddr::Single(single) => single.addr.clone(),
        MailAddr::Group(group) => group.addrs.first()?.addr.clone(),
    };

    addr.rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
}

/// Runs the full pipeline for one inbound message.
pub struct Authenticator {
    lookup: Arc<dyn Lookup>,
}

impl Authenticator {
    #[must_use]
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        Self { lookup }
    }

    /// SPF (client IP + envelope), DKIM verify, then DMARC over the two.
    pub async fn verify_inbound(
        &self,
        client_ip: IpAddr,
        mail_from: &str,
        helo: &str,
        headers: &str,
        body: &str,
    ) -> AuthResults {
        let spf = spf::check(self.lookup.as_ref(), client_ip, mail_from, helo).await;
        let dkim = dkim::verify(self.lookup.as_ref(), headers, body).await;

        let from_domain = from_domain(headers).unwrap_or_default();
        let input = dmarc::DmarcInput {
            from_domain,
            dkim_pass: dkim.result == DkimResult::Pass,
            dkim_domain: dkim.domain.clone(),
            spf_pass: spf.result == SpfResult::Pass,
            spf_domain: spf.domain.clone(),
        };
        let dmarc = dmarc::evaluate(self.lookup.as_ref(), &input).await;

        AuthResults { spf, dkim, dmarc }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::StubLookup;

    #[test]
    fn extracts_from_domain() {
        let headers = "Subject: x\r\nFrom: Alice <Alice@Example.ORG>\r\n";
        assert_eq!(from_domain(headers), Some("example.org".to_string()));
        assert_eq!(from_domain("Subject: x\r\n"), None);
    }

    #[tokio::test]
    async fn pipeline_rejects_on_dmarc_policy() {
        // SPF fail, no DKIM, published p=reject: the S6 scenario.
        let lookup = StubLookup::new()
            .txt("bad.example", "v=spf1 -all")
            .txt("_dmarc.bad.example", "v=DMARC1; p=reject");

        let authenticator = Authenticator::new(Arc::new(lookup));
        let results = authenticator
            .verify_inbound(
                "192.0.2.1".parse().unwrap(),
                "<spoof@bad.example>",
                "helo.example",
                "From: spoof@bad.example\r\nSubject: hi\r\n",
                "body\r\n",
            )
            .await;

        assert_eq!(results.spf.result, SpfResult::Fail);
        assert_eq!(results.dkim.result, DkimResult::None);
        assert_eq!(results.dmarc.result, DmarcResult::Fail);
        assert_eq!(results.dmarc.policy, DmarcPolicy::Reject);

        let header = results.to_header_value("mx.example.org");
        assert!(header.contains("spf=fail"));
        assert!(header.contains("dmarc=fail policy=reject"));
    }

    #[tokio::test]
    async fn pipeline_passes_aligned_spf() {
        let lookup = StubLookup::new()
            .txt("good.example", "v=spf1 ip4:192.0.2.9 -all")
            .txt("_dmarc.good.example", "v=DMARC1; p=reject");

        let authenticator = Authenticator::new(Arc::new(lookup));
        let results = authenticator
            .verify_inbound(
                "192.0.2.9".parse().unwrap(),
                "<user@good.example>",
                "helo.example",
                "From: user@good.example\r\n",
                "body\r\n",
            )
            .await;

        assert_eq!(results.spf.result, SpfResult::Pass);
        assert_eq!(results.dmarc.result, DmarcResult::Pass);
    }
}
