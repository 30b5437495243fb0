//! SPF evaluation (RFC 7208 subset).
//!
//! Terms are processed in record order; `redirect=` applies only when no
//! mechanism matched. The DNS budget is a hard 10 across the whole
//! evaluation, including `include`/`redirect` recursion.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;

use postern_dns::Lookup;

const LOOKUP_BUDGET: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Pass,
    Fail,
    SoftFail,
    Neutral,
    TempError,
    PermError,
}

impl SpfResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::Neutral => "neutral",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// Envelope sender with angle brackets stripped; empty for the null path.
    pub mail_from: String,
    /// The domain evaluation started from (MAIL FROM domain, else HELO).
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    const fn result(self) -> SpfResult {
        match self {
            Self::Pass => SpfResult::Pass,
            Self::Fail => SpfResult::Fail,
            Self::SoftFail => SpfResult::SoftFail,
            Self::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mechanism {
    All,
    Ip4 { net: Ipv4Addr, prefix: u8 },
    Ip6 { net: Ipv6Addr, prefix: u8 },
    A { domain: Option<String>, prefix: Option<u8> },
    Mx { domain: Option<String>, prefix: Option<u8> },
    Include(String),
    Exists(String),
    /// Parsed but never matched; `ptr` is deprecated and not evaluated.
    Ptr,
}

#[derive(Debug, Clone)]
struct Term {
    qualifier: Qualifier,
    mechanism: Mechanism,
}

#[derive(Debug, Clone, Default)]
struct Record {
    terms: Vec<Term>,
    redirect: Option<String>,
}

fn parse_qualifier(term: &str) -> (Qualifier, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (Qualifier::Pass, &term[1..]),
        Some(b'-') => (Qualifier::Fail, &term[1..]),
        Some(b'~') => (Qualifier::SoftFail, &term[1..]),
        Some(b'?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    }
}

fn parse_record(txt: &str) -> Result<Record, ()> {
    let mut record = Record::default();

    for raw in txt.split_ascii_whitespace().skip(1) {
        if let Some(target) = raw.strip_prefix("redirect=") {
            record.redirect = Some(target.to_string());
            continue;
        }
        if raw.starts_with("exp=") {
            continue;
        }

        let (qualifier, rest) = parse_qualifier(raw);
        let (name, argument) = match rest.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (rest, None),
        };

        // A bare "a/24" carries its CIDR on the name side.
        let (name, name_cidr) = match name.split_once('/') {
            Some((n, c)) => (n, Some(c)),
            None => (name, None),
        };
        let (argument, arg_cidr) = match argument.and_then(|a| a.split_once('/')) {
            Some((a, c)) => (Some(a), Some(c)),
            None => (argument, None),
        };

        let cidr = arg_cidr.or(name_cidr);
        let prefix = match cidr {
            Some(c) => Some(c.parse::<u8>().map_err(|_| ())?),
            None => None,
        };

        let mechanism = match name.to_ascii_lowercase().as_str() {
            "all" => Mechanism::All,
            "ip4" => {
                let net: Ipv4Addr = argument.ok_or(())?.parse().map_err(|_| ())?;
                Mechanism::Ip4 {
                    net,
                    prefix: prefix.unwrap_or(32).min(32),
                }
            }
            "ip6" => {
                let net: Ipv6Addr = argument.ok_or(())?.parse().map_err(|_| ())?;
                Mechanism::Ip6 {
                    net,
                    prefix: prefix.unwrap_or(128).min(128),
                }
            }
            "a" => Mechanism::A {
                domain: argument.map(str::to_string),
                prefix,
            },
            "mx" => Mechanism::Mx {
                domain: argument.map(str::to_string),
                prefix,
            },
            "include" => Mechanism::Include(argument.ok_or(())?.to_string()),
            "exists" => Mechanism::Exists(argument.ok_or(())?.to_string()),
            "ptr" => Mechanism::Ptr,
            _ => return Err(()),
        };

        record.terms.push(Term {
            qualifier,
            mechanism,
        });
    }

    Ok(record)
}

/// Substitutes the macro subset `%{i} %{s} %{h} %{d} %{l} %{o}` plus the
/// `%% %_ %-` escapes.
#[must_use]
pub fn expand_macros(input: &str, ip: &IpAddr, sender: &str, helo: &str, domain: &str) -> String {
    let mut out = input.to_string();

    out = out.replace("%{i}", &ip.to_string());
    out = out.replace("%{s}", sender);
    out = out.replace("%{h}", helo);
    out = out.replace("%{d}", domain);

    if let Some((local, sender_domain)) = sender.split_once('@') {
        out = out.replace("%{l}", local);
        out = out.replace("%{o}", sender_domain);
    }

    out = out.replace("%%", "%");
    out = out.replace("%_", " ");
    out = out.replace("%-", "%20");

    out
}

fn ipv4_matches(client: Ipv4Addr, net: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - u32::from(prefix.min(32)));
    (u32::from(client) & mask) == (u32::from(net) & mask)
}

fn ipv6_matches(client: Ipv6Addr, net: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - u32::from(prefix.min(128)));
    (u128::from(client) & mask) == (u128::from(net) & mask)
}

struct Evaluator<'a> {
    lookup: &'a dyn Lookup,
    client_ip: IpAddr,
    sender: String,
    helo: String,
    lookups: u32,
}

enum MechanismOutcome {
    Match,
    NoMatch,
    Error(SpfResult),
}

impl Evaluator<'_> {
    fn charge(&mut self) -> bool {
        self.lookups += 1;
        self.lookups <= LOOKUP_BUDGET
    }

    async fn host_matches(&self, host: &str, prefix: Option<u8>) -> Result<bool, SpfResult> {
        match self.client_ip {
            IpAddr::V4(client) => {
                let addrs = match self.lookup.a(host).await {
                    Ok(addrs) => addrs,
                    Err(e) => return dns_no_data(e).map(|()| false),
                };
                Ok(addrs
                    .iter()
                    .any(|net| ipv4_matches(client, *net, prefix.unwrap_or(32))))
            }
            IpAddr::V6(client) => {
                let addrs = match self.lookup.aaaa(host).await {
                    Ok(addrs) => addrs,
                    Err(e) => return dns_no_data(e).map(|()| false),
                };
                Ok(addrs
                    .iter()
                    .any(|net| ipv6_matches(client, *net, prefix.unwrap_or(128))))
            }
        }
    }

    async fn match_mechanism(&mut self, mechanism: &Mechanism, domain: &str) -> MechanismOutcome {
        match mechanism {
            Mechanism::All => MechanismOutcome::Match,
            Mechanism::Ptr => MechanismOutcome::NoMatch,

            Mechanism::Ip4 { net, prefix } => match self.client_ip {
                IpAddr::V4(client) if ipv4_matches(client, *net, *prefix) => {
                    MechanismOutcome::Match
                }
                _ => MechanismOutcome::NoMatch,
            },

            Mechanism::Ip6 { net, prefix } => match self.client_ip {
                IpAddr::V6(client) if ipv6_matches(client, *net, *prefix) => {
                    MechanismOutcome::Match
                }
                _ => MechanismOutcome::NoMatch,
            },

            Mechanism::A {
                domain: target,
                prefix,
            } => {
                if !self.charge() {
                    return MechanismOutcome::Error(SpfResult::PermError);
                }
                let host = self.target(target.as_deref(), domain);
                match self.host_matches(&host, *prefix).await {
                    Ok(true) => MechanismOutcome::Match,
                    Ok(false) => MechanismOutcome::NoMatch,
                    Err(result) => MechanismOutcome::Error(result),
                }
            }

            Mechanism::Mx {
                domain: target,
                prefix,
            } => {
                if !self.charge() {
                    return MechanismOutcome::Error(SpfResult::PermError);
                }
                let host = self.target(target.as_deref(), domain);
                let records = match self.lookup.mx(&host).await {
                    Ok(records) => records,
                    Err(e) => {
                        return match dns_no_data(e) {
                            Ok(()) => MechanismOutcome::NoMatch,
                            Err(result) => MechanismOutcome::Error(result),
                        };
                    }
                };
                for record in records.iter().take(10) {
                    match self.host_matches(&record.exchange, *prefix).await {
                        Ok(true) => return MechanismOutcome::Match,
                        Ok(false) => {}
                        Err(result) => return MechanismOutcome::Error(result),
                    }
                }
                MechanismOutcome::NoMatch
            }

            Mechanism::Include(target) => {
                let expanded = self.target(Some(target), domain);
                match self.evaluate(expanded).await {
                    SpfResult::Pass => MechanismOutcome::Match,
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => {
                        MechanismOutcome::NoMatch
                    }
                    SpfResult::TempError => MechanismOutcome::Error(SpfResult::TempError),
                    SpfResult::PermError | SpfResult::None => {
                        MechanismOutcome::Error(SpfResult::PermError)
                    }
                }
            }

            Mechanism::Exists(target) => {
                if !self.charge() {
                    return MechanismOutcome::Error(SpfResult::PermError);
                }
                let expanded = self.target(Some(target), domain);
                match self.lookup.a(&expanded).await {
                    Ok(addrs) if !addrs.is_empty() => MechanismOutcome::Match,
                    Ok(_) => MechanismOutcome::NoMatch,
                    Err(e) => match dns_no_data(e) {
                        Ok(()) => MechanismOutcome::NoMatch,
                        Err(result) => MechanismOutcome::Error(result),
                    },
                }
            }
        }
    }

    fn target(&self, explicit: Option<&str>, current: &str) -> String {
        explicit.map_or_else(
            || current.to_string(),
            |t| expand_macros(t, &self.client_ip, &self.sender, &self.helo, current),
        )
    }

    /// Boxed because `include`/`redirect` recurse.
    fn evaluate(&mut self, domain: String) -> Pin<Box<dyn Future<Output = SpfResult> + Send + '_>> {
        Box::pin(async move {
            if !self.charge() {
                return SpfResult::PermError;
            }

            let txts = match self.lookup.txt(&domain).await {
                Ok(txts) => txts,
                Err(e) => return classify_dns(&e),
            };

            let records: Vec<&String> = txts
                .iter()
                .filter(|t| *t == "v=spf1" || t.starts_with("v=spf1 "))
                .collect();

            if records.is_empty() {
                return SpfResult::None;
            }
            if records.len() > 1 {
                return SpfResult::PermError;
            }

            let Ok(record) = parse_record(records[0]) else {
                return SpfResult::PermError;
            };

            for term in &record.terms {
                match self.match_mechanism(&term.mechanism, &domain).await {
                    MechanismOutcome::Match => return term.qualifier.result(),
                    MechanismOutcome::NoMatch => {}
                    MechanismOutcome::Error(result) => return result,
                }
            }

            if let Some(redirect) = record.redirect {
                let target =
                    expand_macros(&redirect, &self.client_ip, &self.sender, &self.helo, &domain);
                return self.evaluate(target).await;
            }

            SpfResult::Neutral
        })
    }
}

fn classify_dns(error: &postern_dns::DnsError) -> SpfResult {
    if error.is_temporary() {
        SpfResult::TempError
    } else {
        SpfResult::None
    }
}

/// Mechanism lookups treat NXDOMAIN as "no data"; only transient failures
/// abort the evaluation.
fn dns_no_data(error: postern_dns::DnsError) -> Result<(), SpfResult> {
    if error.is_temporary() {
        Err(SpfResult::TempError)
    } else {
        Ok(())
    }
}

fn strip_path(path: &str) -> &str {
    let trimmed = path.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// Evaluates SPF for one inbound transaction.
///
/// `mail_from` is the raw reverse-path; the null path falls back to the HELO
/// domain for record selection.
pub async fn check(
    lookup: &dyn Lookup,
    client_ip: IpAddr,
    mail_from: &str,
    helo: &str,
) -> SpfOutcome {
    let sender = strip_path(mail_from).to_string();
    let domain = sender
        .split_once('@')
        .map_or_else(|| helo.to_string(), |(_, d)| d.to_string());

    if domain.is_empty() {
        return SpfOutcome {
            result: SpfResult::None,
            mail_from: sender,
            domain,
        };
    }

    let mut evaluator = Evaluator {
        lookup,
        client_ip,
        sender: sender.clone(),
        helo: helo.to_string(),
        lookups: 0,
    };

    let result = evaluator.evaluate(domain.clone()).await;
    tracing::debug!(%client_ip, %domain, result = result.as_str(), "spf evaluated");

    SpfOutcome {
        result,
        mail_from: sender,
        domain,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::StubLookup;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn ip4_mechanism_matches_cidr() {
        let lookup = StubLookup::new().txt("example.org", "v=spf1 ip4:192.0.2.0/24 -all");

        let outcome = check(&lookup, ip("192.0.2.77"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);

        let outcome = check(&lookup, ip("198.51.100.1"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn qualifier_mapping() {
        let lookup = StubLookup::new().txt("example.org", "v=spf1 ~all");
        let outcome = check(&lookup, ip("192.0.2.1"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::SoftFail);

        let lookup = StubLookup::new().txt("example.org", "v=spf1 ?all");
        let outcome = check(&lookup, ip("192.0.2.1"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn a_mechanism_resolves_current_domain() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 a -all")
            .a("example.org", "192.0.2.10");

        let outcome = check(&lookup, ip("192.0.2.10"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn mx_mechanism_checks_exchanges() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 mx -all")
            .mx("example.org", 10, "mail.example.org")
            .a("mail.example.org", "192.0.2.25");

        let outcome = check(&lookup, ip("192.0.2.25"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn include_recurses_and_matches_on_pass() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 include:spf.example.net -all")
            .txt("spf.example.net", "v=spf1 ip4:203.0.113.5 -all");

        let outcome = check(&lookup, ip("203.0.113.5"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);

        let outcome = check(&lookup, ip("203.0.113.6"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn redirect_applies_after_no_match() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 redirect=other.example")
            .txt("other.example", "v=spf1 ip4:198.51.100.9 -all");

        let outcome = check(&lookup, ip("198.51.100.9"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn lookup_budget_exhaustion_is_permerror() {
        // A record that includes itself recurses until the budget trips.
        let lookup = StubLookup::new().txt("loop.example", "v=spf1 include:loop.example -all");

        let outcome = check(&lookup, ip("192.0.2.1"), "<a@loop.example>", "mx").await;
        assert_eq!(outcome.result, SpfResult::PermError);
    }

    #[tokio::test]
    async fn multiple_records_is_permerror() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 -all")
            .txt("example.org", "v=spf1 +all");

        let outcome = check(&lookup, ip("192.0.2.1"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::PermError);
    }

    #[tokio::test]
    async fn no_record_is_none_and_null_sender_uses_helo() {
        let lookup = StubLookup::new().txt("helo.example", "v=spf1 ip4:192.0.2.1 -all");

        let outcome = check(&lookup, ip("192.0.2.1"), "<>", "helo.example").await;
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.domain, "helo.example");
        assert!(outcome.mail_from.is_empty());

        let outcome = check(&StubLookup::new(), ip("192.0.2.1"), "<a@quiet.example>", "mx").await;
        assert_eq!(outcome.result, SpfResult::None);
    }

    #[tokio::test]
    async fn exists_mechanism() {
        let lookup = StubLookup::new()
            .txt("example.org", "v=spf1 exists:%{i}.probe.example -all")
            .a("192.0.2.9.probe.example", "127.0.0.2");

        let outcome = check(&lookup, ip("192.0.2.9"), "<a@example.org>", "mx").await;
        assert_eq!(outcome.result, SpfResult::Pass);
    }

    #[test]
    fn macro_expansion() {
        let expanded = expand_macros(
            "%{i}.%{l}.%{o}.%{d}.%{h}%%%_%-",
            &ip("192.0.2.3"),
            "user@example.org",
            "helo.example",
            "spf.example",
        );
        assert_eq!(
            expanded,
            "192.0.2.3.user.example.org.spf.example.helo.example% %20"
        );
    }

    #[test]
    fn unknown_mechanism_is_parse_error() {
        assert!(parse_record("v=spf1 bogus:thing -all").is_err());
    }
}
