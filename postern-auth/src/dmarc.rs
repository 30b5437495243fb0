//! DMARC policy discovery and evaluation (RFC 7489 subset).

use std::collections::HashMap;

use rand::Rng;

use postern_dns::Lookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    None,
    Pass,
    Fail,
}

impl DmarcResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct DmarcOutcome {
    pub result: DmarcResult,
    pub policy: DmarcPolicy,
}

impl DmarcOutcome {
    const fn pass() -> Self {
        Self {
            result: DmarcResult::Pass,
            policy: DmarcPolicy::None,
        }
    }

    const fn reject() -> Self {
        Self {
            result: DmarcResult::Fail,
            policy: DmarcPolicy::Reject,
        }
    }
}

/// The authenticated identifiers feeding alignment.
#[derive(Debug, Clone, Default)]
pub struct DmarcInput {
    pub from_domain: String,
    pub dkim_pass: bool,
    pub dkim_domain: String,
    pub spf_pass: bool,
    pub spf_domain: String,
}

fn parse_tags(record: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in record.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            tags.insert(
                key.trim().to_ascii_lowercase(),
                value.chars().filter(|c| !c.is_whitespace()).collect(),
            );
        }
    }
    tags
}

/// Relaxed alignment: the From domain equals the authenticated domain or is
/// a dot-bounded suffix of it.
fn relaxed_aligned(authenticated: &str, from: &str) -> bool {
    authenticated == from || authenticated.ends_with(&format!(".{from}"))
}

fn strict_aligned(authenticated: &str, from: &str) -> bool {
    authenticated == from
}

fn aligned(mode: &str, authenticated: &str, from: &str) -> bool {
    if authenticated.is_empty() {
        return false;
    }
    if mode == "s" {
        strict_aligned(authenticated, from)
    } else {
        relaxed_aligned(authenticated, from)
    }
}

fn parent_domain(domain: &str) -> Option<&str> {
    domain.split_once('.').map(|(_, parent)| parent)
}

fn policy_from(tag: &str) -> DmarcPolicy {
    match tag {
        "reject" => DmarcPolicy::Reject,
        "quarantine" => DmarcPolicy::Quarantine,
        _ => DmarcPolicy::None,
    }
}

/// Applies one discovered record. `draw` is the 1..=100 sample used for
/// `pct` downsampling; split out so the decision table is testable.
fn apply(record: &str, input: &DmarcInput, on_subdomain: bool, draw: u8) -> DmarcOutcome {
    let tags = parse_tags(record);

    if tags.get("v").map(String::as_str) != Some("DMARC1") {
        return DmarcOutcome::reject();
    }

    let p = tags.get("p").map_or("none", String::as_str);
    let sp = tags.get("sp").map_or(p, String::as_str);
    let adkim = tags.get("adkim").map_or("r", String::as_str);
    let aspf = tags.get("aspf").map_or("r", String::as_str);
    let pct: u8 = tags
        .get("pct")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100)
        .min(100);

    let from = input.from_domain.to_ascii_lowercase();
    let dkim_aligned =
        input.dkim_pass && aligned(adkim, &input.dkim_domain.to_ascii_lowercase(), &from);
    let spf_aligned =
        input.spf_pass && aligned(aspf, &input.spf_domain.to_ascii_lowercase(), &from);

    if dkim_aligned || spf_aligned {
        return DmarcOutcome::pass();
    }

    // Downsampling: a draw above pct treats the failure as a pass.
    if draw > pct {
        return DmarcOutcome::pass();
    }

    DmarcOutcome {
        result: DmarcResult::Fail,
        policy: policy_from(if on_subdomain { sp } else { p }),
    }
}

/// Walks from the From domain toward the root looking for `_dmarc` records,
/// then evaluates the first one found.
pub async fn evaluate(lookup: &dyn Lookup, input: &DmarcInput) -> DmarcOutcome {
    let from = input.from_domain.to_ascii_lowercase();
    if from.is_empty() {
        return DmarcOutcome::pass();
    }

    let mut current = from.clone();
    let records = loop {
        let name = format!("_dmarc.{current}");
        let txts = lookup.txt(&name).await.unwrap_or_default();
        let records: Vec<String> = txts
            .into_iter()
            .filter(|t| t.trim_start().starts_with("v=DMARC1"))
            .collect();

        if !records.is_empty() {
            break records;
        }
        match parent_domain(&current) {
            Some(parent) if !parent.is_empty() => current = parent.to_string(),
            _ => break Vec::new(),
        }
    };

    if records.is_empty() {
        // No published policy: nothing to enforce.
        return DmarcOutcome::pass();
    }
    if records.len() > 1 {
        return DmarcOutcome::reject();
    }

    let draw: u8 = rand::rng().random_range(1..=100);
    let outcome = apply(&records[0], input, current != from, draw);
    tracing::debug!(
        domain = %from,
        discovered_at = %current,
        result = outcome.result.as_str(),
        "dmarc evaluated"
    );
    outcome
}
