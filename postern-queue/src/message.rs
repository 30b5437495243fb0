use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const RAW_MARKER: &[u8] = b"---RAW---\n";

/// A mail unit in transit. Which directory its file sits in *is* its state;
/// this struct only exists while a worker holds the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub raw: Vec<u8>,
    /// Temp-failures so far; drives the backoff table.
    pub retry_count: u32,
}

/// Monotone-ish time prefix plus 64 random bits; unique across directories.
#[must_use]
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let noise: u64 = rand::rng().random();
    format!("{nanos}-{noise:016x}")
}

/// ```text
/// FROM: <envelope-from>\n
/// TO: <envelope-to>\n
/// ---RAW---\n
/// <raw RFC5322 bytes>
/// ```
#[must_use]
pub fn serialize(from: &str, recipients: &[String], raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 128);
    out.extend_from_slice(format!("FROM: {from}\n").as_bytes());
    out.extend_from_slice(format!("TO: {}\n", recipients.join(", ")).as_bytes());
    out.extend_from_slice(RAW_MARKER);
    out.extend_from_slice(raw);
    out
}

/// Parses the prefix back out of a queue file. `None` when the framing is
/// missing or mangled.
#[must_use]
pub fn parse(content: &[u8]) -> Option<(String, Vec<String>, Vec<u8>)> {
    let marker = content
        .windows(RAW_MARKER.len())
        .position(|w| w == RAW_MARKER)?;
    let prefix = std::str::from_utf8(&content[..marker]).ok()?;
    let raw = content[marker + RAW_MARKER.len()..].to_vec();

    let mut from = None;
    let mut to = None;
    for line in prefix.lines() {
        if let Some(value) = line.strip_prefix("FROM:") {
            from = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("TO:") {
            to = Some(value.trim().to_string());
        }
    }

    let recipients = to?
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    Some((from?, recipients, raw))
}
