//! MIME decomposition.
//!
//! Splits a raw message on the first blank line, recursively descends into
//! `multipart/*` bodies, and reverses the transfer encoding of leaf parts.
//! Parsing is lenient: malformed encodings degrade to the raw bytes rather
//! than rejecting the message.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("message headers are not valid UTF-8")]
    HeaderEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartBody {
    /// Leaf content with the transfer encoding reversed.
    Text(Vec<u8>),
    Multipart { boundary: String, parts: Vec<Part> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Header fields in order, continuation lines unfolded.
    pub headers: Vec<(String, String)>,
    pub body: PartBody,
}

impl Part {
    /// Case-insensitive header lookup; first occurrence wins.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The media type, lowercased, without parameters. Absent header means
    /// `text/plain`.
    #[must_use]
    pub fn content_type(&self) -> String {
        self.header("content-type")
            .map_or("text/plain", |v| v.split(';').next().unwrap_or(v))
            .trim()
            .to_ascii_lowercase()
    }

    /// A `key=value` parameter from a structured header value, unquoted.
    fn header_param(&self, header: &str, param: &str) -> Option<String> {
        let value = self.header(header)?;
        for piece in value.split(';').skip(1) {
            if let Some((key, raw)) = piece.split_once('=')
                && key.trim().eq_ignore_ascii_case(param)
            {
                return Some(raw.trim().trim_matches('"').to_string());
            }
        }
        None
    }

    /// Attachment filename from `Content-Disposition`.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        self.header_param("content-disposition", "filename")
    }

    /// Depth-first traversal over this part and all nested parts.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Part)) {
        visit(self);
        if let PartBody::Multipart { parts, .. } = &self.body {
            for part in parts {
                part.walk(visit);
            }
        }
    }
}

fn split_headers_body(raw: &str) -> (&str, &str) {
    for marker in ["\r\n\r\n", "\n\n"] {
        if let Some(pos) = raw.find(marker) {
            return (&raw[..pos], &raw[pos + marker.len()..]);
        }
    }
    (raw, "")
}

fn parse_headers(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if (line.starts_with(' ') || line.starts_with('\t'))
            && let Some((_, value)) = headers.last_mut()
        {
            value.push(' ');
            value.push_str(line.trim_start());
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim_start().to_string()));
        }
    }

    headers
}

fn decode_quoted_printable(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'=' {
            // Soft line break.
            if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if bytes.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if let (Some(hi), Some(lo)) = (bytes.get(i + 1), bytes.get(i + 2))
                && let (Some(hi), Some(lo)) =
                    ((*hi as char).to_digit(16), (*lo as char).to_digit(16))
            {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

fn decode_base64(body: &str) -> Vec<u8> {
    let filtered: String = body
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();

    BASE64
        .decode(filtered.as_bytes())
        .unwrap_or_else(|_| body.as_bytes().to_vec())
}

fn decode_transfer(encoding: Option<&str>, body: &str) -> Vec<u8> {
    match encoding.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("quoted-printable") => decode_quoted_printable(body),
        Some("base64") => decode_base64(body),
        // 7bit / 8bit / binary and anything unrecognized: identity.
        _ => body.as_bytes().to_vec(),
    }
}

fn split_multipart(body: &str, boundary: &str) -> Vec<String> {
    let delimiter = format!("--{boundary}");
    let terminator = format!("--{boundary}--");

    let mut parts = Vec::new();
    let mut current: Option<String> = None;

    for line in body.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = line.trim_end();

        if trimmed == terminator {
            if let Some(part) = current.take() {
                parts.push(part);
            }
            break;
        }
        if trimmed == delimiter {
            if let Some(part) = current.take() {
                parts.push(part);
            }
            current = Some(String::new());
            continue;
        }
        if let Some(part) = current.as_mut() {
            part.push_str(line);
            part.push_str("\r\n");
        }
        // Lines before the first delimiter are the preamble; dropped.
    }

    if let Some(part) = current.take() {
        parts.push(part);
    }

    parts
}

fn parse_part(raw: &str) -> Part {
    let (header_block, body) = split_headers_body(raw);
    let headers = parse_headers(header_block);

    let part = Part {
        headers,
        body: PartBody::Text(Vec::new()),
    };

    let body = if part.content_type().starts_with("multipart/") {
        match part.header_param("content-type", "boundary") {
            Some(boundary) if !boundary.is_empty() => {
                let parts = split_multipart(body, &boundary)
                    .iter()
                    .map(|p| parse_part(p))
                    .collect();
                PartBody::Multipart { boundary, parts }
            }
            // A multipart type without a boundary cannot be decomposed.
            _ => PartBody::Text(body.as_bytes().to_vec()),
        }
    } else {
        PartBody::Text(decode_transfer(
            part.header("content-transfer-encoding"),
            body,
        ))
    };

    Part { body, ..part }
}

/// Parses a raw RFC 5322 message into its part tree.
///
/// # Errors
///
/// Fails only when the header section is not valid UTF-8; body bytes are
/// never a reason to reject.
pub fn parse(raw: &[u8]) -> Result<Part, MimeError> {
    let (header_bytes, _) = split_raw_headers(raw);
    if std::str::from_utf8(header_bytes).is_err() {
        return Err(MimeError::HeaderEncoding);
    }

    Ok(parse_part(&String::from_utf8_lossy(raw)))
}

/// Byte-level split on the first blank line, for callers that need the raw
/// header block (DKIM) next to the parsed tree.
#[must_use]
pub fn split_raw_headers(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return (&raw[..pos + 2], &raw[pos + 4..]);
    }
    if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        return (&raw[..pos + 1], &raw[pos + 2..]);
    }
    (raw, b"")
}

/// Re-serializes a part tree. Leaf bodies are written as-is (identity
/// transfer encoding), which keeps `parse ∘ render` the identity for trees
/// built from decoded parts.
#[must_use]
pub fn render(part: &Part) -> Vec<u8> {
    let mut out = Vec::new();

    for (name, value) in &part.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    match &part.body {
        PartBody::Text(bytes) => out.extend_from_slice(bytes),
        PartBody::Multipart { boundary, parts } => {
            for child in parts {
                out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
                out.extend_from_slice(&render(child));
            }
            out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        }
    }

    out
}
