//! DKIM relaxed canonicalization (RFC 6376 §3.4).

/// Unfolds a raw header block into `(lowercased name, value)` pairs in
/// appearance order. Continuation lines join with a single space.
#[must_use]
pub fn unfold_headers(headers: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in headers.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if (line.starts_with(' ') || line.starts_with('\t'))
            && let Some((_, value)) = fields.last_mut()
        {
            value.push(' ');
            value.push_str(line.trim_start());
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            fields.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    fields
}

fn compress_wsp(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_wsp = false;
    for c in value.chars() {
        if c == ' ' || c == '\t' {
            if !in_wsp {
                out.push(' ');
            }
            in_wsp = true;
        } else {
            out.push(c);
            in_wsp = false;
        }
    }
    out
}

/// Canonicalizes one header field to `name:value` (no trailing CRLF).
#[must_use]
pub fn canonicalize_header(name: &str, value: &str) -> String {
    format!(
        "{}:{}",
        name.to_ascii_lowercase().trim_end(),
        compress_wsp(value.trim())
    )
}

/// Selects and canonicalizes the fields named in `h=`, preserving the `h=`
/// order and searching bottom-up so the last occurrence of a repeated name
/// wins (and each occurrence is used at most once).
#[must_use]
pub fn canonicalize_headers_relaxed(headers: &str, names: &[&str]) -> Vec<String> {
    let fields = unfold_headers(headers);
    let mut consumed = vec![false; fields.len()];
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        let want = name.trim().to_ascii_lowercase();
        let found = fields
            .iter()
            .enumerate()
            .rev()
            .find(|(idx, (field_name, _))| !consumed[*idx] && *field_name == want);

        if let Some((idx, (field_name, value))) = found {
            consumed[idx] = true;
            out.push(canonicalize_header(field_name, value));
        }
    }

    out
}

/// Relaxed body canonicalization: normalize line endings to CRLF, drop
/// trailing empty lines, end with exactly one CRLF.
#[must_use]
pub fn canonicalize_body_relaxed(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 2);
    for c in body.chars() {
        match c {
            '\r' => {}
            '\n' => out.push_str("\r\n"),
            other => out.push(other),
        }
    }

    while out.ends_with("\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_normalizes_line_endings() {
        assert_eq!(canonicalize_body_relaxed("a\nb\n"), "a\r\nb\r\n");
        assert_eq!(canonicalize_body_relaxed("a\r\nb"), "a\r\nb\r\n");
    }

    #[test]
    fn body_trims_trailing_empty_lines() {
        assert_eq!(canonicalize_body_relaxed("body\r\n\r\n\r\n"), "body\r\n");
        assert_eq!(canonicalize_body_relaxed(""), "\r\n");
    }

    #[test]
    fn body_canonicalization_is_idempotent() {
        for input in ["a\nb\n\n\n", "", "x", "x\r\n\r\n"] {
            let once = canonicalize_body_relaxed(input);
            assert_eq!(canonicalize_body_relaxed(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn header_lowercases_and_compresses() {
        assert_eq!(
            canonicalize_header("Subject", "  Hello \t  World  "),
            "subject:Hello World"
        );
    }

    #[test]
    fn unfold_joins_continuations() {
        let fields = unfold_headers("Subject: one\r\n\ttwo\r\nFrom: a@b\r\n");
        assert_eq!(fields[0], ("subject".to_string(), " one two".to_string()));
        assert_eq!(fields[1].0, "from");
    }

    #[test]
    fn selection_is_bottom_up_last_wins() {
        let headers = "Received: first\r\nReceived: second\r\nFrom: a@b\r\n";
        let selected = canonicalize_headers_relaxed(headers, &["received", "received"]);
        assert_eq!(
            selected,
            vec![
                "received:second".to_string(),
                "received:first".to_string()
            ]
        );
    }

    #[test]
    fn missing_header_is_skipped() {
        let selected = canonicalize_headers_relaxed("From: a@b\r\n", &["from", "subject"]);
        assert_eq!(selected, vec!["from:a@b".to_string()]);
    }
}
