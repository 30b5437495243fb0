//! Attachment policy.
//!
//! Walks every part carrying a filename and returns the first verdict that
//! is not `Allow`. Rejections win over quarantines.

use crate::parser::{Part, PartBody};

const EXECUTABLE_EXTENSIONS: &[&str] = &[".exe", ".js", ".vbs", ".bat", ".cmd", ".scr"];
const LURE_EXTENSIONS: &[&str] = &["pdf", "doc", "jpg"];
const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".rar", ".7z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub reason: String,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: String::new(),
        }
    }
}

fn is_executable(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    EXECUTABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// `invoice.pdf.exe` style names: an inner lure extension directly before
/// the final one.
fn has_double_extension(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    let Some(last_dot) = lower.rfind('.') else {
        return false;
    };
    let Some(prev_dot) = lower[..last_dot].rfind('.') else {
        return false;
    };
    let inner = &lower[prev_dot + 1..last_dot];
    LURE_EXTENSIONS.contains(&inner)
}

fn is_archive(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Archives cannot be opened here; an encrypted marker in the Content-Type
/// is the contract for password protection.
fn is_encrypted(part: &Part) -> bool {
    part.header("content-type")
        .is_some_and(|v| v.to_ascii_lowercase().contains("encrypted"))
}

fn allowed_mime(mime_type: &str) -> bool {
    mime_type.starts_with("image/") || mime_type == "application/pdf" || mime_type == "text/plain"
}

fn evaluate_part(part: &Part, filename: &str) -> PolicyDecision {
    if is_executable(filename) {
        return PolicyDecision {
            verdict: Verdict::Reject,
            reason: "Executable attachment blocked".to_string(),
        };
    }

    if has_double_extension(filename) {
        return PolicyDecision {
            verdict: Verdict::Reject,
            reason: "Double-extension attachment blocked".to_string(),
        };
    }

    if is_archive(filename) && is_encrypted(part) {
        return PolicyDecision {
            verdict: Verdict::Quarantine,
            reason: "Password-protected archive".to_string(),
        };
    }

    if !allowed_mime(&part.content_type()) {
        return PolicyDecision {
            verdict: Verdict::Quarantine,
            reason: "Disallowed MIME type".to_string(),
        };
    }

    PolicyDecision::allow()
}

/// Evaluates every attachment in the message tree.
#[must_use]
pub fn evaluate(message: &Part) -> PolicyDecision {
    let mut decision = PolicyDecision::allow();

    message.walk(&mut |part| {
        if matches!(part.body, PartBody::Multipart { .. }) {
            return;
        }
        let Some(filename) = part.filename() else {
            return;
        };

        let part_decision = evaluate_part(part, &filename);
        let escalates = match (decision.verdict, part_decision.verdict) {
            (_, Verdict::Allow) => false,
            (Verdict::Reject, _) => false,
            (Verdict::Quarantine, Verdict::Reject) | (Verdict::Allow, _) => true,
            (Verdict::Quarantine, Verdict::Quarantine) => false,
        };
        if escalates {
            decision = part_decision;
        }
    });

    if decision.verdict != Verdict::Allow {
        tracing::debug!(verdict = ?decision.verdict, reason = %decision.reason, "attachment policy verdict");
    }
    decision
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::parse;

    fn attachment(filename: &str, content_type: &str) -> Vec<u8> {
        format!(
            "Content-Type: multipart/mixed; boundary=b\r\n\r\n\
--b\r\n\
Content-Type: text/plain\r\n\r\n\
body\r\n\
--b\r\n\
Content-Type: {content_type}\r\n\
Content-Disposition: attachment; filename=\"{filename}\"\r\n\r\n\
data\r\n\
--b--\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn rejects_executables() {
        for name in ["run.exe", "script.JS", "a.vbs", "b.bat", "c.cmd", "d.scr"] {
            let message = parse(&attachment(name, "application/octet-stream")).unwrap();
            let decision = evaluate(&message);
            assert_eq!(decision.verdict, Verdict::Reject, "{name}");
            assert_eq!(decision.reason, "Executable attachment blocked");
        }
    }

    #[test]
    fn rejects_double_extension_lures() {
        let message = parse(&attachment("invoice.pdf.bin", "application/pdf")).unwrap();
        let decision = evaluate(&message);
        assert_eq!(decision.verdict, Verdict::Reject);
        assert_eq!(decision.reason, "Double-extension attachment blocked");
    }

    #[test]
    fn quarantines_encrypted_archives() {
        let message = parse(&attachment(
            "secrets.zip",
            "application/zip; x-encrypted=yes",
        ))
        .unwrap();
        let decision = evaluate(&message);
        assert_eq!(decision.verdict, Verdict::Quarantine);
        assert_eq!(decision.reason, "Password-protected archive");
    }

    #[test]
    fn quarantines_disallowed_mime_types() {
        let message = parse(&attachment("report.bin", "application/octet-stream")).unwrap();
        let decision = evaluate(&message);
        assert_eq!(decision.verdict, Verdict::Quarantine);
        assert_eq!(decision.reason, "Disallowed MIME type");
    }

    #[test]
    fn allows_safe_attachments() {
        for (name, mime) in [
            ("photo.jpg", "image/jpeg"),
            ("doc.pdf", "application/pdf"),
            ("notes.txt", "text/plain"),
        ] {
            let message = parse(&attachment(name, mime)).unwrap();
            assert_eq!(evaluate(&message).verdict, Verdict::Allow, "{name}");
        }
    }

    #[test]
    fn body_without_attachments_is_allowed() {
        let message = parse(b"Content-Type: text/html\r\n\r\n<p>no filename</p>").unwrap();
        assert_eq!(evaluate(&message).verdict, Verdict::Allow);
    }

    #[test]
    fn reject_wins_over_quarantine() {
        let raw = format!(
            "Content-Type: multipart/mixed; boundary=b\r\n\r\n\
--b\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"odd.bin\"\r\n\r\n\
x\r\n\
--b\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"evil.exe\"\r\n\r\n\
y\r\n\
--b--\r\n"
        );
        let message = parse(raw.as_bytes()).unwrap();
        let decision = evaluate(&message);
        assert_eq!(decision.verdict, Verdict::Reject);
    }
}
