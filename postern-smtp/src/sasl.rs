//! SASL PLAIN and LOGIN payload handling (RFC 4616 / the de-facto LOGIN
//! exchange).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// `334` prompts for AUTH LOGIN: base64 of `Username:` / `Password:`.
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Decodes a PLAIN initial response: `[authzid] NUL authcid NUL password`.
/// The authzid, when present, is ignored.
#[must_use]
pub fn decode_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload.trim()).ok()?;
    let mut parts = decoded.split(|b| *b == 0);

    let _authzid = parts.next()?;
    let authcid = std::str::from_utf8(parts.next()?).ok()?;
    let password = std::str::from_utf8(parts.next()?).ok()?;

    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }

    Some((authcid.to_string(), password.to_string()))
}

/// One base64 token of an AUTH LOGIN exchange.
#[must_use]
pub fn decode_login_token(payload: &str) -> Option<String> {
    let decoded = BASE64.decode(payload.trim()).ok()?;
    String::from_utf8(decoded).ok()
}
