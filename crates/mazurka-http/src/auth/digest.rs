//! HTTP digest authentication (RFC 2617, MD5 with `qop="auth"`).
//!
//! Nonces embed the server secret captured at issue time; verification
//! compares that captured value against the current secret, so a
//! secret rotation invalidates every outstanding nonce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;

use crate::auth::{Auth, AuthType, constant_time_eq, md5_hex};
use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};

/// Maximum accepted nonce age.
const NONCE_LIFESPAN: Duration = Duration::from_secs(5 * 60);

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// `base64(secret:realm:time-hex:counter-hex)`.
pub fn create_nonce(secret: &str, realm: &str) -> String {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let raw = format!("{secret}:{realm}:{time:x}:{counter:x}");
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Accept a nonce iff it embeds the current secret, names the right
/// realm and has not outlived its lifespan.
fn verify_nonce(nonce: &str, current_secret: &str, realm: &str) -> bool {
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(nonce) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 4 {
        return false;
    }
    let (issued_secret, issued_realm, time_hex) = (parts[0], parts[1], parts[2]);
    if !constant_time_eq(issued_secret, current_secret) || issued_realm != realm {
        return false;
    }
    let Ok(issued) = u64::from_str_radix(time_hex, 16) else {
        return false;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_sub(issued) <= NONCE_LIFESPAN.as_secs()
}

/// Parse the comma-separated `key="value"` fields of a digest header.
pub fn parse_fields(details: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    let mut rest = details;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = &stripped[end + 1..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.trim_start_matches(',').trim_start();
        if !key.is_empty() {
            fields.insert(key.to_ascii_lowercase(), value);
        }
    }
    fields
}

/// Verify a digest Authorization header. Returns the username on
/// success.
pub fn verify(conn: &mut Conn, auth: &Auth) -> HttpResult<Option<String>> {
    debug_assert_eq!(auth.auth_type, Some(AuthType::Digest));
    if conn.rx.auth_type.as_deref() != Some("digest") {
        return Ok(None);
    }
    let Some(details) = conn.rx.auth_details.clone() else {
        return Ok(None);
    };
    let fields = parse_fields(&details);
    let username = fields.get("username").cloned().unwrap_or_default();
    let realm = fields.get("realm").cloned().unwrap_or_default();
    let nonce = fields.get("nonce").cloned().unwrap_or_default();
    let uri = fields.get("uri").cloned().unwrap_or_default();
    let response = fields.get("response").cloned().unwrap_or_default();
    let qop = fields.get("qop").cloned();

    if username.is_empty() || nonce.is_empty() || response.is_empty() {
        return Err(HttpError::Parse("incomplete digest authorization".into()));
    }
    if realm != auth.realm {
        return Ok(None);
    }
    if let Some(ref qop) = qop
        && qop != "auth"
    {
        return Ok(None);
    }
    if !verify_nonce(&nonce, &conn.http.secret(), &auth.realm) {
        return Ok(None);
    }

    let Some(user) = auth.user(&username) else {
        return Ok(None);
    };
    let ha1 = user.digest.clone();
    let ha2 = md5_hex(&format!("{}:{uri}", conn.rx.method.as_str()));
    let expected = match qop {
        Some(_) => {
            let nc = fields.get("nc").cloned().unwrap_or_default();
            let cnonce = fields.get("cnonce").cloned().unwrap_or_default();
            md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
        }
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    };
    if constant_time_eq(&expected, &response) {
        Ok(Some(username))
    } else {
        Ok(None)
    }
}

/// Challenge with a fresh nonce.
pub fn ask_login(conn: &mut Conn, auth: &Auth) {
    let nonce = create_nonce(&conn.http.secret(), &auth.realm);
    let opaque = md5_hex(&auth.realm);
    conn.tx.headers.set(
        "WWW-Authenticate",
        format!(
            "Digest realm=\"{}\", domain=\"/\", qop=\"auth\", nonce=\"{nonce}\", \
             opaque=\"{opaque}\", algorithm=MD5, stale=false",
            auth.realm
        ),
    );
}

/// Client side: compute the Authorization header answering `challenge`.
pub fn client_authorization(
    challenge: &str,
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
) -> String {
    let fields = parse_fields(challenge.trim_start_matches("Digest").trim());
    let realm = fields.get("realm").cloned().unwrap_or_default();
    let nonce = fields.get("nonce").cloned().unwrap_or_default();
    let qop = fields.get("qop").cloned();
    let nc = "00000001";
    let cnonce = "0a4f113b";

    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let response = match qop {
        Some(_) => md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}")),
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    };

    let mut header = format!(
        "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", \
         uri=\"{uri}\", response=\"{response}\""
    );
    if qop.is_some() {
        header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = fields.get("opaque") {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_round_trip_and_rotation() {
        let nonce = create_nonce("secret-a", "realm");
        assert!(verify_nonce(&nonce, "secret-a", "realm"));
        assert!(!verify_nonce(&nonce, "secret-b", "realm"));
        assert!(!verify_nonce(&nonce, "secret-a", "other-realm"));
        assert!(!verify_nonce("not-base64!!!", "secret-a", "realm"));
    }

    #[test]
    fn field_parsing_handles_quotes_and_bare_tokens() {
        let fields = parse_fields(
            "username=\"ada\", realm=\"r\", qop=auth, nc=00000001, uri=\"/x, y\"",
        );
        assert_eq!(fields.get("username").map(|s| s.as_str()), Some("ada"));
        assert_eq!(fields.get("qop").map(|s| s.as_str()), Some("auth"));
        assert_eq!(fields.get("nc").map(|s| s.as_str()), Some("00000001"));
        assert_eq!(fields.get("uri").map(|s| s.as_str()), Some("/x, y"));
    }

    #[test]
    fn rfc2617_example_response() {
        // The worked example from RFC 2617 §3.5.
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let response = md5_hex(&format!(
            "{ha1}:dcd98b7102dd2f0e8b11d0f600bfb0c093:00000001:0a4f113b:auth:{ha2}"
        ));
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }
}
