//! HTTP basic authentication.

use base64::Engine;

use crate::auth::Auth;
use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};

/// Extract `username:password` from the Authorization header.
pub fn parse_auth(conn: &mut Conn) -> HttpResult<Option<(String, String)>> {
    if conn.rx.auth_type.as_deref() != Some("basic") {
        return Ok(None);
    }
    let Some(details) = conn.rx.auth_details.clone() else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(details.trim())
        .map_err(|_| HttpError::Parse("bad basic authorization encoding".into()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| HttpError::Parse("basic credentials are not utf-8".into()))?;
    match text.split_once(':') {
        Some((user, password)) => Ok(Some((user.to_string(), password.to_string()))),
        None => Err(HttpError::Parse("basic credentials missing separator".into())),
    }
}

/// Challenge with the configured realm.
pub fn ask_login(conn: &mut Conn, auth: &Auth) {
    conn.tx
        .headers
        .set("WWW-Authenticate", format!("Basic realm=\"{}\"", auth.realm));
}

/// Client side: attach credentials to an outbound request.
pub fn set_auth(headers: &mut crate::headers::HeaderMap, username: &str, password: &str) {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    headers.set("Authorization", format!("Basic {encoded}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_auth_encodes_credentials() {
        let mut headers = crate::headers::HeaderMap::new();
        set_auth(&mut headers, "Aladdin", "open sesame");
        assert_eq!(
            headers.get("authorization"),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }
}
