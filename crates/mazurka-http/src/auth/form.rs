//! Form-based login: a POSTed `username`/`password` pair checked by an
//! action, with redirects to the configured pages.

use crate::auth::{Auth, AuthStore};
use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};

/// Action body for the login endpoint. Wire it up with
/// `http.define_action("/auth/login", ...)` on a route using form auth.
pub fn login_action(conn: &mut Conn) -> HttpResult<()> {
    let Some(auth) = conn.rx.route.as_ref().and_then(|r| r.auth.clone()) else {
        return Err(HttpError::Internal("form login without auth config".into()));
    };
    let username = conn.rx.param("username").unwrap_or("").to_string();
    let password = conn.rx.param("password").unwrap_or("").to_string();

    let verified = match auth.store {
        AuthStore::Config => auth.verify_config(&username, &password),
        AuthStore::App(ref verifier) => verifier.clone().verify_user(conn, &username, &password),
    };

    if verified {
        crate::auth::login(conn, &auth, &username)?;
        let target = auth.logged_in_page.clone().unwrap_or_else(|| "/".into());
        conn.redirect(302, &target)?;
    } else {
        conn.http.trace().event("auth.form.fail", 2, &[("user", &username)]);
        let target = login_target(&auth);
        conn.redirect(302, &target)?;
    }
    Ok(())
}

/// Action body for the logout endpoint.
pub fn logout_action(conn: &mut Conn) -> HttpResult<()> {
    let auth = conn.rx.route.as_ref().and_then(|r| r.auth.clone());
    crate::auth::logout(conn);
    let target = auth
        .as_ref()
        .map(|a| login_target(a))
        .unwrap_or_else(|| "/".into());
    conn.redirect(302, &target)?;
    Ok(())
}

fn login_target(auth: &Auth) -> String {
    auth.login_page.clone().unwrap_or_else(|| "/".into())
}
