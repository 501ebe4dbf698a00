//! Authentication: pluggable schemes (basic, digest, form) over
//! pluggable credential stores, with role-to-ability expansion.
//!
//! Add roles before users: a user's ability set is expanded from the
//! roles configured at the time the user is added.

pub mod basic;
pub mod digest;
pub mod form;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::router::Route;
use crate::session::{SESSION_IP, SESSION_USERNAME};
use store::Verifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    Digest,
    Form,
}

/// Where credentials are verified.
#[derive(Clone)]
pub enum AuthStore {
    /// The in-memory user table configured on this `Auth`.
    Config,
    /// An application-supplied verifier (basic and form only; digest
    /// needs the stored credential hash).
    App(Arc<dyn Verifier>),
}

pub struct AuthUser {
    /// `md5(user:realm:password)`, the digest-compatible credential.
    pub digest: String,
    pub roles: HashSet<String>,
    pub abilities: HashSet<String>,
}

/// Authentication configuration shared by routes.
pub struct Auth {
    pub auth_type: Option<AuthType>,
    pub store: AuthStore,
    pub realm: String,
    users: HashMap<String, AuthUser>,
    roles: HashMap<String, HashSet<String>>,
    /// Log this user in without credentials (development setups).
    pub auto_login: Option<String>,
    pub login_page: Option<String>,
    pub logged_in_page: Option<String>,
    /// Skip session creation on login.
    pub no_session: bool,
}

impl Auth {
    pub fn new(realm: impl Into<String>) -> Auth {
        Auth {
            auth_type: None,
            store: AuthStore::Config,
            realm: realm.into(),
            users: HashMap::new(),
            roles: HashMap::new(),
            auto_login: None,
            login_page: None,
            logged_in_page: None,
            no_session: false,
        }
    }

    pub fn set_type(&mut self, auth_type: AuthType) -> &mut Self {
        self.auth_type = Some(auth_type);
        self
    }

    pub fn set_store(&mut self, store: AuthStore) -> &mut Self {
        self.store = store;
        self
    }

    pub fn set_login_pages(
        &mut self,
        login: impl Into<String>,
        logged_in: impl Into<String>,
    ) -> &mut Self {
        self.login_page = Some(login.into());
        self.logged_in_page = Some(logged_in.into());
        self
    }

    /// A role is a named bundle of abilities. Role names are abilities
    /// themselves.
    pub fn add_role(&mut self, name: impl Into<String>, abilities: &[&str]) -> &mut Self {
        self.roles
            .insert(name.into(), abilities.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn add_user(&mut self, name: &str, password: &str, roles: &[&str]) -> &mut Self {
        let digest = credential_digest(name, &self.realm, password);
        let roles: HashSet<String> = roles.iter().map(|r| r.to_string()).collect();
        let abilities = self.expand_abilities(&roles);
        self.users.insert(
            name.to_string(),
            AuthUser { digest, roles, abilities },
        );
        self
    }

    /// Roles expand to their ability sets; the role name itself counts
    /// as an ability too.
    fn expand_abilities(&self, roles: &HashSet<String>) -> HashSet<String> {
        let mut abilities = HashSet::new();
        for role in roles {
            abilities.insert(role.clone());
            if let Some(set) = self.roles.get(role) {
                abilities.extend(set.iter().cloned());
            }
        }
        abilities
    }

    pub fn user(&self, name: &str) -> Option<&AuthUser> {
        self.users.get(name)
    }

    /// Verify a plaintext password against the configured user table.
    pub fn verify_config(&self, username: &str, password: &str) -> bool {
        let Some(user) = self.users.get(username) else {
            return false;
        };
        let presented = credential_digest(username, &self.realm, password);
        constant_time_eq(&presented, &user.digest)
    }
}

/// `md5(user:realm:password)` in lowercase hex.
pub fn credential_digest(user: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{user}:{realm}:{password}"))
}

pub(crate) fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The route's auth gate. True when the request carries an accepted
/// identity (cached in the session, auto-login, or credentials in the
/// request).
pub fn authenticate(conn: &mut Conn, route: &Route) -> HttpResult<bool> {
    let Some(auth) = route.auth.clone() else {
        return Err(HttpError::Internal("auth condition without auth config".into()));
    };

    // Session fast path: identity cached and bound to the peer address.
    let peer = conn.peer_ip.map(|ip| ip.to_string()).unwrap_or_default();
    let cached = conn.session(false).and_then(|session| {
        match (session.get(SESSION_USERNAME), session.get(SESSION_IP)) {
            (Some(user), Some(ip)) => Some((user.to_string(), ip.to_string())),
            _ => None,
        }
    });
    if let Some((user, ip)) = cached {
        if ip == peer {
            conn.username = Some(user);
            return Ok(true);
        }
        // Address changed: drop the stale binding.
        conn.destroy_session();
    }

    if let Some(auto) = auth.auto_login.clone() {
        login(conn, &auth, &auto)?;
        return Ok(true);
    }

    let verified = match auth.auth_type {
        Some(AuthType::Basic) => basic::parse_auth(conn)?.and_then(|(user, password)| {
            verify_password(conn, &auth, &user, &password).then_some(user)
        }),
        Some(AuthType::Digest) => digest::verify(conn, &auth)?,
        Some(AuthType::Form) | None => None,
    };

    match verified {
        Some(user) => {
            login(conn, &auth, &user)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn verify_password(conn: &mut Conn, auth: &Auth, username: &str, password: &str) -> bool {
    match auth.store {
        AuthStore::Config => auth.verify_config(username, password),
        AuthStore::App(ref verifier) => verifier.clone().verify_user(conn, username, password),
    }
}

/// Record a verified identity: create the session (unless suppressed),
/// bind it to the peer address, and tag the connection.
pub fn login(conn: &mut Conn, auth: &Auth, username: &str) -> HttpResult<()> {
    conn.username = Some(username.to_string());
    if !auth.no_session {
        let peer = conn.peer_ip.map(|ip| ip.to_string()).unwrap_or_default();
        if let Some(session) = conn.session(true) {
            session.set(SESSION_USERNAME, username);
            session.set(SESSION_IP, peer);
        }
    }
    conn.http
        .trace()
        .event("auth.login", 3, &[("user", username)]);
    Ok(())
}

/// Clear the identity and its session.
pub fn logout(conn: &mut Conn) {
    conn.username = None;
    conn.destroy_session();
}

/// True iff the user holds every required ability.
pub fn can_user(conn: &Conn, route: &Route, required: &HashSet<String>) -> bool {
    let Some(ref username) = conn.username else {
        return false;
    };
    let Some(ref auth) = route.auth else {
        return false;
    };
    let Some(user) = auth.user(username) else {
        return false;
    };
    required.iter().all(|a| user.abilities.contains(a))
}

/// Issue the scheme's challenge. Basic and digest set a
/// `WWW-Authenticate` header and return None (401 path); form returns
/// a redirect to the login page.
pub fn ask_login(conn: &mut Conn, route: &Route) -> Option<(u16, String)> {
    let auth = route.auth.clone()?;
    match auth.auth_type {
        Some(AuthType::Basic) => {
            basic::ask_login(conn, &auth);
            None
        }
        Some(AuthType::Digest) => {
            digest::ask_login(conn, &auth);
            None
        }
        Some(AuthType::Form) => auth
            .login_page
            .clone()
            .map(|page| (302, page)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_store_verifies_passwords() {
        let mut auth = Auth::new("realm");
        auth.add_user("ada", "s3cret", &[]);
        assert!(auth.verify_config("ada", "s3cret"));
        assert!(!auth.verify_config("ada", "wrong"));
        assert!(!auth.verify_config("ghost", "s3cret"));
    }

    #[test]
    fn roles_expand_to_abilities() {
        let mut auth = Auth::new("realm");
        auth.add_role("editor", &["edit", "view"]);
        auth.add_user("ada", "pw", &["editor"]);
        let user = auth.user("ada").unwrap();
        assert!(user.abilities.contains("edit"));
        assert!(user.abilities.contains("view"));
        // The role name itself is an ability.
        assert!(user.abilities.contains("editor"));
        assert!(!user.abilities.contains("admin"));
    }

    #[test]
    fn credential_digest_matches_rfc_shape() {
        // md5("Mufasa:testrealm@host.com:Circle Of Life") from RFC 2617.
        assert_eq!(
            credential_digest("Mufasa", "testrealm@host.com", "Circle Of Life"),
            "939e7578ed9e3c518a452acee763bce9"
        );
    }
}
