//! Cookie-bound sessions and CSRF tokens.
//!
//! Sessions are flat string maps serialized into a shared in-memory
//! cache with lifespan eviction. The id travels in a cookie (default
//! `-http-session-`, per-route override) and is regenerated from the
//! context seqno plus hashed randomness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use rand::RngCore;

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::tx::Cookie;

pub const DEFAULT_SESSION_COOKIE: &str = "-http-session-";
pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";
pub const XSRF_PARAM: &str = "-xsrf-";
const XSRF_KEY: &str = "__xsrf__";

/// Well-known session keys used by the authenticator.
pub const SESSION_USERNAME: &str = "__username__";
pub const SESSION_IP: &str = "__ip__";

/// A live, per-request session handle. Mutations mark it dirty; the
/// connection writes it back to the cache at request completion.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    data: HashMap<String, String>,
    pub dirty: bool,
    pub lifespan: Duration,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.dirty = true;
        }
    }
}

struct StoredSession {
    serialized: String,
    expires: Instant,
}

/// The shared session store. Entries evict on expiry and, when the
/// cache is full, oldest-expiry first.
pub struct SessionCache {
    entries: Mutex<HashMap<String, StoredSession>>,
    max: usize,
    lifespan: Duration,
}

impl SessionCache {
    pub fn new(max: usize, lifespan: Duration) -> SessionCache {
        SessionCache {
            entries: Mutex::new(HashMap::new()),
            max,
            lifespan,
        }
    }

    pub fn load(&self, id: &str) -> Option<HashMap<String, String>> {
        let mut entries = self.entries.lock().expect("sessions poisoned");
        match entries.get(id) {
            Some(entry) if entry.expires > Instant::now() => {
                serde_json::from_str(&entry.serialized).ok()
            }
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Write a session back. Clean sessions still refresh their expiry.
    pub fn save(&self, session: Session) {
        let Ok(serialized) = serde_json::to_string(&session.data) else {
            return;
        };
        let mut entries = self.entries.lock().expect("sessions poisoned");
        if entries.len() >= self.max && !entries.contains_key(&session.id) {
            // Evict the entry closest to expiry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            session.id,
            StoredSession {
                serialized,
                expires: Instant::now() + session.lifespan,
            },
        );
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().expect("sessions poisoned").remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("sessions poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; called from the maintenance timer.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("sessions poisoned")
            .retain(|_, e| e.expires > now);
    }

    pub fn default_lifespan(&self) -> Duration {
        self.lifespan
    }
}

/// `SEQNO + md5(randomness)` rendered in hex.
fn make_session_id(seqno: u64) -> String {
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let digest = Md5::digest(random);
    let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{seqno:08x}{hash}")
}

impl Conn {
    fn session_cookie_name(&self) -> String {
        self.rx
            .route
            .as_ref()
            .map(|r| r.session_cookie.clone())
            .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string())
    }

    /// The session id presented by the request, if any.
    pub fn session_id_from_cookie(&self) -> Option<String> {
        let name = self.session_cookie_name();
        self.rx.cookie_value(&name).map(|v| v.to_string())
    }

    /// Get the request's session, loading it from the cache or, when
    /// `create` is set, minting a fresh one (and its cookie).
    pub fn session(&mut self, create: bool) -> Option<&mut Session> {
        if self.rx.session.is_none() {
            let lifespan = self.http.sessions.default_lifespan();
            let loaded = self
                .session_id_from_cookie()
                .and_then(|id| self.http.sessions.load(&id).map(|data| (id, data)));
            match loaded {
                Some((id, data)) => {
                    self.rx.session = Some(Session {
                        id,
                        data,
                        dirty: false,
                        lifespan,
                    });
                }
                None if create => {
                    let id = make_session_id(self.http.next_seqno());
                    let name = self.session_cookie_name();
                    self.tx.set_cookie(
                        name,
                        Cookie {
                            value: id.clone(),
                            http_only: true,
                            secure: self.secure,
                            ..Default::default()
                        },
                    );
                    self.rx.session = Some(Session {
                        id,
                        data: HashMap::new(),
                        dirty: true,
                        lifespan,
                    });
                }
                None => return None,
            }
        }
        self.rx.session.as_mut()
    }

    /// Drop the session on both sides.
    pub fn destroy_session(&mut self) {
        if let Some(id) = self.session_id_from_cookie() {
            self.http.sessions.remove(&id);
        }
        if let Some(session) = self.rx.session.take() {
            self.http.sessions.remove(&session.id);
        }
    }

    /// Issue (or re-issue) the CSRF token: stored in the session and
    /// exposed as both a cookie and a response header.
    pub fn add_security_token(&mut self) -> HttpResult<String> {
        let token = make_session_id(self.http.next_seqno());
        if let Some(session) = self.session(true) {
            session.set(XSRF_KEY, token.clone());
        }
        self.tx.set_cookie(
            XSRF_COOKIE.to_string(),
            Cookie {
                value: token.clone(),
                secure: self.secure,
                ..Default::default()
            },
        );
        self.tx.headers.set(XSRF_HEADER, token.clone());
        Ok(token)
    }

    /// Compare the session's stored token against the request header
    /// (or form param). A mismatch traces and forces re-issuance.
    pub fn check_security_token(&mut self) -> HttpResult<bool> {
        let expected = self
            .session(false)
            .and_then(|s| s.get(XSRF_KEY).map(|t| t.to_string()));
        let presented = self
            .rx
            .header(XSRF_HEADER)
            .map(|v| v.to_string())
            .or_else(|| self.rx.param(XSRF_PARAM).map(|v| v.to_string()));
        let ok = match (expected, presented) {
            (Some(expected), Some(presented)) => constant_time_eq(&expected, &presented),
            _ => false,
        };
        if !ok {
            self.http.trace().event("request.xsrf.error", 2, &[]);
            self.add_security_token()?;
        }
        Ok(ok)
    }
}

/// Constant-time comparison to keep token checks timing-safe.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        let mut session = Session {
            id: "abc".into(),
            data: HashMap::new(),
            dirty: false,
            lifespan: Duration::from_secs(60),
        };
        session.set("user", "ada");
        cache.save(session);
        let data = cache.load("abc").unwrap();
        assert_eq!(data.get("user").map(|s| s.as_str()), Some("ada"));
    }

    #[test]
    fn cache_evicts_at_capacity() {
        let cache = SessionCache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            cache.save(Session {
                id: format!("s{i}"),
                data: HashMap::new(),
                dirty: true,
                lifespan: Duration::from_secs(60 + i),
            });
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn ids_are_unique_and_hex() {
        let a = make_session_id(1);
        let b = make_session_id(2);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.len(), 8 + 32);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abcd", "abc"));
    }
}
