//! Response caching: per-route profiles, the host cache store, the
//! capture filter and the replay handler.
//!
//! Client mode only decorates responses with `Cache-Control` /
//! `Expires`; server mode captures matching responses into the host
//! cache and replays them (200 or 304) for later requests. Manual mode
//! exposes the store to handler code and suppresses the automatic
//! filter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::packet::PacketTag;
use crate::queue::QueueId;
use crate::stage::{Dir, Stage, StageKind};

/// What a route caches and for how long.
#[derive(Debug, Clone)]
pub struct CacheProfile {
    /// Methods covered; empty means GET/HEAD.
    pub methods: Vec<String>,
    /// URI prefixes covered; empty matches all.
    pub uris: Vec<String>,
    /// Extensions covered; empty matches all.
    pub extensions: Vec<String>,
    /// Response content types covered; empty matches all.
    pub types: Vec<String>,
    /// Server-side entry lifetime.
    pub lifespan: Duration,
    /// When set, emit client caching headers with this max-age.
    pub client_lifespan: Option<Duration>,
    /// Capture and replay on the server side.
    pub server: bool,
    /// Include the query string in the cache key.
    pub unique: bool,
    /// Only the manual lookup/update API, no automatic capture.
    pub manual: bool,
}

impl Default for CacheProfile {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            uris: Vec::new(),
            extensions: Vec::new(),
            types: Vec::new(),
            lifespan: Duration::from_secs(60),
            client_lifespan: None,
            server: true,
            unique: false,
            manual: false,
        }
    }
}

impl CacheProfile {
    /// Whether this profile covers the request (response type checks
    /// happen at capture time).
    pub fn matches_request(&self, conn: &Conn) -> bool {
        let method = conn.rx.method.as_str();
        let method_ok = if self.methods.is_empty() {
            matches!(method, "GET" | "HEAD")
        } else {
            self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
        };
        if !method_ok {
            return false;
        }
        if !self.uris.is_empty() && !self.uris.iter().any(|u| conn.rx.path_info.starts_with(u.as_str())) {
            return false;
        }
        if !self.extensions.is_empty() {
            let ext = conn.rx.uri.ext.clone().unwrap_or_default();
            if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
                return false;
            }
        }
        true
    }

    pub fn matches_response_type(&self, mime: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| mime.starts_with(t.as_str()))
    }
}

/// A captured response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    pub modified: Option<SystemTime>,
    pub body: Vec<u8>,
    pub stored: Instant,
    pub lifespan: Duration,
}

impl CachedResponse {
    pub fn fresh(&self) -> bool {
        self.stored.elapsed() < self.lifespan
    }
}

/// The host-wide response store. Reads clone the entry; writes take
/// the map lock.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if entry.fresh() => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn update(&self, key: impl Into<String>, entry: CachedResponse) {
        self.entries.lock().expect("cache poisoned").insert(key.into(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().expect("cache poisoned").remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The automatic server-side profile covering this request, if any.
pub fn server_profile(conn: &Conn) -> Option<CacheProfile> {
    let route = conn.rx.route.as_ref()?;
    route
        .cache
        .iter()
        .find(|p| p.server && !p.manual && p.matches_request(conn))
        .cloned()
}

/// Any profile (client or server) covering this request.
pub fn any_profile(conn: &Conn) -> Option<CacheProfile> {
    let route = conn.rx.route.as_ref()?;
    route
        .cache
        .iter()
        .find(|p| !p.manual && p.matches_request(conn))
        .cloned()
}

/// `http::response::PREFIX+PATH`, with the query appended for
/// query-sensitive profiles.
pub fn cache_key(conn: &Conn, unique: bool) -> String {
    let prefix = conn
        .rx
        .route
        .as_ref()
        .map(|r| r.prefix.as_str())
        .unwrap_or("");
    let mut key = format!("http::response::{prefix}{}", conn.rx.path_info);
    if unique
        && let Some(ref query) = conn.rx.uri.query
    {
        key.push('?');
        key.push_str(query);
    }
    key
}

// ── replay handler ──

/// Serves a fresh cached entry, honoring conditional requests.
pub struct CacheHandler;

impl Stage for CacheHandler {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        if conn.tx.finalized {
            return Ok(());
        }
        let profile = match server_profile(conn) {
            Some(profile) => profile,
            None => {
                conn.error(404, "cache entry vanished");
                return Ok(());
            }
        };
        let key = cache_key(conn, profile.unique);
        let entry = conn.host.as_ref().and_then(|h| h.cache.lookup(&key));
        let Some(entry) = entry else {
            conn.error(404, "cache entry vanished");
            return Ok(());
        };

        apply_client_headers(conn, &profile);

        let not_modified = conditional_hit(conn, &entry);
        conn.tx.etag = entry.etag.clone();
        conn.tx.file_modified = entry.modified;
        conn.tx.mime_type = entry.mime_type.clone();
        if not_modified {
            conn.tx.status = 304;
            conn.tx.length = 0;
            conn.finalize_output();
            return Ok(());
        }
        conn.tx.status = entry.status;
        conn.tx.length = entry.body.len() as i64;
        conn.write(entry.body)?;
        conn.finalize_output();
        Ok(())
    }
}

fn conditional_hit(conn: &Conn, entry: &CachedResponse) -> bool {
    if let Some(ref if_none) = conn.rx.if_none_match
        && let Some(ref etag) = entry.etag
    {
        return if_none
            .split(',')
            .map(|t| t.trim().trim_matches('"'))
            .any(|t| t == etag || t == "*");
    }
    if let Some(since) = conn.rx.if_modified_since
        && let Some(modified) = entry.modified
    {
        return modified <= since;
    }
    false
}

// ── capture filter ──

struct CaptureState {
    key: String,
    body: Vec<u8>,
    lifespan: Duration,
    /// Response content types the profile covers.
    types: Vec<String>,
    /// Capture disabled: entry already fresh, manual profile, or the
    /// body outgrew the cache item limit.
    aborted: bool,
    capture: bool,
}

pub struct CacheFilter;

impl Stage for CacheFilter {
    fn name(&self) -> &'static str {
        "cache-filter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, dir: Dir) -> bool {
        dir == Dir::Tx && any_profile(conn).is_some()
    }

    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let Some(profile) = any_profile(conn) else {
            return Ok(());
        };
        apply_client_headers(conn, &profile);
        let capture = profile.server && {
            let key = cache_key(conn, profile.unique);
            conn.host
                .as_ref()
                .map(|h| h.cache.lookup(&key).is_none())
                .unwrap_or(false)
        };
        conn.queue_mut(q).state = Some(Box::new(CaptureState {
            key: cache_key(conn, profile.unique),
            body: Vec::new(),
            lifespan: profile.lifespan,
            types: profile.types.clone(),
            aborted: false,
            capture,
        }));
        Ok(())
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let item_limit = conn.limits.cache_item_size;
        while let Some(mut packet) = conn.queue_mut(q).dequeue() {
            if !conn.will_next_accept(q, &mut packet) {
                conn.queue_mut(q).enqueue_front(packet);
                break;
            }
            let is_end = packet.tag == PacketTag::End;
            if packet.tag == PacketTag::Data || is_end {
                capture_bytes(conn, q, &packet.content, item_limit);
            }
            conn.put_next(q, packet)?;
            if is_end {
                store_entry(conn, q);
            }
        }
        conn.resume_upstream_if_drained(q);
        Ok(())
    }
}

fn apply_client_headers(conn: &mut Conn, profile: &CacheProfile) {
    if let Some(max_age) = profile.client_lifespan {
        conn.tx.headers.set(
            "Cache-Control",
            format!("public, max-age={}", max_age.as_secs()),
        );
        conn.tx.headers.set(
            "Expires",
            httpdate::fmt_http_date(SystemTime::now() + max_age),
        );
    }
}

fn capture_bytes(conn: &mut Conn, q: QueueId, bytes: &[u8], limit: usize) {
    let Some(state) = capture_state(conn, q) else { return };
    if !state.capture || state.aborted {
        return;
    }
    if state.body.len() + bytes.len() > limit {
        state.aborted = true;
        state.body.clear();
        return;
    }
    state.body.extend_from_slice(bytes);
}

fn store_entry(conn: &mut Conn, q: QueueId) {
    let status = conn.tx.status;
    let mime = conn.tx.mime_type.clone();
    let etag = conn.tx.etag.clone();
    let modified = conn.tx.file_modified;
    let Some(state) = capture_state(conn, q) else { return };
    if !state.capture || state.aborted || status != 200 {
        return;
    }
    // The response type is only known now; re-check the profile.
    if let Some(ref mime) = mime
        && !state.types.is_empty()
        && !state.types.iter().any(|t| mime.starts_with(t.as_str()))
    {
        state.capture = false;
        return;
    }
    let entry = CachedResponse {
        status,
        mime_type: mime,
        etag,
        modified,
        body: std::mem::take(&mut state.body),
        stored: Instant::now(),
        lifespan: state.lifespan,
    };
    let key = state.key.clone();
    state.capture = false;
    if let Some(ref host) = conn.host {
        host.cache.update(key, entry);
        conn.http.trace().event("cache.store", 3, &[("key", &conn.rx.path_info.clone())]);
    }
}

fn capture_state<'a>(conn: &'a mut Conn, q: QueueId) -> Option<&'a mut CaptureState> {
    conn.queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<CaptureState>())
}
