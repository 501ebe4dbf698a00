//! The shared engine context.
//!
//! One `Http` value per embedding host, threaded through every API as
//! `Arc<Http>`. It owns the stage registry, hosts and endpoints, the
//! trace logger, the monitor subsystem, the session cache and the
//! digest-auth secret. Configuration mutates through coarse locks and
//! is treated as immutable once serving starts.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use rand::RngCore;

use crate::cache::{CacheFilter, CacheHandler};
use crate::connectors::{NetConnector, SendConnector};
use crate::endpoint::Endpoint;
use crate::error::HttpResult;
use crate::filters::chunk::ChunkFilter;
use crate::filters::range::RangeFilter;
use crate::filters::upload::UploadFilter;
use crate::filters::websocket::WebSocketFilter;
use crate::handlers::action::ActionHandler;
use crate::handlers::dir::DirHandler;
use crate::handlers::file::FileHandler;
use crate::handlers::pass::PassHandler;
use crate::host::Host;
use crate::limits::Limits;
use crate::monitor::MonitorSystem;
use crate::session::SessionCache;
use crate::stage::{Stage, StageRegistry};
use crate::trace::Trace;

struct CachedDate {
    rendered: String,
    refreshed: Instant,
}

/// A callback bound to an action-handler target.
pub type ActionFn = Arc<dyn Fn(&mut crate::conn::Conn) -> HttpResult<()> + Send + Sync>;

/// Application notification for request errors: status, message, URI.
pub type ErrorNotifier = Arc<dyn Fn(u16, &str, &str) + Send + Sync>;

pub struct Http {
    limits: RwLock<Arc<Limits>>,
    stages: RwLock<StageRegistry>,
    hosts: RwLock<Vec<Arc<Host>>>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    trace: RwLock<Arc<Trace>>,
    pub monitor: MonitorSystem,
    pub sessions: SessionCache,
    /// Server secret embedded in digest nonces. Rotating it invalidates
    /// outstanding nonces.
    secret: RwLock<String>,
    stealth: AtomicBool,
    date: Mutex<CachedDate>,
    seqno: AtomicU64,
    shutdown: Arc<AtomicBool>,
    active_conns: AtomicUsize,
    actions: RwLock<std::collections::HashMap<String, ActionFn>>,
    error_notifier: RwLock<Option<ErrorNotifier>>,
}

impl Http {
    pub fn new() -> Arc<Http> {
        let limits = Limits::shared();
        let mut secret_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret: String = secret_bytes.iter().map(|b| format!("{b:02x}")).collect();

        let http = Arc::new(Http {
            limits: RwLock::new(limits.clone()),
            stages: RwLock::new(StageRegistry::new()),
            hosts: RwLock::new(Vec::new()),
            endpoints: RwLock::new(Vec::new()),
            trace: RwLock::new(Arc::new(Trace::disabled())),
            monitor: MonitorSystem::new(),
            sessions: SessionCache::new(limits.session_max, limits.session_lifespan),
            secret: RwLock::new(secret),
            stealth: AtomicBool::new(false),
            date: Mutex::new(CachedDate {
                rendered: httpdate::fmt_http_date(SystemTime::now()),
                refreshed: Instant::now(),
            }),
            seqno: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_conns: AtomicUsize::new(0),
            actions: RwLock::new(std::collections::HashMap::new()),
            error_notifier: RwLock::new(None),
        });
        http.register_builtin_stages();
        http
    }

    fn register_builtin_stages(&self) {
        let mut stages = self.stages.write().expect("stage registry poisoned");
        stages.register(Arc::new(NetConnector));
        stages.register(Arc::new(SendConnector));
        stages.register(Arc::new(ChunkFilter));
        stages.register(Arc::new(RangeFilter));
        stages.register(Arc::new(UploadFilter));
        stages.register(Arc::new(WebSocketFilter));
        stages.register(Arc::new(CacheFilter));
        stages.register(Arc::new(CacheHandler));
        stages.register(Arc::new(FileHandler));
        stages.register(Arc::new(DirHandler));
        stages.register(Arc::new(PassHandler));
        stages.register(Arc::new(ActionHandler));
    }

    /// Bind a callback to an action-handler target.
    pub fn define_action(
        &self,
        target: impl Into<String>,
        action: impl Fn(&mut crate::conn::Conn) -> HttpResult<()> + Send + Sync + 'static,
    ) {
        self.actions
            .write()
            .expect("actions poisoned")
            .insert(target.into(), Arc::new(action));
    }

    pub fn action(&self, target: &str) -> Option<ActionFn> {
        self.actions.read().expect("actions poisoned").get(target).cloned()
    }

    /// Observe request errors (one callback; replaces any previous).
    pub fn set_error_notifier(&self, notifier: impl Fn(u16, &str, &str) + Send + Sync + 'static) {
        *self.error_notifier.write().expect("notifier poisoned") = Some(Arc::new(notifier));
    }

    pub(crate) fn notify_error(&self, status: u16, msg: &str, uri: &str) {
        let notifier = self.error_notifier.read().expect("notifier poisoned").clone();
        if let Some(notifier) = notifier {
            notifier(status, msg, uri);
        }
    }

    pub fn register_stage(&self, stage: Arc<dyn Stage>) {
        self.stages.write().expect("stage registry poisoned").register(stage);
    }

    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.read().expect("stage registry poisoned").lookup(name)
    }

    // ── configuration ──

    pub fn limits(&self) -> Arc<Limits> {
        self.limits.read().expect("limits poisoned").clone()
    }

    pub fn set_limits(&self, limits: Limits) {
        *self.limits.write().expect("limits poisoned") = Arc::new(limits);
    }

    pub fn add_host(&self, host: Arc<Host>) {
        self.hosts.write().expect("hosts poisoned").push(host);
    }

    /// The host serving `name`, falling back to the first host.
    pub fn host_for(&self, name: Option<&str>) -> Option<Arc<Host>> {
        let hosts = self.hosts.read().expect("hosts poisoned");
        if let Some(name) = name {
            let bare = name.rsplit_once(':').map(|(h, _)| h).unwrap_or(name);
            if let Some(host) = hosts.iter().find(|h| h.matches(bare)) {
                return Some(host.clone());
            }
        }
        hosts.first().cloned()
    }

    pub fn add_endpoint(&self, endpoint: Arc<Endpoint>) {
        self.endpoints.write().expect("endpoints poisoned").push(endpoint);
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().expect("endpoints poisoned").clone()
    }

    pub fn set_trace(&self, trace: Trace) {
        *self.trace.write().expect("trace poisoned") = Arc::new(trace);
    }

    pub fn trace(&self) -> Arc<Trace> {
        self.trace.read().expect("trace poisoned").clone()
    }

    pub fn set_stealth(&self, on: bool) {
        self.stealth.store(on, Ordering::Relaxed);
    }

    pub fn stealth(&self) -> bool {
        self.stealth.load(Ordering::Relaxed)
    }

    pub fn server_name(&self) -> String {
        format!("Mazurka/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn secret(&self) -> String {
        self.secret.read().expect("secret poisoned").clone()
    }

    pub fn rotate_secret(&self) {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        *self.secret.write().expect("secret poisoned") =
            bytes.iter().map(|b| format!("{b:02x}")).collect();
    }

    // ── runtime ──

    /// The cached `Date:` header value, re-rendered at most once per
    /// second.
    pub fn cached_date(&self) -> String {
        let mut date = self.date.lock().expect("date poisoned");
        if date.refreshed.elapsed().as_secs() >= 1 {
            date.rendered = httpdate::fmt_http_date(SystemTime::now());
            date.refreshed = Instant::now();
        }
        date.rendered.clone()
    }

    pub fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    pub fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// True when no connection is in an active state; gates graceful
    /// shutdown.
    pub fn is_idle(&self) -> bool {
        self.active_conns.load(Ordering::Relaxed) == 0
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop timers and endpoints and drop connection bookkeeping. The
    /// dispatcher threads observe the shutdown flag and drain.
    pub fn destroy(&self) -> HttpResult<()> {
        self.request_shutdown();
        self.monitor.stop();
        self.endpoints.write().expect("endpoints poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_cache_refreshes_at_most_once_per_second() {
        let http = Http::new();
        let first = http.cached_date();
        // Within the same second the rendered value must be reused.
        assert_eq!(first, http.cached_date());
    }

    #[test]
    fn seqno_increments() {
        let http = Http::new();
        let a = http.next_seqno();
        let b = http.next_seqno();
        assert!(b > a);
    }
}
