//! Routes: pattern-based request matchers with conditions, updates and
//! targets.
//!
//! A route is built mutable, then finalized (pattern compiled, start
//! segment extracted) when added to a host. After that it is shared
//! immutably behind an `Arc` and never mutated at runtime.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::auth::Auth;
use crate::cache::CacheProfile;
use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::headers::HeaderMap;
use crate::http::Method;
use crate::limits::Limits;
use crate::uri::Uri;

/// How a response header op applies.
#[derive(Debug, Clone)]
pub enum HeaderOp {
    Add(String, String),
    Set(String, String),
    Append(String, String),
    Remove(String),
}

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any.
    pub origins: Vec<String>,
    pub credentials: bool,
    pub headers: Vec<String>,
    pub methods: Vec<String>,
    pub max_age: u64,
}

/// Per-language content mapping: a path suffix inserted before the
/// extension and/or a subdirectory under the documents root.
#[derive(Debug, Clone, Default)]
pub struct Language {
    pub suffix: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Condition {
    AllowDeny { allow: Vec<String>, deny: Vec<String> },
    Auth,
    Directory { negate: bool },
    Exists { negate: bool },
    Match { pattern: Regex, value: String, negate: bool, rewrite: Option<String> },
    Secure { redirect: Option<String> },
    Unauthorized,
}

#[derive(Debug, Clone)]
pub enum Update {
    Param { name: String, template: String },
    Cmd { template: String },
    Lang,
}

#[derive(Debug, Clone)]
pub enum Target {
    /// Expand the template into `rx.target` and run the handler.
    Run { template: String },
    Redirect { status: u16, target: String },
    Write { status: u16, body: String },
    Close,
}

impl Default for Target {
    fn default() -> Self {
        Target::Run { template: String::new() }
    }
}

pub struct Route {
    pub name: String,
    /// User pattern syntax, e.g. `^/user/{id=[0-9]+}`.
    pub pattern: String,
    pub prefix: String,
    /// Literal first path segment of the pattern, used to skip whole
    /// groups of routes on mismatch.
    pub start_segment: String,
    pub regex: Option<Regex>,
    /// Token names declared in the pattern, in capture order.
    pub tokens: Vec<String>,
    /// Uppercased method names; `*` matches all. HEAD matches GET.
    pub methods: HashSet<String>,
    /// Candidate handlers probed with `match` before the fixed handler.
    pub handlers: Vec<String>,
    pub handler: Option<String>,
    pub extension_handlers: HashMap<String, String>,
    pub filters: Vec<String>,
    pub conditions: Vec<Condition>,
    pub updates: Vec<Update>,
    pub target: Target,
    pub documents: PathBuf,
    pub home: PathBuf,
    pub index_files: Vec<String>,
    pub upload_dir: PathBuf,
    pub auto_delete_uploads: bool,
    pub auth: Option<Arc<Auth>>,
    /// Abilities the authenticated user must hold.
    pub required_abilities: HashSet<String>,
    pub header_ops: Vec<HeaderOp>,
    /// Per-route MIME overrides, consulted before the host table.
    pub mime_types: HashMap<String, String>,
    pub error_documents: HashMap<u16, String>,
    /// Extension variants tried in order, e.g. `html` -> `["html.gz", "html"]`
    /// when the client accepts gzip.
    pub extension_map: HashMap<String, Vec<String>>,
    pub languages: HashMap<String, Language>,
    pub cors: Option<CorsConfig>,
    pub cache: Vec<CacheProfile>,
    pub websocket_protocols: Vec<String>,
    /// Deliver each WebSocket frame separately instead of assembling
    /// messages.
    pub preserve_frames: bool,
    pub websocket_ping_period: Option<std::time::Duration>,
    pub session_cookie: String,
    pub show_errors: bool,
    pub xsrf: bool,
    pub strict_transport_age: u64,
    pub redirect_status: u16,
    /// Header name -> pattern that must (or must not) match.
    pub header_checks: Vec<(String, Regex, bool)>,
    pub param_checks: Vec<(String, Regex, bool)>,
    pub limits: Option<Arc<Limits>>,
    finalized: bool,
}

impl Route {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Route {
        Route {
            name: name.into(),
            pattern: pattern.into(),
            prefix: String::new(),
            start_segment: String::new(),
            regex: None,
            tokens: Vec::new(),
            methods: ["*".to_string()].into_iter().collect(),
            handlers: Vec::new(),
            handler: None,
            extension_handlers: HashMap::new(),
            filters: Vec::new(),
            conditions: Vec::new(),
            updates: Vec::new(),
            target: Target::default(),
            documents: PathBuf::from("."),
            home: PathBuf::from("."),
            index_files: vec!["index.html".into()],
            upload_dir: std::env::temp_dir(),
            auto_delete_uploads: false,
            auth: None,
            required_abilities: HashSet::new(),
            header_ops: Vec::new(),
            mime_types: HashMap::new(),
            error_documents: HashMap::new(),
            extension_map: HashMap::new(),
            languages: HashMap::new(),
            cors: None,
            cache: Vec::new(),
            websocket_protocols: Vec::new(),
            preserve_frames: false,
            websocket_ping_period: None,
            session_cookie: crate::session::DEFAULT_SESSION_COOKIE.into(),
            show_errors: false,
            xsrf: false,
            strict_transport_age: 0,
            redirect_status: 302,
            header_checks: Vec::new(),
            param_checks: Vec::new(),
            limits: None,
            finalized: false,
        }
    }

    /// Copy-on-write inheritance: the child starts with the parent's
    /// configuration and overrides what it needs.
    pub fn inherit(name: impl Into<String>, pattern: impl Into<String>, parent: &Route) -> Route {
        let mut route = Route::new(name, pattern);
        route.methods = parent.methods.clone();
        route.handlers = parent.handlers.clone();
        route.handler = parent.handler.clone();
        route.extension_handlers = parent.extension_handlers.clone();
        route.filters = parent.filters.clone();
        route.documents = parent.documents.clone();
        route.home = parent.home.clone();
        route.index_files = parent.index_files.clone();
        route.upload_dir = parent.upload_dir.clone();
        route.auto_delete_uploads = parent.auto_delete_uploads;
        route.auth = parent.auth.clone();
        route.required_abilities = parent.required_abilities.clone();
        route.header_ops = parent.header_ops.clone();
        route.mime_types = parent.mime_types.clone();
        route.error_documents = parent.error_documents.clone();
        route.extension_map = parent.extension_map.clone();
        route.languages = parent.languages.clone();
        route.cors = parent.cors.clone();
        route.websocket_protocols = parent.websocket_protocols.clone();
        route.preserve_frames = parent.preserve_frames;
        route.websocket_ping_period = parent.websocket_ping_period;
        route.session_cookie = parent.session_cookie.clone();
        route.show_errors = parent.show_errors;
        route.xsrf = parent.xsrf;
        route.strict_transport_age = parent.strict_transport_age;
        route.redirect_status = parent.redirect_status;
        route.limits = parent.limits.clone();
        route
    }

    // ── builder setters ──

    pub fn set_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.prefix = prefix.into();
        self
    }

    pub fn set_methods(&mut self, methods: &[&str]) -> &mut Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    pub fn set_handler(&mut self, handler: impl Into<String>) -> &mut Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn add_handler(&mut self, handler: impl Into<String>) -> &mut Self {
        self.handlers.push(handler.into());
        self
    }

    pub fn add_filter(&mut self, filter: impl Into<String>) -> &mut Self {
        self.filters.push(filter.into());
        self
    }

    pub fn set_documents(&mut self, documents: impl Into<PathBuf>) -> &mut Self {
        self.documents = documents.into();
        self
    }

    pub fn set_target(&mut self, target: Target) -> &mut Self {
        self.target = target;
        self
    }

    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    pub fn add_update(&mut self, update: Update) -> &mut Self {
        self.updates.push(update);
        self
    }

    pub fn set_auth(&mut self, auth: Arc<Auth>) -> &mut Self {
        self.auth = Some(auth);
        self.add_condition(Condition::Auth);
        self
    }

    pub fn require_abilities(&mut self, abilities: &[&str]) -> &mut Self {
        self.required_abilities = abilities.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn add_header_op(&mut self, op: HeaderOp) -> &mut Self {
        self.header_ops.push(op);
        self
    }

    pub fn add_cache_profile(&mut self, profile: CacheProfile) -> &mut Self {
        self.cache.push(profile);
        self
    }

    pub fn add_error_document(&mut self, status: u16, uri: impl Into<String>) -> &mut Self {
        self.error_documents.insert(status, uri.into());
        self
    }

    pub fn add_header_check(&mut self, header: &str, pattern: &str, negate: bool) -> HttpResult<&mut Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| HttpError::Internal(format!("bad header pattern: {e}")))?;
        self.header_checks.push((header.to_string(), regex, negate));
        Ok(self)
    }

    pub fn add_param_check(&mut self, param: &str, pattern: &str, negate: bool) -> HttpResult<&mut Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| HttpError::Internal(format!("bad param pattern: {e}")))?;
        self.param_checks.push((param.to_string(), regex, negate));
        Ok(self)
    }

    pub fn set_home(&mut self, home: impl Into<PathBuf>) -> &mut Self {
        self.home = home.into();
        self
    }

    pub fn set_index_files(&mut self, indexes: &[&str]) -> &mut Self {
        self.index_files = indexes.iter().map(|i| i.to_string()).collect();
        self
    }

    pub fn set_upload_dir(&mut self, dir: impl Into<PathBuf>, auto_delete: bool) -> &mut Self {
        self.upload_dir = dir.into();
        self.auto_delete_uploads = auto_delete;
        self
    }

    pub fn set_session_cookie(&mut self, name: impl Into<String>) -> &mut Self {
        self.session_cookie = name.into();
        self
    }

    pub fn set_show_errors(&mut self, show: bool) -> &mut Self {
        self.show_errors = show;
        self
    }

    pub fn set_redirect_status(&mut self, status: u16) -> &mut Self {
        self.redirect_status = status;
        self
    }

    pub fn set_limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = Some(Arc::new(limits));
        self
    }

    /// Map an extension to the handler that should serve it.
    pub fn map_extension_handler(
        &mut self,
        ext: impl Into<String>,
        handler: impl Into<String>,
    ) -> &mut Self {
        self.extension_handlers
            .insert(ext.into().to_ascii_lowercase(), handler.into());
        self
    }

    /// Declare variant extensions tried in preference order for an
    /// extension (compressed and minified forms).
    pub fn map_extension_variants(&mut self, ext: impl Into<String>, variants: &[&str]) -> &mut Self {
        self.extension_map.insert(
            ext.into().to_ascii_lowercase(),
            variants.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    /// Register a language with its optional suffix and content
    /// directory, and enable language negotiation on this route.
    pub fn add_language(
        &mut self,
        tag: impl Into<String>,
        suffix: Option<&str>,
        dir: Option<&str>,
    ) -> &mut Self {
        self.languages.insert(
            tag.into().to_ascii_lowercase(),
            Language {
                suffix: suffix.map(|s| s.to_string()),
                dir: dir.map(|d| d.to_string()),
            },
        );
        if !self.updates.iter().any(|u| matches!(u, Update::Lang)) {
            self.updates.push(Update::Lang);
        }
        self
    }

    pub fn set_cors(&mut self, cors: CorsConfig) -> &mut Self {
        self.cors = Some(cors);
        self
    }

    pub fn set_websocket_protocols(&mut self, protocols: &[&str]) -> &mut Self {
        self.websocket_protocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Compile the pattern and freeze the route. Called by the host.
    pub fn finalize(&mut self) -> HttpResult<()> {
        if self.finalized {
            return Ok(());
        }
        if !self.pattern.is_empty() {
            let (source, tokens) = compile_pattern(&self.pattern)?;
            self.regex = Some(
                Regex::new(&source)
                    .map_err(|e| HttpError::Internal(format!("bad route pattern {}: {e}", self.pattern)))?,
            );
            self.tokens = tokens;
            self.start_segment = start_segment(&self.pattern);
        }
        self.finalized = true;
        Ok(())
    }

    /// Whether `method` is allowed. HEAD rides on GET.
    pub fn allows_method(&self, method: Method) -> bool {
        if self.methods.contains("*") {
            return true;
        }
        if self.methods.contains(method.as_str()) {
            return true;
        }
        method == Method::Head && self.methods.contains("GET")
    }

    /// Map a request path (already prefix-stripped) to a filesystem
    /// path under the documents root, applying the language directory
    /// when one was negotiated.
    pub fn map_file(&self, target: &str, lang: Option<&str>) -> PathBuf {
        let rel = target.trim_start_matches('/');
        if let Some(lang) = lang
            && let Some(language) = self.languages.get(lang)
            && let Some(ref dir) = language.dir
        {
            return self.documents.join(dir).join(rel);
        }
        self.documents.join(rel)
    }

    /// Apply configured response-header operations and CORS grants.
    pub fn apply_response_headers(&self, headers: &mut HeaderMap, origin: Option<&str>) {
        for op in &self.header_ops {
            match op {
                HeaderOp::Add(k, v) => headers.add(k.clone(), v.clone()),
                HeaderOp::Set(k, v) => headers.set(k.clone(), v.clone()),
                HeaderOp::Append(k, v) => headers.append(k.clone(), v.clone()),
                HeaderOp::Remove(k) => headers.remove(k),
            }
        }
        if let Some(ref cors) = self.cors {
            let allowed = match origin {
                Some(origin) => {
                    if cors.origins.iter().any(|o| o == "*") {
                        Some(if cors.credentials { origin.to_string() } else { "*".to_string() })
                    } else {
                        cors.origins.iter().find(|o| *o == origin).cloned()
                    }
                }
                None => None,
            };
            if let Some(allow) = allowed {
                headers.set("Access-Control-Allow-Origin", allow);
                if cors.credentials {
                    headers.set("Access-Control-Allow-Credentials", "true");
                }
                if !cors.headers.is_empty() {
                    headers.set("Access-Control-Allow-Headers", cors.headers.join(", "));
                }
                if !cors.methods.is_empty() {
                    headers.set("Access-Control-Allow-Methods", cors.methods.join(", "));
                }
                if cors.max_age > 0 {
                    headers.set("Access-Control-Max-Age", cors.max_age.to_string());
                }
            }
        }
    }
}

/// Outcome of probing one route against a request.
pub enum RouteProbe {
    /// This route does not match; try the next.
    Miss,
    /// The literal start segment differs; skip the whole group.
    MissGroup,
    /// Matched; tokens captured in declared order.
    Hit(Vec<(String, String)>),
    Reject(u16, String),
    Reroute(String),
    /// Redirect the client (secure condition, form login, route target).
    Redirect(u16, String),
    /// Write a literal response.
    Write(u16, String),
    Close,
}

impl Route {
    /// Probe this route. Mutates the connection only on auth checks
    /// (session lookup) as those must run inside condition order.
    pub fn probe(&self, conn: &mut Conn) -> RouteProbe {
        let path = conn.rx.path_info.clone();
        let Some(stripped) = strip_prefix(&path, &self.prefix) else {
            return RouteProbe::Miss;
        };

        if !self.start_segment.is_empty() {
            let first = stripped.trim_start_matches('/').split('/').next().unwrap_or("");
            if first != self.start_segment {
                return RouteProbe::MissGroup;
            }
        }

        let mut captures: Vec<(String, String)> = Vec::new();
        if let Some(ref regex) = self.regex {
            let Some(found) = regex.captures(stripped) else {
                return RouteProbe::Miss;
            };
            for (idx, token) in self.tokens.iter().enumerate() {
                let value = found
                    .get(idx + 1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                captures.push((token.clone(), value));
            }
        }

        if !self.allows_method(conn.rx.method) {
            return RouteProbe::Miss;
        }

        for (header, pattern, negate) in &self.header_checks {
            let value = conn.rx.header(header).unwrap_or("");
            if pattern.is_match(value) == *negate {
                return RouteProbe::Miss;
            }
        }
        for (param, pattern, negate) in &self.param_checks {
            let value = conn.rx.param(param).unwrap_or("");
            if pattern.is_match(value) == *negate {
                return RouteProbe::Miss;
            }
        }

        match self.run_conditions(conn, stripped) {
            ConditionOutcome::Pass => {}
            ConditionOutcome::Reject(status, msg) => return RouteProbe::Reject(status, msg),
            ConditionOutcome::Reroute(path) => return RouteProbe::Reroute(path),
            ConditionOutcome::Redirect(status, target) => return RouteProbe::Redirect(status, target),
        }

        RouteProbe::Hit(captures)
    }

    fn run_conditions(&self, conn: &mut Conn, stripped: &str) -> ConditionOutcome {
        for condition in &self.conditions {
            match condition {
                Condition::AllowDeny { allow, deny } => {
                    let ip = conn
                        .peer_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_default();
                    let denied = deny.iter().any(|d| ip.starts_with(d.as_str()));
                    let allowed = allow.is_empty() || allow.iter().any(|a| ip.starts_with(a.as_str()));
                    if denied || !allowed {
                        return ConditionOutcome::Reject(403, "access denied".into());
                    }
                }
                Condition::Auth => match crate::auth::authenticate(conn, self) {
                    Ok(true) => {
                        if !self.required_abilities.is_empty()
                            && !crate::auth::can_user(conn, self, &self.required_abilities)
                        {
                            return ConditionOutcome::Reject(403, "insufficient abilities".into());
                        }
                    }
                    Ok(false) => {
                        return match crate::auth::ask_login(conn, self) {
                            Some((status, target)) => ConditionOutcome::Redirect(status, target),
                            None => ConditionOutcome::Reject(401, "authentication required".into()),
                        };
                    }
                    Err(err) => return ConditionOutcome::Reject(err.status(), err.to_string()),
                },
                Condition::Directory { negate } => {
                    let path = self.map_file(stripped, None);
                    let is_dir = path.is_dir();
                    if is_dir == *negate {
                        return ConditionOutcome::Reject(404, "directory condition failed".into());
                    }
                }
                Condition::Exists { negate } => {
                    let path = self.map_file(stripped, None);
                    let exists = path.exists();
                    if exists == *negate {
                        return ConditionOutcome::Reject(404, "resource does not exist".into());
                    }
                }
                Condition::Match { pattern, value, negate, rewrite } => {
                    let expanded = expand_route_template(value, conn, &[]);
                    let matched = pattern.is_match(&expanded);
                    if matched == *negate {
                        return ConditionOutcome::Reject(404, "match condition failed".into());
                    }
                    if let Some(rewrite) = rewrite {
                        let rewritten = pattern
                            .replace(&expanded, rewrite.as_str())
                            .to_string();
                        return ConditionOutcome::Reroute(rewritten);
                    }
                }
                Condition::Secure { redirect } => {
                    if !conn.secure {
                        if let Some(target) = redirect {
                            let target = if target.is_empty() {
                                let host = conn.rx.host_header.clone().unwrap_or_default();
                                format!("https://{host}{}", conn.rx.uri_text)
                            } else {
                                target.clone()
                            };
                            return ConditionOutcome::Redirect(301, target);
                        }
                        return ConditionOutcome::Reject(403, "secure connection required".into());
                    }
                }
                Condition::Unauthorized => {
                    if conn.username.is_some() {
                        return ConditionOutcome::Reject(403, "already authenticated".into());
                    }
                }
            }
        }
        ConditionOutcome::Pass
    }

    /// Apply updates and bind captured tokens after a successful probe.
    pub fn apply_updates(&self, conn: &mut Conn, captures: &[(String, String)]) {
        for (name, value) in captures {
            conn.rx.params.insert(name.clone(), value.clone());
        }
        for update in &self.updates {
            match update {
                Update::Param { name, template } => {
                    let value = expand_route_template(template, conn, captures);
                    conn.rx.params.insert(name.clone(), value);
                }
                Update::Cmd { template } => {
                    let cmd = expand_route_template(template, conn, captures);
                    match std::process::Command::new("sh").arg("-c").arg(&cmd).status() {
                        Ok(status) if !status.success() => {
                            tracing::warn!(cmd, code = status.code(), "route command failed");
                        }
                        Err(err) => tracing::warn!(cmd, error = %err, "route command failed"),
                        _ => {}
                    }
                }
                Update::Lang => {
                    if let Some(lang) = negotiate_language(conn, self) {
                        conn.rx.params.insert("LANG".into(), lang);
                    }
                }
            }
        }
    }
}

enum ConditionOutcome {
    Pass,
    Reject(u16, String),
    Reroute(String),
    Redirect(u16, String),
}

pub(crate) fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let stripped = path.strip_prefix(prefix)?;
    if stripped.is_empty() {
        Some("/")
    } else if stripped.starts_with('/') {
        Some(stripped)
    } else {
        None
    }
}

/// Pick the first Accept-Language tag the route knows.
fn negotiate_language(conn: &Conn, route: &Route) -> Option<String> {
    for tag in conn.rx.accept_languages() {
        if route.languages.contains_key(&tag) {
            return Some(tag);
        }
        if let Some((primary, _)) = tag.split_once('-')
            && route.languages.contains_key(primary)
        {
            return Some(primary.to_string());
        }
    }
    None
}

/// Compile the route pattern syntax into an anchored regex.
///
/// `{name}` captures one path segment, `{name=regex}` captures with an
/// inner expression, `(~ ... ~)` marks an optional non-capturing group.
/// Everything else is escaped literally.
pub fn compile_pattern(pattern: &str) -> HttpResult<(String, Vec<String>)> {
    let mut source = String::from("^");
    let mut tokens = Vec::new();
    let mut rest = pattern;
    if let Some(stripped) = rest.strip_prefix('^') {
        rest = stripped;
    }
    let mut chars = rest.chars().peekable();
    let mut literal = String::new();

    let flush = |literal: &mut String, source: &mut String| {
        if !literal.is_empty() {
            source.push_str(&regex::escape(literal));
            literal.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                flush(&mut literal, &mut source);
                let mut token = String::new();
                for t in chars.by_ref() {
                    if t == '}' {
                        break;
                    }
                    token.push(t);
                }
                if token.is_empty() {
                    return Err(HttpError::Internal(format!("empty token in pattern {pattern}")));
                }
                match token.split_once('=') {
                    Some((name, inner)) => {
                        tokens.push(name.to_string());
                        source.push('(');
                        source.push_str(inner);
                        source.push(')');
                    }
                    None => {
                        tokens.push(token);
                        source.push_str("([^/]*)");
                    }
                }
            }
            '(' if chars.peek() == Some(&'~') => {
                flush(&mut literal, &mut source);
                chars.next();
                source.push_str("(?:");
            }
            '~' if chars.peek() == Some(&')') => {
                flush(&mut literal, &mut source);
                chars.next();
                source.push_str(")?");
            }
            '$' if chars.peek().is_none() => {
                flush(&mut literal, &mut source);
                source.push('$');
            }
            c => literal.push(c),
        }
    }
    flush(&mut literal, &mut source);
    Ok((source, tokens))
}

/// The literal first path segment of a pattern, or empty when the
/// pattern opens with a token or group.
fn start_segment(pattern: &str) -> String {
    let trimmed = pattern.trim_start_matches('^').trim_start_matches('/');
    let mut out = String::new();
    for c in trimmed.chars() {
        match c {
            '/' => break,
            '{' | '(' | '$' | '*' | '[' | '?' | '~' => return String::new(),
            c => out.push(c),
        }
    }
    out
}

/// Expand a route template: `${token}` and `$N` from request params and
/// captures, `$&` for the full path, backquote and `$'` substrings are
/// not carried into targets and render empty.
pub fn expand_route_template(template: &str, conn: &Conn, captures: &[(String, String)]) -> String {
    let path = conn.rx.path_info.clone();
    Uri::expand_template(template, |token| {
        if token == "&" {
            return Some(path.clone());
        }
        if let Ok(index) = token.parse::<usize>()
            && index >= 1
            && let Some((_, value)) = captures.get(index - 1)
        {
            return Some(value.clone());
        }
        if let Some((_, value)) = captures.iter().find(|(name, _)| name == token) {
            return Some(value.clone());
        }
        conn.rx.param(token).map(|v| v.to_string())
    })
}

/// A default catch-all route serving files from `documents`.
pub fn default_route(documents: impl AsRef<Path>) -> Route {
    let mut route = Route::new("default", "");
    route.set_documents(documents.as_ref().to_path_buf());
    route.set_handler("file");
    route
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_tokens_compile_in_order() {
        let (source, tokens) = compile_pattern("^/user/{id}/file/{name=[a-z]+}$").unwrap();
        assert_eq!(tokens, vec!["id".to_string(), "name".to_string()]);
        let regex = Regex::new(&source).unwrap();
        let caps = regex.captures("/user/42/file/report").unwrap();
        assert_eq!(&caps[1], "42");
        assert_eq!(&caps[2], "report");
        assert!(!regex.is_match("/user/42/file/UPPER"));
    }

    #[test]
    fn optional_group_compiles() {
        let (source, _) = compile_pattern("^/doc(~/index.html~)$").unwrap();
        let regex = Regex::new(&source).unwrap();
        assert!(regex.is_match("/doc"));
        assert!(regex.is_match("/doc/index.html"));
        assert!(!regex.is_match("/doc/other"));
    }

    #[test]
    fn literal_segments_are_escaped() {
        let (source, _) = compile_pattern("^/a.b/{x}$").unwrap();
        let regex = Regex::new(&source).unwrap();
        assert!(regex.is_match("/a.b/1"));
        assert!(!regex.is_match("/aXb/1"));
    }

    #[test]
    fn start_segment_extraction() {
        assert_eq!(start_segment("^/api/users/{id}"), "api");
        assert_eq!(start_segment("^/{id}"), "");
        assert_eq!(start_segment("/static/js"), "static");
    }

    #[test]
    fn head_matches_get_routes() {
        let mut route = Route::new("r", "");
        route.set_methods(&["get"]);
        assert!(route.allows_method(Method::Get));
        assert!(route.allows_method(Method::Head));
        assert!(!route.allows_method(Method::Post));
    }
}
