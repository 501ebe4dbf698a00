//! Virtual hosts: an ordered route table, a MIME table, the response
//! cache and the body streaming policy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::cache::ResponseCache;
use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::limits::MAX_REWRITE;
use crate::router::{Route, RouteProbe, Target, expand_route_template, strip_prefix};
use crate::uri::normalize_path;

pub struct Host {
    /// Host name pattern: exact name, `*.suffix`, or `*` for any.
    name: String,
    routes: RwLock<Vec<Arc<Route>>>,
    mime: RwLock<HashMap<String, String>>,
    pub cache: ResponseCache,
    /// Content-type → stream request bodies through to the handler
    /// instead of buffering. Forms and uploads default to buffered.
    streaming: RwLock<HashMap<String, bool>>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Arc<Host> {
        Arc::new(Host {
            name: name.into(),
            routes: RwLock::new(Vec::new()),
            mime: RwLock::new(HashMap::new()),
            cache: ResponseCache::new(),
            streaming: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Whether this host serves requests for `name`.
    pub fn matches(&self, name: &str) -> bool {
        if self.name == "*" || self.name.eq_ignore_ascii_case(name) {
            return true;
        }
        if let Some(suffix) = self.name.strip_prefix("*")
            && name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase())
        {
            return true;
        }
        false
    }

    /// Finalize and append a route. Routes match in insertion order;
    /// keep the default route last.
    pub fn add_route(&self, mut route: Route) -> HttpResult<Arc<Route>> {
        route.finalize()?;
        let route = Arc::new(route);
        self.routes
            .write()
            .expect("routes poisoned")
            .push(route.clone());
        Ok(route)
    }

    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().expect("routes poisoned").clone()
    }

    pub fn add_mime_type(&self, ext: impl Into<String>, mime: impl Into<String>) {
        self.mime
            .write()
            .expect("mime poisoned")
            .insert(ext.into().to_ascii_lowercase(), mime.into());
    }

    /// MIME type for an extension: route override, host table, then the
    /// shared registry.
    pub fn mime_for(&self, route: Option<&Route>, ext: &str) -> String {
        let ext = ext.to_ascii_lowercase();
        if let Some(route) = route
            && let Some(mime) = route.mime_types.get(&ext)
        {
            return mime.clone();
        }
        if let Some(mime) = self.mime.read().expect("mime poisoned").get(&ext) {
            return mime.clone();
        }
        mime_guess::from_ext(&ext)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    pub fn set_streaming(&self, mime: impl Into<String>, stream: bool) {
        self.streaming
            .write()
            .expect("streaming poisoned")
            .insert(mime.into(), stream);
    }

    /// Whether request bodies of this content type stream through. Form
    /// and multipart bodies buffer unless overridden.
    pub fn streaming(&self, mime: &str) -> bool {
        if let Some(&stream) = self.streaming.read().expect("streaming poisoned").get(mime) {
            return stream;
        }
        !(mime.starts_with("application/x-www-form-urlencoded")
            || mime.starts_with("multipart/form-data"))
    }

    /// Match the request against the route table, applying conditions,
    /// updates and the target. Rewrites restart the scan up to
    /// MAX_REWRITE times. On return the request either has a route and
    /// target bound (run), or the response was already arranged
    /// (redirect / write / close).
    pub fn route_request(self: &Arc<Self>, conn: &mut Conn) -> HttpResult<()> {
        let mut iterations = 0;
        'rewrite: loop {
            iterations += 1;
            if iterations > MAX_REWRITE {
                return Err(HttpError::Internal("too many route rewrites".into()));
            }
            let routes = self.routes();
            let mut skip_segment: Option<String> = None;
            for route in &routes {
                if let Some(ref segment) = skip_segment {
                    if !route.start_segment.is_empty() && route.start_segment == *segment {
                        continue;
                    }
                    skip_segment = None;
                }
                // Conditions (auth, error documents) see the route under
                // test; the binding sticks only when the route matches
                // or rejects.
                conn.rx.route = Some(route.clone());
                match route.probe(conn) {
                    RouteProbe::Miss => {
                        conn.rx.route = None;
                    }
                    RouteProbe::MissGroup => {
                        conn.rx.route = None;
                        skip_segment = Some(route.start_segment.clone());
                    }
                    RouteProbe::Reject(status, msg) => {
                        return Err(HttpError::Protocol(status, msg));
                    }
                    RouteProbe::Reroute(path) => {
                        conn.rx.path_info = normalize_path(&path);
                        conn.rx.route = None;
                        continue 'rewrite;
                    }
                    RouteProbe::Redirect(status, target) => {
                        conn.create_error_pipeline()?;
                        conn.redirect(status, &target)?;
                        return Ok(());
                    }
                    RouteProbe::Write(status, body) => {
                        conn.create_error_pipeline()?;
                        conn.tx.status = status;
                        conn.tx.length = body.len() as i64;
                        conn.tx.mime_type = Some("text/plain".into());
                        conn.write(body.into_bytes())?;
                        conn.finalize_output();
                        return Ok(());
                    }
                    RouteProbe::Close => {
                        conn.abort();
                        return Ok(());
                    }
                    RouteProbe::Hit(captures) => {
                        if let Some(ref limits) = route.limits {
                            conn.limits = limits.clone();
                        }
                        route.apply_updates(conn, &captures);
                        return self.execute_target(conn, route, &captures);
                    }
                }
            }
            return Err(HttpError::NotFound(format!(
                "no route for {}",
                conn.rx.path_info
            )));
        }
    }

    fn execute_target(
        self: &Arc<Self>,
        conn: &mut Conn,
        route: &Arc<Route>,
        captures: &[(String, String)],
    ) -> HttpResult<()> {
        let stripped = strip_prefix(&conn.rx.path_info.clone(), &route.prefix)
            .unwrap_or("/")
            .to_string();
        match route.target.clone() {
            Target::Run { template } => {
                conn.rx.target = if template.is_empty() {
                    stripped
                } else {
                    expand_route_template(&template, conn, captures)
                };
            }
            Target::Redirect { status, target } => {
                let status = if status == 0 { route.redirect_status } else { status };
                let target = expand_route_template(&target, conn, captures);
                conn.create_error_pipeline()?;
                conn.redirect(status, &target)?;
            }
            Target::Write { status, body } => {
                let body = expand_route_template(&body, conn, captures);
                conn.create_error_pipeline()?;
                conn.tx.status = status;
                conn.tx.length = body.len() as i64;
                conn.tx.mime_type = Some("text/plain".into());
                conn.write(body.into_bytes())?;
                conn.finalize_output();
            }
            Target::Close => conn.abort(),
        }
        Ok(())
    }
}

/// MIME type for a filesystem path, independent of host configuration.
pub fn mime_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}
