//! Per-request transmitter state: status, headers, cookies, and the
//! header block renderer invoked by the connectors.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::headers::HeaderMap;
use crate::http::status_message;
use crate::packet::Packet;
use crate::rx::ResolvedRange;

/// A pending `Set-Cookie`.
///
/// A `lifespan` renders as both `Max-Age` and `Expires` so old and new
/// user agents agree on the expiry. A zero lifespan clears the cookie.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub lifespan: Option<Duration>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(value: impl Into<String>) -> Cookie {
        Cookie {
            value: value.into(),
            ..Default::default()
        }
    }

    /// An already-expired cookie, used to clear one on the client.
    pub fn expired() -> Cookie {
        Cookie {
            value: String::new(),
            lifespan: Some(Duration::ZERO),
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Cookie {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Cookie {
        self.domain = Some(domain.into());
        self
    }

    pub fn lifespan(mut self, lifespan: Duration) -> Cookie {
        self.lifespan = Some(lifespan);
        self
    }

    pub fn http_only(mut self) -> Cookie {
        self.http_only = true;
        self
    }

    pub fn secure(mut self) -> Cookie {
        self.secure = true;
        self
    }

    pub fn same_site(mut self, policy: impl Into<String>) -> Cookie {
        self.same_site = Some(policy.into());
        self
    }
}

/// Transmitter state for one response (server side) or one request
/// (client side).
pub struct Tx {
    pub status: u16,
    pub headers: HeaderMap,
    pub cookies: BTreeMap<String, Cookie>,
    /// Declared body length; -1 means unknown.
    pub length: i64,
    /// Decided at header-render time.
    pub chunked: bool,
    pub etag: Option<String>,
    pub filename: Option<PathBuf>,
    pub file: Option<File>,
    pub file_size: u64,
    pub file_modified: Option<SystemTime>,
    pub mime_type: Option<String>,
    pub output_ranges: Vec<ResolvedRange>,
    /// Full entity length backing a ranged response.
    pub entity_length: u64,
    pub range_boundary: Option<String>,
    /// Name of the handler chosen for this exchange.
    pub handler_name: Option<&'static str>,
    /// Name of the connector at the network end.
    pub connector_name: Option<&'static str>,
    /// User code finished producing output.
    pub finalized: bool,
    /// The end-of-stream packet has been queued.
    pub finalized_output: bool,
    /// Every byte has been written to the socket.
    pub finalized_connector: bool,
    pub headers_created: bool,
    /// Size of the rendered header block, once created.
    pub header_bytes: usize,
    pub bytes_written: u64,
    pub write_blocked: bool,
    /// Handler requests the sendfile connector.
    pub sendfile: bool,
    /// Remaining body-output budget.
    pub remaining_output: u64,
}

impl Default for Tx {
    fn default() -> Self {
        Self::new()
    }
}

impl Tx {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            cookies: BTreeMap::new(),
            length: -1,
            chunked: false,
            etag: None,
            filename: None,
            file: None,
            file_size: 0,
            file_modified: None,
            mime_type: None,
            output_ranges: Vec::new(),
            entity_length: 0,
            range_boundary: None,
            handler_name: None,
            connector_name: None,
            finalized: false,
            finalized_output: false,
            finalized_connector: false,
            headers_created: false,
            header_bytes: 0,
            bytes_written: 0,
            write_blocked: false,
            sendfile: false,
            remaining_output: u64::MAX,
        }
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_content_type(&mut self, mime: impl Into<String>) {
        self.mime_type = Some(mime.into());
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.length = length as i64;
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, cookie: Cookie) {
        self.cookies.insert(name.into(), cookie);
    }

    /// Expire a cookie on the client.
    pub fn clear_cookie(&mut self, name: impl Into<String>) {
        self.cookies.insert(name.into(), Cookie::expired());
    }

    /// Mark the response uncacheable by any intermediary or client.
    pub fn dont_cache(&mut self) {
        self.headers.set("Cache-Control", "no-cache, no-store, must-revalidate");
        self.headers.set("Pragma", "no-cache");
    }

    /// Allow client caching for `max_age`.
    pub fn set_cache_control(&mut self, max_age: Duration) {
        self.headers
            .set("Cache-Control", format!("public, max-age={}", max_age.as_secs()));
        self.headers
            .set("Expires", httpdate::fmt_http_date(SystemTime::now() + max_age));
    }

    /// Body bytes that reached the socket, excluding the header block.
    pub fn body_bytes_written(&self) -> u64 {
        self.bytes_written.saturating_sub(self.header_bytes as u64)
    }

    /// `true` once nothing more may be sent for this request.
    pub fn is_complete(&self) -> bool {
        self.finalized && self.finalized_connector
    }
}

impl Conn {
    /// One-shot response: status, content type, body, finalize.
    pub fn respond(&mut self, status: u16, mime: &str, body: impl Into<Vec<u8>>) -> HttpResult<()> {
        let body = body.into();
        self.tx.status = status;
        self.tx.mime_type = Some(mime.to_string());
        self.tx.length = body.len() as i64;
        self.write(body)?;
        self.finalize_output();
        Ok(())
    }

    /// Set a simple session-scoped cookie on the response.
    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tx.set_cookie(
            name,
            Cookie {
                value: value.into(),
                secure: self.secure,
                ..Default::default()
            },
        );
    }

    pub fn clear_cookie(&mut self, name: impl Into<String>) {
        self.tx.clear_cookie(name);
    }

    /// Queue response body bytes onto the head of the TX pipeline.
    pub fn write(&mut self, data: impl Into<Vec<u8>>) -> HttpResult<()> {
        let data = data.into();
        if data.is_empty() || self.tx.finalized_output {
            return Ok(());
        }
        let len = data.len() as u64;
        let budget = self.tx.remaining_output;
        let take = len.min(budget) as usize;
        self.tx.remaining_output -= take as u64;
        let packet = Packet::data(&data[..take]);
        if let Some(head) = self.pipeline.tx_head {
            self.pipeline.queues[head].enqueue(packet);
            self.schedule_queue(head);
        }
        Ok(())
    }

    /// Queue an arbitrary packet onto the head of the TX pipeline.
    pub fn write_packet(&mut self, packet: Packet) {
        if let Some(head) = self.pipeline.tx_head {
            self.pipeline.queues[head].enqueue(packet);
            self.schedule_queue(head);
        }
    }

    /// Mark user output complete and queue the end-of-stream packet.
    pub fn finalize_output(&mut self) {
        if self.tx.finalized_output {
            return;
        }
        self.tx.finalized = true;
        self.tx.finalized_output = true;
        if let Some(head) = self.pipeline.tx_head {
            self.pipeline.queues[head].enqueue(Packet::end());
            self.schedule_queue(head);
        } else {
            // No pipeline: nothing will ever write, so the connector
            // side is trivially complete.
            self.tx.finalized_connector = true;
        }
    }

    /// Declare user code done; alias kept distinct from finalize_output
    /// because filters (WebSocket close) finalize without an END packet
    /// of their own.
    pub fn finalize(&mut self) {
        self.finalize_output();
    }

    /// Issue a redirect. Relative targets resolve against the request URI.
    pub fn redirect(&mut self, status: u16, target: &str) -> HttpResult<()> {
        let location = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            let target_uri = crate::uri::Uri::parse(target)?;
            self.rx.uri.resolve(&target_uri).format()
        };
        self.tx.status = status;
        self.tx.headers.set("Location", location);
        self.tx.length = 0;
        self.finalize_output();
        Ok(())
    }

    /// Render the response header block into `out`. Called exactly once
    /// by the connector when the header packet reaches the network end.
    pub fn render_headers(&mut self, out: &mut Vec<u8>) {
        let buffered = self.pipeline_payload_bytes();
        let upgraded = self.upgraded;
        let server_side = self.server_side;
        let secure = self.secure;
        let keep_alive_count = self.keep_alive_count;
        let keep_alive_secs = self.limits.inactivity_timeout.as_secs();
        let date = self.http.cached_date();
        let stealth = self.http.stealth();
        let server_name = self.http.server_name().to_string();
        let route = self.rx.route.clone();
        let origin = self.rx.origin.clone();
        let protocol = self.rx.protocol;
        let mut must_close = self.must_close;

        let upstream_drained = self.tx_upstream_drained();
        let tx = &mut self.tx;
        tx.headers_created = true;

        // The chunk filter claims unknown-length HTTP/1.1 responses
        // before packets reach the connector. What remains here is the
        // HTTP/1.0 story: a fully buffered body gets a Content-Length,
        // anything else streams until close.
        if tx.length < 0 && !tx.chunked && !upgraded {
            if tx.finalized_output && upstream_drained {
                tx.length = buffered as i64;
            } else {
                must_close = true;
            }
        }

        let status = tx.status;
        out.extend_from_slice(
            format!("{} {} {}\r\n", protocol.as_str(), status, status_message(status)).as_bytes(),
        );

        tx.headers.set_default("Date", date);
        if !stealth {
            tx.headers.set_default("Server", server_name);
        }
        if let Some(ref mime) = tx.mime_type {
            tx.headers.set_default("Content-Type", mime.clone());
        }
        if let Some(ref etag) = tx.etag {
            tx.headers.set_default("ETag", format!("\"{etag}\""));
        }
        if let Some(modified) = tx.file_modified {
            tx.headers.set_default("Last-Modified", httpdate::fmt_http_date(modified));
        }

        if upgraded {
            // 101 responses carry neither framing header.
        } else if tx.chunked {
            tx.headers.set("Transfer-Encoding", "chunked");
        } else if tx.length >= 0 && status != 304 {
            tx.headers.set("Content-Length", tx.length.to_string());
        }

        if server_side && !upgraded {
            if must_close || keep_alive_count == 0 {
                tx.headers.set("Connection", "close");
            } else {
                tx.headers.set("Connection", "keep-alive");
                tx.headers.set(
                    "Keep-Alive",
                    format!("timeout={keep_alive_secs}, max={keep_alive_count}"),
                );
            }
        }

        if let Some(ref route) = route {
            route.apply_response_headers(&mut tx.headers, origin.as_deref());
            if secure && route.strict_transport_age > 0 {
                tx.headers.set_default(
                    "Strict-Transport-Security",
                    format!("max-age={}", route.strict_transport_age),
                );
            }
        }
        if server_side && status != 101 {
            tx.headers.set_default("X-XSS-Protection", "1; mode=block");
            tx.headers.set_default("X-Frame-Options", "SAMEORIGIN");
            tx.headers.set_default("X-Content-Type-Options", "nosniff");
        }

        let cookies: Vec<String> = tx
            .cookies
            .iter()
            .map(|(name, cookie)| render_cookie(name, cookie, secure))
            .collect();
        for rendered in cookies {
            tx.headers.add("Set-Cookie", rendered);
        }

        for (key, value) in tx.headers.iter() {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        tx.header_bytes = out.len();

        self.must_close = must_close;
    }

    /// Render the request header block (client side).
    pub fn render_request_headers(&mut self, out: &mut Vec<u8>) {
        let tx = &mut self.tx;
        tx.headers_created = true;
        // The client API buffers request bodies, so the length is
        // always known by the time headers render.
        if tx.length > 0 {
            tx.headers.set("Content-Length", tx.length.to_string());
        }
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.rx.method.as_str(), self.rx.uri_text).as_bytes(),
        );
        for (key, value) in tx.headers.iter() {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        tx.header_bytes = out.len();
    }

    /// Total payload bytes currently buffered on the TX side, used to
    /// derive a Content-Length for fully-buffered responses.
    fn pipeline_payload_bytes(&self) -> usize {
        self.tx_buffered_bytes()
    }
}

/// Render one Set-Cookie value. `Domain=` is emitted only when a
/// non-empty hostname that is not an IP literal can be derived.
fn render_cookie(name: &str, cookie: &Cookie, connection_secure: bool) -> String {
    let mut out = format!("{name}={}", cookie.value);
    out.push_str("; Path=");
    out.push_str(cookie.path.as_deref().unwrap_or("/"));
    if let Some(ref domain) = cookie.domain {
        let host = domain.rsplit_once(':').map(|(h, _)| h).unwrap_or(domain);
        let host = host.trim();
        if !host.is_empty() && host.parse::<std::net::IpAddr>().is_err() {
            out.push_str("; Domain=");
            out.push_str(host);
        }
    }
    if let Some(lifespan) = cookie.lifespan {
        out.push_str("; Max-Age=");
        out.push_str(&lifespan.as_secs().to_string());
        let expires = if lifespan.is_zero() {
            SystemTime::UNIX_EPOCH
        } else {
            SystemTime::now() + lifespan
        };
        out.push_str("; Expires=");
        out.push_str(&httpdate::fmt_http_date(expires));
    }
    if let Some(ref same_site) = cookie.same_site {
        out.push_str("; SameSite=");
        out.push_str(same_site);
    }
    if cookie.http_only {
        out.push_str("; HttpOnly");
    }
    if cookie.secure || connection_secure {
        out.push_str("; Secure");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_domain_skips_ip_literals() {
        let cookie = Cookie {
            value: "v".into(),
            domain: Some("192.168.1.1:8080".into()),
            ..Default::default()
        };
        let rendered = render_cookie("id", &cookie, false);
        assert!(!rendered.contains("Domain="));

        let cookie = Cookie {
            value: "v".into(),
            domain: Some("example.com:8080".into()),
            ..Default::default()
        };
        let rendered = render_cookie("id", &cookie, false);
        assert!(rendered.contains("Domain=example.com"));
    }

    #[test]
    fn http_only_and_secure_attributes() {
        let cookie = Cookie {
            value: "v".into(),
            http_only: true,
            ..Default::default()
        };
        let rendered = render_cookie("id", &cookie, true);
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("Secure"));
    }

    #[test]
    fn lifespan_renders_max_age_and_expires() {
        let cookie = Cookie::new("v").lifespan(Duration::from_secs(3600));
        let rendered = render_cookie("id", &cookie, false);
        assert!(rendered.contains("Max-Age=3600"));
        assert!(rendered.contains("Expires="));
    }

    #[test]
    fn expired_cookie_clears_on_the_client() {
        let rendered = render_cookie("id", &Cookie::expired(), false);
        assert!(rendered.starts_with("id="));
        assert!(rendered.contains("Max-Age=0"));
        assert!(rendered.contains("Expires=Thu, 01 Jan 1970"));
    }

    #[test]
    fn builder_style_cookie_attributes() {
        let cookie = Cookie::new("v")
            .path("/app")
            .domain("example.com")
            .http_only()
            .same_site("Lax");
        let rendered = render_cookie("sid", &cookie, false);
        assert!(rendered.contains("Path=/app"));
        assert!(rendered.contains("Domain=example.com"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("HttpOnly"));
    }

    #[test]
    fn dont_cache_sets_no_store_headers() {
        let mut tx = Tx::new();
        tx.dont_cache();
        assert_eq!(
            tx.headers.get("cache-control"),
            Some("no-cache, no-store, must-revalidate")
        );
        assert_eq!(tx.headers.get("pragma"), Some("no-cache"));
    }

    #[test]
    fn body_bytes_exclude_the_header_block() {
        let mut tx = Tx::new();
        tx.header_bytes = 120;
        tx.bytes_written = 150;
        assert_eq!(tx.body_bytes_written(), 30);
        tx.bytes_written = 80;
        assert_eq!(tx.body_bytes_written(), 0);
    }
}
