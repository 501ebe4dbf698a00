//! The per-socket connection and its protocol state machine.
//!
//! `Conn::protocol` is the non-blocking driver: it repeatedly invokes
//! the processor for the current state until no state advances and no
//! queue has work, then returns to the dispatcher to wait for I/O.
//! Exactly one caller drives a connection at any moment.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::context::Http;
use crate::error::{HttpError, HttpResult};
use crate::host::Host;
use crate::http::{Method, Protocol, status_message};
use crate::limits::Limits;
use crate::monitor::Counter;
use crate::packet::Packet;
use crate::queue::Pipeline;
use crate::rx::{Rx, find_header_end};
use crate::socket::Socket;
use crate::tx::Tx;

/// Connection protocol states, strictly ordered within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum ConnState {
    Begin = 0,
    Connected = 1,
    /// The request (or response) line has parsed.
    First = 2,
    /// All headers have parsed.
    Parsed = 3,
    /// Body bytes are flowing.
    Content = 4,
    /// Body fully received.
    Ready = 5,
    /// Handler producing output.
    Running = 6,
    /// Output finalized and fully written.
    Finalized = 7,
    /// Terminal for the request; the connection may rearm.
    Complete = 8,
}

pub struct Conn {
    pub http: Arc<Http>,
    pub socket: Box<dyn Socket>,
    pub state: ConnState,
    pub server_side: bool,
    pub rx: Rx,
    pub tx: Tx,
    pub pipeline: Pipeline,
    /// Unparsed inbound bytes.
    pub input: Vec<u8>,
    pub limits: Arc<Limits>,
    pub host: Option<Arc<Host>>,
    pub endpoint: Option<Arc<crate::endpoint::Endpoint>>,
    pub keep_alive_count: u32,
    pub must_close: bool,
    pub seqno: u64,
    pub started: Instant,
    pub request_started: Instant,
    pub last_activity: Instant,
    pub secure: bool,
    pub upgraded: bool,
    /// Error message for the current request, if any.
    pub error: Option<String>,
    /// The socket failed; nothing further can be sent.
    pub conn_error: bool,
    pub eof_seen: bool,
    /// Dispatcher hint: register interest in writability.
    pub wants_writable: bool,
    pub username: Option<String>,
    pub peer_ip: Option<IpAddr>,
    pub closed: bool,
    /// Last keep-alive ping sent on an upgraded connection.
    pub last_ping: Option<Instant>,
    errored: bool,
}

impl Conn {
    /// Server-side connection for an accepted socket.
    pub fn accept(http: Arc<Http>, socket: Box<dyn Socket>) -> Conn {
        let limits = http.limits();
        let secure = socket.is_secure();
        let peer_ip = socket.peer_addr().map(|a| a.ip());
        let seqno = http.next_seqno();
        http.conn_opened();
        if let Some(ip) = peer_ip {
            http.monitor.inc(Some(ip), Counter::ActiveConnections, 1);
            http.monitor.touch_client(ip);
        }
        let now = Instant::now();
        Conn {
            keep_alive_count: limits.keep_alive_max,
            http,
            socket,
            state: ConnState::Begin,
            server_side: true,
            rx: Rx::new(),
            tx: Tx::new(),
            pipeline: Pipeline::default(),
            input: Vec::new(),
            limits,
            host: None,
            endpoint: None,
            must_close: false,
            seqno,
            started: now,
            request_started: now,
            last_activity: now,
            secure,
            upgraded: false,
            error: None,
            conn_error: false,
            eof_seen: false,
            wants_writable: false,
            username: None,
            peer_ip,
            closed: false,
            last_ping: None,
            errored: false,
        }
    }

    /// Client-side connection around an established socket.
    pub fn connect(http: Arc<Http>, socket: Box<dyn Socket>) -> Conn {
        let mut conn = Conn::accept(http, socket);
        conn.server_side = false;
        conn
    }

    // ── event entry points ──

    /// Dispatcher entry: the socket reported readiness.
    pub fn io_event(&mut self, readable: bool, writable: bool) {
        self.last_activity = Instant::now();
        if writable {
            self.tx.write_blocked = false;
            if let Some(tail) = self.pipeline.tx_tail {
                self.schedule_queue(tail);
            }
        }
        if readable {
            self.fill_input();
        }
        self.protocol();
    }

    /// Drain the socket into the input buffer until it would block.
    fn fill_input(&mut self) {
        let mut buf = [0u8; 8192];
        loop {
            match self.socket.read(&mut buf) {
                Ok(Some(0)) => {
                    self.eof_seen = true;
                    break;
                }
                Ok(Some(n)) => {
                    self.input.extend_from_slice(&buf[..n]);
                    self.http.monitor.inc(self.peer_ip, Counter::NetworkIo, n as i64);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(seqno = self.seqno, error = %err, "socket read failed");
                    self.conn_error = true;
                    self.eof_seen = true;
                    break;
                }
            }
        }
    }

    /// The non-blocking protocol driver.
    pub fn protocol(&mut self) {
        loop {
            if self.closed {
                break;
            }
            let before = self.state;
            let advanced = match self.state {
                ConnState::Begin | ConnState::Connected | ConnState::First => self.parse_incoming(),
                ConnState::Parsed => self.process_parsed(),
                ConnState::Content => self.process_content(),
                ConnState::Ready => self.process_ready(),
                ConnState::Running => self.process_running(),
                ConnState::Finalized => Ok(self.process_finalized()),
                ConnState::Complete => Ok(self.process_completion()),
            };
            let advanced = match advanced {
                Ok(advanced) => advanced,
                Err(err) => {
                    self.handle_error(err);
                    true
                }
            };
            let serviced = match self.service_queues() {
                Ok(serviced) => serviced,
                Err(err) => {
                    self.handle_error(err);
                    true
                }
            };
            // Running may finish only after the connector drained.
            if self.state == ConnState::Running
                && self.tx.finalized_output
                && self.tx.finalized_connector
            {
                continue;
            }
            if !advanced && !serviced && self.state == before {
                break;
            }
        }
    }

    // ── state processors ──

    /// Wait for the blank line, then parse the whole header block.
    fn parse_incoming(&mut self) -> HttpResult<bool> {
        if self.state == ConnState::Begin {
            self.state = ConnState::Connected;
        }
        if self.input.is_empty() && !self.eof_seen {
            return Ok(false);
        }
        let Some(end) = find_header_end(&self.input) else {
            if self.input.len() > self.limits.header_size {
                return Err(HttpError::Protocol(413, "header block exceeds limit".into()));
            }
            if self.eof_seen {
                if self.input.is_empty() || self.conn_error {
                    // Clean close between requests.
                    self.close();
                } else {
                    return Err(HttpError::Parse("connection closed mid-header".into()));
                }
            }
            return Ok(false);
        };
        if end > self.limits.header_size {
            return Err(HttpError::Protocol(413, "header block exceeds limit".into()));
        }

        let block: Vec<u8> = self.input.drain(..end).collect();
        let limits = self.limits.clone();
        self.rx.parse_headers(&block, self.server_side, &limits)?;
        self.state = ConnState::First;
        self.request_started = Instant::now();
        if self.server_side {
            self.http.monitor.inc(self.peer_ip, Counter::Requests, 1);
            self.http.monitor.inc(self.peer_ip, Counter::ActiveRequests, 1);
            self.http.trace().event(
                "request.start",
                2,
                &[
                    ("method", self.rx.method.as_str()),
                    ("uri", &self.rx.uri_text.clone()),
                    ("seqno", &self.seqno.to_string()),
                ],
            );
        }
        if self.rx.must_close {
            self.must_close = true;
        }
        if let Some(max) = self.rx.keep_alive_max {
            let cap = if self.server_side { max } else { max.saturating_sub(1) };
            self.keep_alive_count = self.keep_alive_count.min(cap);
        }
        self.state = ConnState::Parsed;
        Ok(true)
    }

    /// Route the request and assemble the pipeline (server), or build
    /// the response pipeline (client).
    fn process_parsed(&mut self) -> HttpResult<bool> {
        if self.server_side {
            // The endpoint's host list wins over the context-wide one.
            let name = self.rx.host_header.as_deref();
            let host = self
                .endpoint
                .as_ref()
                .and_then(|e| e.host_for(name))
                .or_else(|| self.http.host_for(name))
                .ok_or_else(|| HttpError::Internal("no host configured".into()))?;
            self.host = Some(host.clone());
            host.route_request(self)?;
            if self.closed {
                return Ok(true);
            }
            if !self.pipeline.created {
                self.create_pipeline()?;
            }
            if self.rx.needs_continue {
                let interim = format!("HTTP/1.1 100 {}\r\n\r\n", status_message(100));
                let _ = self.socket.write(interim.as_bytes());
            }
        } else if !self.pipeline.created {
            self.create_client_pipeline()?;
        }
        if self.upgraded {
            self.state = ConnState::Ready;
        } else {
            self.state = ConnState::Content;
        }
        Ok(true)
    }

    /// Move body bytes from the connection input through the RX chain.
    fn process_content(&mut self) -> HttpResult<bool> {
        if self.rx.eof {
            self.state = ConnState::Ready;
            return Ok(true);
        }
        let mut decoded = Vec::new();
        let input = std::mem::take(&mut self.input);
        let outcome = self.rx.decode_content(&input, &mut decoded);
        self.input = input;
        let consumed = outcome?;
        if consumed > 0 {
            self.input.drain(..consumed);
        }

        if self.rx.bytes_read > self.limits.receive_body_size {
            return Err(HttpError::Protocol(413, "request body exceeds limit".into()));
        }
        if self.rx.form && self.rx.bytes_read > self.limits.receive_form_size {
            return Err(HttpError::Protocol(413, "form body exceeds limit".into()));
        }

        let mut progress = consumed > 0;
        if !decoded.is_empty() {
            let packet = Packet::data(decoded);
            self.put_rx(packet)?;
            progress = true;
        }

        let socket_eof = self.eof_seen
            && self.input.is_empty()
            && self.rx.length < 0
            && self.rx.chunk == crate::rx::ChunkState::Unchunked;
        if self.rx.content_complete() || socket_eof {
            if socket_eof {
                self.rx.remaining_content = 0;
            }
            let mut end = Packet::end();
            end.last = true;
            self.put_rx(end)?;
            self.rx.eof = true;
            self.state = ConnState::Ready;
            return Ok(true);
        }
        if self.eof_seen && self.input.is_empty() && !self.rx.content_complete() {
            return Err(HttpError::Comms("connection closed mid-body".into()));
        }
        Ok(progress)
    }

    fn put_rx(&mut self, packet: Packet) -> HttpResult<()> {
        let Some(head) = self.pipeline.rx_head else {
            return Ok(());
        };
        let stage = self.pipeline.queues[head].stage.clone();
        stage.incoming(self, head, packet)
    }

    /// Invoke the handler's ready callback.
    fn process_ready(&mut self) -> HttpResult<bool> {
        if self.rx.form && !self.upgraded {
            let body = self.read_body_bytes();
            let text = String::from_utf8_lossy(&body);
            for (k, v) in crate::uri::parse_query(&text) {
                self.rx.params.insert(k, v);
            }
        }
        if let Some(head) = self.pipeline.tx_head {
            let stage = self.pipeline.queues[head].stage.clone();
            stage.ready(self)?;
        }
        self.state = ConnState::Running;
        Ok(true)
    }

    /// Drive the handler while output is unfinalized; detect completion.
    fn process_running(&mut self) -> HttpResult<bool> {
        if self.upgraded && !self.input.is_empty() {
            let input = std::mem::take(&mut self.input);
            let packet = Packet::data(input);
            self.put_rx(packet)?;
            return Ok(true);
        }
        if self.upgraded && self.eof_seen && !self.tx.finalized {
            // Peer vanished without a close frame.
            self.finalize_output();
            return Ok(true);
        }
        if self.tx.finalized_output && self.tx.finalized_connector {
            self.state = ConnState::Finalized;
            return Ok(true);
        }
        if self.tx.write_blocked {
            self.wants_writable = true;
            return Ok(false);
        }
        if !self.tx.finalized {
            let before = (self.tx_buffered_bytes(), self.tx.bytes_written, self.tx.finalized);
            if let Some(head) = self.pipeline.tx_head {
                let stage = self.pipeline.queues[head].stage.clone();
                stage.writable(self)?;
            }
            let after = (self.tx_buffered_bytes(), self.tx.bytes_written, self.tx.finalized);
            return Ok(before != after);
        }
        Ok(false)
    }

    /// Close the pipeline, emit the completion trace, update counters.
    fn process_finalized(&mut self) -> bool {
        let elapsed = self.request_started.elapsed().as_millis().to_string();
        let status = self.tx.status.to_string();
        let sent = self.tx.body_bytes_written().to_string();
        let received = self.rx.bytes_read.to_string();
        let ip = self
            .peer_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".into());
        let user = self.username.clone().unwrap_or_else(|| "-".into());
        self.http.trace().event(
            "rx.complete",
            2,
            &[
                ("ip", &ip),
                ("user", &user),
                ("method", self.rx.method.as_str()),
                ("uri", &self.rx.uri_text.clone()),
                ("status", &status),
                ("received", &received),
                ("sent", &sent),
                ("elapsed", &elapsed),
            ],
        );
        self.http.monitor.inc(self.peer_ip, Counter::ActiveRequests, -1);
        self.http
            .monitor
            .inc(self.peer_ip, Counter::NetworkIo, self.tx.bytes_written as i64);

        if let Some(session) = self.rx.session.take() {
            self.http.sessions.save(session);
        }
        self.close_pipeline();
        self.cleanup_uploads();
        self.state = ConnState::Complete;
        true
    }

    /// Rearm for the next keep-alive request or tear down.
    fn process_completion(&mut self) -> bool {
        let rearm = self.server_side
            && !self.must_close
            && !self.conn_error
            && self.error.is_none()
            && !self.upgraded
            && !self.eof_seen_without_input()
            && self.keep_alive_count > 0
            && !self.http.is_shutting_down();
        if !rearm {
            self.close();
            return false;
        }
        self.keep_alive_count -= 1;
        self.rx = Rx::new();
        self.tx = Tx::new();
        self.pipeline.clear();
        self.upgraded = false;
        self.errored = false;
        self.error = None;
        self.username = None;
        self.state = ConnState::Begin;
        self.request_started = Instant::now();
        true
    }

    fn eof_seen_without_input(&self) -> bool {
        self.eof_seen && self.input.is_empty()
    }

    fn close_pipeline(&mut self) {
        for q in 0..self.pipeline.queues.len() {
            let stage = self.pipeline.queues[q].stage.clone();
            stage.close(self, q);
        }
    }

    fn cleanup_uploads(&mut self) {
        let auto_delete = self
            .rx
            .route
            .as_ref()
            .map(|r| r.auto_delete_uploads)
            .unwrap_or(false);
        if auto_delete {
            for file in self.rx.files.drain(..) {
                let _ = std::fs::remove_file(&file.filename);
            }
        }
    }

    /// Drain the handler-side RX queue into a contiguous body.
    pub fn read_body_bytes(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(tail) = self.pipeline.rx_tail {
            while let Some(packet) = self.pipeline.queues[tail].dequeue() {
                out.extend_from_slice(&packet.content);
            }
        }
        out
    }

    // ── errors ──

    /// Terminate the current request with a status. If headers are
    /// unsent the output is discarded and an error body substituted;
    /// otherwise the socket is simply aborted.
    pub fn error(&mut self, status: u16, msg: impl Into<String>) {
        self.handle_error(HttpError::Protocol(status, msg.into()));
    }

    pub(crate) fn handle_error(&mut self, err: HttpError) {
        let status = err.status();
        let msg = err.to_string();
        tracing::debug!(seqno = self.seqno, status, error = %msg, "request error");
        match status {
            400 => self.http.monitor.inc(self.peer_ip, Counter::BadRequestErrors, 1),
            404 => self.http.monitor.inc(self.peer_ip, Counter::NotFoundErrors, 1),
            413 | 414 | 431 | 503 => self.http.monitor.inc(self.peer_ip, Counter::LimitErrors, 1),
            _ => {}
        }
        self.http.monitor.inc(self.peer_ip, Counter::Errors, 1);
        self.http.trace().event(
            "request.error",
            1,
            &[("status", &status.to_string()), ("msg", &msg)],
        );
        self.http.notify_error(status, &msg, &self.rx.uri_text);

        if self.errored || self.conn_error || err.is_abort() || self.tx.headers_created {
            // Headers already on the wire (or the socket is dead): the
            // peer observes truncation.
            self.abort();
            return;
        }
        self.errored = true;
        self.error = Some(msg.clone());
        self.must_close = true;
        self.tx.status = status;
        // Error pages are never worth caching anywhere.
        self.tx.dont_cache();

        if !self.pipeline.created
            && let Err(pipeline_err) = self.create_error_pipeline()
        {
            tracing::debug!(seqno = self.seqno, error = %pipeline_err, "error pipeline failed");
            self.abort();
            return;
        }
        self.discard_tx_data();
        self.tx.length = -1;
        self.tx.chunked = false;
        self.tx.output_ranges.clear();
        // The substituted body needs a fresh end-of-stream marker even
        // when the handler had already finalized.
        self.tx.finalized = false;
        self.tx.finalized_output = false;

        let body = self.error_body(status, &msg);
        self.tx.mime_type = Some(body.1);
        self.tx.length = body.0.len() as i64;
        self.rx.eof = true;
        if self.write(body.0).is_err() {
            self.abort();
            return;
        }
        self.finalize_output();
        if self.state < ConnState::Running {
            self.state = ConnState::Running;
        }
    }

    /// Build the error document body: the route's configured document
    /// when available, else a small generated page.
    fn error_body(&mut self, status: u16, msg: &str) -> (Vec<u8>, String) {
        let show_errors = self
            .rx
            .route
            .as_ref()
            .map(|r| r.show_errors)
            .unwrap_or(false);
        if let Some(route) = self.rx.route.clone()
            && let Some(doc) = route.error_documents.get(&status)
        {
            let path = route.documents.join(doc.trim_start_matches('/'));
            if let Ok(content) = std::fs::read(&path) {
                let mime = crate::host::mime_for_path(&path);
                return (content, mime);
            }
        }
        let message = status_message(status);
        let plain = self
            .rx
            .header("accept")
            .map(|a| a.contains("text/plain"))
            .unwrap_or(false);
        if plain {
            let mut body = format!("{status} {message}\n");
            if show_errors {
                body.push_str(msg);
                body.push('\n');
            }
            (body.into_bytes(), "text/plain".into())
        } else {
            let detail = if show_errors {
                format!("<p>{msg}</p>")
            } else {
                String::new()
            };
            let body = format!(
                "<!DOCTYPE html>\n<html><head><title>{status} {message}</title></head>\n\
                 <body><h1>{status} {message}</h1>{detail}</body></html>\n"
            );
            (body.into_bytes(), "text/html".into())
        }
    }

    /// Abort: drop everything and close the socket immediately.
    pub fn abort(&mut self) {
        self.conn_error = true;
        self.must_close = true;
        self.close();
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.socket.close();
        self.http.conn_closed();
        if let Some(ip) = self.peer_ip {
            self.http.monitor.inc(Some(ip), Counter::ActiveConnections, -1);
        }
        self.state = ConnState::Complete;
    }

    // ── timers ──

    /// 1 Hz maintenance: returns true when the connection timed out and
    /// was terminated.
    pub fn check_timeouts(&mut self, now: Instant) -> bool {
        if self.closed {
            return false;
        }
        let parse_phase = self.state >= ConnState::Connected && self.state < ConnState::Parsed;
        let timed_out = (parse_phase
            && !self.input.is_empty()
            && now.duration_since(self.request_started) > self.limits.request_parse_timeout)
            || now.duration_since(self.last_activity) > self.limits.inactivity_timeout
            || (self.state > ConnState::Connected
                && self.state < ConnState::Complete
                && now.duration_since(self.request_started) > self.limits.request_timeout);
        if !timed_out {
            return false;
        }
        self.http.trace().event("conn.timeout", 2, &[("seqno", &self.seqno.to_string())]);
        if self.tx.headers_created || self.state == ConnState::Begin || self.state == ConnState::Connected {
            self.abort();
        } else {
            self.handle_error(HttpError::Timeout("request timed out".into()));
            self.protocol();
        }
        true
    }

    /// Whether a HEAD request suppresses the body.
    pub fn omit_body(&self) -> bool {
        self.server_side && self.rx.method == Method::Head
    }

    /// Effective HTTP protocol for the exchange.
    pub fn protocol_version(&self) -> Protocol {
        self.rx.protocol
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}
