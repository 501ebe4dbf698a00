//! Per-request receiver state and the wire parser.
//!
//! One `Rx` lives on each connection and is reset between keep-alive
//! requests. The header parser runs once the blank line is visible in
//! the connection input; body framing (content-length or chunked) is
//! decoded incrementally as bytes arrive.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{HttpError, HttpResult};
use crate::headers::HeaderMap;
use crate::http::{Method, Protocol};
use crate::limits::Limits;
use crate::router::Route;
use crate::session::Session;
use crate::uri::{self, Uri};

/// Chunked-transfer decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Body is not chunked.
    Unchunked,
    /// Expecting a chunk size line. `first` suppresses the leading CRLF
    /// that separates chunks after the first.
    Start { first: bool },
    /// Inside chunk data with this many bytes left.
    Data { remaining: u64 },
    /// Zero-size chunk seen; body complete.
    Eof,
}

/// One byte range from a `Range` header, as parsed. `start == -1` with
/// a positive `end` means "last end bytes"; `end == -1` means "to the
/// end of the entity". Wire values are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: i64,
    pub end: i64,
}

impl RangeSpec {
    /// Resolve against an entity of `length` bytes into (offset, len).
    /// Returns None when the range cannot be satisfied.
    pub fn resolve(&self, length: u64) -> Option<(u64, u64)> {
        let length = length as i64;
        let (start, end) = if self.start < 0 {
            // Suffix range: last N bytes. A zero-length suffix is
            // unsatisfiable by definition.
            if self.end <= 0 {
                return None;
            }
            ((length - self.end).max(0), length - 1)
        } else if self.end < 0 {
            (self.start, length - 1)
        } else {
            (self.start, self.end.min(length - 1))
        };
        if start > end || start >= length {
            return None;
        }
        Some((start as u64, (end - start + 1) as u64))
    }
}

/// A range resolved against a concrete entity length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub offset: u64,
    pub len: u64,
}

impl ResolvedRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// A completed multipart file upload attached to the request.
#[derive(Debug)]
pub struct UploadFile {
    /// Form field name.
    pub name: String,
    /// Filename as supplied by the client.
    pub client_filename: String,
    /// Spool file on disk.
    pub filename: PathBuf,
    pub content_type: Option<String>,
    pub size: u64,
}

/// Receiver state for one request (server side) or one response
/// (client side).
pub struct Rx {
    pub method: Method,
    pub uri_text: String,
    pub uri: Uri,
    /// Decoded, normalized path used for routing. Route prefixes strip
    /// from this.
    pub path_info: String,
    pub protocol: Protocol,
    pub headers: HeaderMap,
    /// Client side: response status and reason.
    pub status: u16,
    pub status_text: String,

    /// Declared content length; -1 when unknown (chunked or until-close).
    pub length: i64,
    pub remaining_content: u64,
    pub bytes_read: u64,
    pub chunk: ChunkState,
    pub eof: bool,

    pub form: bool,
    pub upload: bool,
    pub upload_boundary: Option<String>,
    pub needs_continue: bool,
    pub host_header: Option<String>,
    pub cookie: Option<String>,
    pub origin: Option<String>,
    pub ranges: Vec<RangeSpec>,
    /// Inbound `Content-Range` on a partial PUT: (start, end, total).
    pub in_content_range: Option<(u64, u64, u64)>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub auth_type: Option<String>,
    pub auth_details: Option<String>,
    pub upgrade_websocket: bool,
    pub websocket_key: Option<String>,
    pub websocket_version: u32,
    pub websocket_protocols: Vec<String>,
    /// `Keep-Alive: max=N` cap from the peer.
    pub keep_alive_max: Option<u32>,
    pub must_close: bool,
    pub keep_alive_requested: bool,

    pub route: Option<Arc<Route>>,
    /// Query, form and route-token parameters.
    pub params: BTreeMap<String, String>,
    pub files: Vec<UploadFile>,
    pub session: Option<Session>,
    /// Expanded route target (typically a document-relative filename).
    pub target: String,
    /// Accumulated form body, parsed into params once EOF is seen.
    pub form_body: Vec<u8>,
    /// Bytes consumed from the connection input by the header block.
    pub header_bytes: usize,
}

impl Default for Rx {
    fn default() -> Self {
        Self::new()
    }
}

impl Rx {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            uri_text: String::new(),
            uri: Uri::default(),
            path_info: String::new(),
            protocol: Protocol::Http11,
            headers: HeaderMap::new(),
            status: 0,
            status_text: String::new(),
            length: -1,
            remaining_content: 0,
            bytes_read: 0,
            chunk: ChunkState::Unchunked,
            eof: false,
            form: false,
            upload: false,
            upload_boundary: None,
            needs_continue: false,
            host_header: None,
            cookie: None,
            origin: None,
            ranges: Vec::new(),
            in_content_range: None,
            if_modified_since: None,
            if_unmodified_since: None,
            if_match: None,
            if_none_match: None,
            auth_type: None,
            auth_details: None,
            upgrade_websocket: false,
            websocket_key: None,
            websocket_version: 0,
            websocket_protocols: Vec::new(),
            keep_alive_max: None,
            must_close: false,
            keep_alive_requested: false,
            route: None,
            params: BTreeMap::new(),
            files: Vec::new(),
            session: None,
            target: String::new(),
            form_body: Vec::new(),
            header_bytes: 0,
        }
    }

    /// Look up a request parameter (query, form or route token).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// One cookie's value from the accumulated Cookie header.
    pub fn cookie_value(&self, name: &str) -> Option<&str> {
        let cookies = self.cookie.as_deref()?;
        for pair in cookies.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=')
                && key == name
            {
                return Some(value);
            }
        }
        None
    }

    /// The request content type, parameters stripped.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// Accept-Language tags in the order the client listed them.
    pub fn accept_languages(&self) -> Vec<String> {
        self.header("accept-language")
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|part| {
                        let tag = part.split(';').next().unwrap_or("").trim();
                        if tag.is_empty() {
                            None
                        } else {
                            Some(tag.to_ascii_lowercase())
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse a complete header block (request or response). `buf` must
    /// contain the blank line; returns the number of bytes consumed.
    pub fn parse_headers(&mut self, buf: &[u8], server_side: bool, limits: &Limits) -> HttpResult<usize> {
        let end = find_header_end(buf)
            .ok_or_else(|| HttpError::Parse("incomplete header block".into()))?;
        let block = &buf[..end];

        let mut lines = split_lines(block);
        let first = lines
            .next()
            .ok_or_else(|| HttpError::Parse("missing start line".into()))?;
        if server_side {
            self.parse_request_line(first, limits)?;
        } else {
            self.parse_status_line(first)?;
        }

        let mut count = 0usize;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            count += 1;
            if count > limits.header_max {
                return Err(HttpError::Protocol(413, "too many headers".into()));
            }
            let (key, value) = parse_header_line(line)?;
            self.apply_header(&key, &value, server_side)?;
        }

        self.finish_headers(server_side)?;
        self.header_bytes = end;
        Ok(end)
    }

    fn parse_request_line(&mut self, line: &[u8], limits: &Limits) -> HttpResult<()> {
        let text = std::str::from_utf8(line)
            .map_err(|_| HttpError::Parse("request line is not ascii".into()))?;
        let mut parts = text.split(' ').filter(|p| !p.is_empty());
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let proto = parts.next().unwrap_or("");

        if method.is_empty() {
            return Err(HttpError::Parse("empty method".into()));
        }
        if target.len() > limits.uri_size {
            return Err(HttpError::Protocol(414, "uri exceeds limit".into()));
        }
        if target.is_empty() {
            return Err(HttpError::Parse("empty request target".into()));
        }
        self.method = Method::from_bytes(method.as_bytes());
        self.uri_text = target.to_string();
        self.uri = Uri::parse(target)?;
        self.uri.normalize();
        self.path_info = self.uri.path.clone();
        self.protocol = Protocol::parse(proto)
            .ok_or_else(|| HttpError::Protocol(505, format!("unsupported protocol {proto}")))?;
        if self.protocol == Protocol::Http10 {
            self.must_close = true;
            if self.method.can_have_body() {
                // HTTP/1.0 entity with no framing: read until close.
                self.length = -1;
                self.remaining_content = u64::MAX;
            }
        }
        if let Some(ref query) = self.uri.query {
            for (k, v) in uri::parse_query(query) {
                self.params.insert(k, v);
            }
        }
        Ok(())
    }

    fn parse_status_line(&mut self, line: &[u8]) -> HttpResult<()> {
        let text = std::str::from_utf8(line)
            .map_err(|_| HttpError::Parse("status line is not ascii".into()))?;
        let mut parts = text.splitn(3, ' ');
        let proto = parts.next().unwrap_or("");
        let status = parts.next().unwrap_or("");
        let reason = parts.next().unwrap_or("");
        self.protocol = Protocol::parse(proto)
            .ok_or_else(|| HttpError::Parse(format!("bad response protocol {proto}")))?;
        self.status = status
            .parse::<u16>()
            .map_err(|_| HttpError::Parse(format!("bad status {status}")))?;
        self.status_text = reason.to_string();
        if self.protocol == Protocol::Http10 {
            self.must_close = true;
        }
        Ok(())
    }

    fn apply_header(&mut self, key: &str, value: &str, server_side: bool) -> HttpResult<()> {
        match () {
            _ if key.eq_ignore_ascii_case("content-length") => {
                let length = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| HttpError::Parse(format!("bad content-length {value}")))?;
                if self.chunk == ChunkState::Unchunked {
                    self.length = length as i64;
                    self.remaining_content = length;
                }
            }
            _ if key.eq_ignore_ascii_case("transfer-encoding") => {
                if value.eq_ignore_ascii_case("chunked") {
                    self.chunk = ChunkState::Start { first: true };
                    self.length = -1;
                    self.remaining_content = u64::MAX;
                }
            }
            _ if key.eq_ignore_ascii_case("expect") => {
                if !value.eq_ignore_ascii_case("100-continue") {
                    return Err(HttpError::Parse(format!("unsupported expectation {value}")));
                }
                if self.protocol == Protocol::Http11 {
                    self.needs_continue = true;
                }
            }
            _ if key.eq_ignore_ascii_case("connection") => {
                for token in value.split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        self.must_close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        self.keep_alive_requested = true;
                    }
                }
            }
            _ if key.eq_ignore_ascii_case("keep-alive") => {
                for token in value.split(',') {
                    if let Some(max) = token.trim().strip_prefix("max=")
                        && let Ok(max) = max.parse::<u32>()
                    {
                        self.keep_alive_max = Some(max);
                    }
                }
            }
            _ if key.eq_ignore_ascii_case("host") => {
                self.host_header = Some(value.to_string());
            }
            _ if key.eq_ignore_ascii_case("cookie") => {
                match self.cookie {
                    Some(ref mut cookie) => {
                        cookie.push_str("; ");
                        cookie.push_str(value);
                    }
                    None => self.cookie = Some(value.to_string()),
                }
            }
            _ if key.eq_ignore_ascii_case("origin") => {
                self.origin = Some(value.to_string());
            }
            _ if key.eq_ignore_ascii_case("range") => {
                self.ranges = parse_range_header(value)
                    .ok_or_else(|| HttpError::Protocol(416, format!("malformed range {value}")))?;
            }
            _ if key.eq_ignore_ascii_case("content-range") => {
                self.in_content_range = Some(parse_content_range(value)
                    .ok_or_else(|| HttpError::Parse(format!("malformed content-range {value}")))?);
            }
            _ if key.eq_ignore_ascii_case("content-type") => {
                let lower = value.to_ascii_lowercase();
                if lower.starts_with("multipart/form-data") {
                    self.upload = true;
                    self.upload_boundary = value
                        .split(';')
                        .filter_map(|p| p.trim().strip_prefix("boundary="))
                        .map(|b| b.trim_matches('"').to_string())
                        .next();
                } else if lower.starts_with("application/x-www-form-urlencoded") {
                    self.form = true;
                }
            }
            _ if key.eq_ignore_ascii_case("if-modified-since") => {
                self.if_modified_since = httpdate::parse_http_date(value).ok();
            }
            _ if key.eq_ignore_ascii_case("if-unmodified-since") => {
                self.if_unmodified_since = httpdate::parse_http_date(value).ok();
            }
            _ if key.eq_ignore_ascii_case("if-match") => {
                self.if_match = Some(value.to_string());
            }
            _ if key.eq_ignore_ascii_case("if-none-match") => {
                self.if_none_match = Some(value.to_string());
            }
            _ if key.eq_ignore_ascii_case("authorization") => {
                let mut parts = value.splitn(2, ' ');
                self.auth_type = parts.next().map(|t| t.to_ascii_lowercase());
                self.auth_details = parts.next().map(|d| d.trim().to_string());
            }
            _ if key.eq_ignore_ascii_case("upgrade") => {
                if value.eq_ignore_ascii_case("websocket") {
                    self.upgrade_websocket = true;
                }
            }
            _ if key.eq_ignore_ascii_case("sec-websocket-key") => {
                self.websocket_key = Some(value.to_string());
            }
            _ if key.eq_ignore_ascii_case("sec-websocket-version") => {
                self.websocket_version = value.trim().parse().unwrap_or(0);
            }
            _ if key.eq_ignore_ascii_case("sec-websocket-protocol") => {
                self.websocket_protocols
                    .extend(value.split(',').map(|p| p.trim().to_string()));
            }
            _ if key.eq_ignore_ascii_case("x-http-method-override") && server_side => {
                self.method = Method::from_bytes(value.trim().to_ascii_uppercase().as_bytes());
            }
            _ => {}
        }
        self.headers.add(key, value);
        Ok(())
    }

    fn finish_headers(&mut self, server_side: bool) -> HttpResult<()> {
        if server_side
            && self.length < 0
            && self.chunk == ChunkState::Unchunked
            && self.protocol == Protocol::Http11
        {
            // No framing headers on an HTTP/1.1 request: no body.
            self.length = 0;
            self.remaining_content = 0;
        }
        if !server_side && self.length < 0 && self.chunk == ChunkState::Unchunked {
            // Response body runs until the peer closes.
            self.remaining_content = u64::MAX;
            self.must_close = true;
        }
        Ok(())
    }

    /// Whether the framing layer has delivered the whole body.
    pub fn content_complete(&self) -> bool {
        match self.chunk {
            ChunkState::Unchunked => self.remaining_content == 0,
            ChunkState::Eof => true,
            _ => false,
        }
    }

    /// Incrementally decode body bytes from `input`, appending decoded
    /// content to `out`. Returns the number of input bytes consumed.
    pub fn decode_content(&mut self, input: &[u8], out: &mut Vec<u8>) -> HttpResult<usize> {
        match self.chunk {
            ChunkState::Unchunked => {
                let take = (self.remaining_content).min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..take]);
                self.remaining_content -= take as u64;
                self.bytes_read += take as u64;
                Ok(take)
            }
            ChunkState::Eof => {
                if input.is_empty() {
                    Ok(0)
                } else {
                    Err(HttpError::Parse("data after final chunk".into()))
                }
            }
            _ => self.decode_chunked(input, out),
        }
    }

    fn decode_chunked(&mut self, input: &[u8], out: &mut Vec<u8>) -> HttpResult<usize> {
        let mut pos = 0;
        loop {
            match self.chunk {
                ChunkState::Start { first } => {
                    let rest = &input[pos..];
                    if rest.is_empty() {
                        return Ok(pos);
                    }
                    let mut cursor = 0;
                    if !first {
                        if rest.len() < 2 {
                            return Ok(pos);
                        }
                        if &rest[..2] != b"\r\n" {
                            return Err(HttpError::Parse("missing CRLF before chunk".into()));
                        }
                        cursor = 2;
                    }
                    let Some(line_end) = memchr::memmem::find(&rest[cursor..], b"\r\n") else {
                        // No terminator yet; bound the spec line length.
                        if rest.len() - cursor > 80 {
                            return Err(HttpError::Parse("chunk specification too long".into()));
                        }
                        return Ok(pos);
                    };
                    if line_end > 80 {
                        return Err(HttpError::Parse("chunk specification too long".into()));
                    }
                    let spec = &rest[cursor..cursor + line_end];
                    let hex_part = match memchr::memchr(b';', spec) {
                        Some(idx) => &spec[..idx],
                        None => spec,
                    };
                    let hex = std::str::from_utf8(hex_part)
                        .map_err(|_| HttpError::Parse("bad chunk size".into()))?
                        .trim();
                    let size = u64::from_str_radix(hex, 16)
                        .map_err(|_| HttpError::Parse(format!("bad chunk size {hex}")))?;
                    pos += cursor + line_end + 2;
                    if size == 0 {
                        // Terminating chunk. The final CRLF follows; if it
                        // is not here yet, rewind and wait for more input.
                        if input.len() - pos < 2 {
                            pos -= cursor + line_end + 2;
                            return Ok(pos);
                        }
                        if &input[pos..pos + 2] != b"\r\n" {
                            return Err(HttpError::Parse("missing chunk trailer".into()));
                        }
                        pos += 2;
                        self.chunk = ChunkState::Eof;
                        return Ok(pos);
                    }
                    self.chunk = ChunkState::Data { remaining: size };
                }
                ChunkState::Data { remaining } => {
                    let avail = &input[pos..];
                    if avail.is_empty() {
                        return Ok(pos);
                    }
                    let take = (remaining).min(avail.len() as u64) as usize;
                    out.extend_from_slice(&avail[..take]);
                    pos += take;
                    self.bytes_read += take as u64;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.chunk = ChunkState::Start { first: false };
                    } else {
                        self.chunk = ChunkState::Data { remaining: left };
                        return Ok(pos);
                    }
                }
                ChunkState::Eof | ChunkState::Unchunked => return Ok(pos),
            }
        }
    }
}

/// Find the end of the header block: `\r\n\r\n` or bare `\n\n`.
/// Returns the offset just past the terminator.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = memchr::memmem::find(buf, b"\r\n\r\n").map(|i| i + 4);
    let lf = memchr::memmem::find(buf, b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n').map(|line| match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    })
}

fn parse_header_line(line: &[u8]) -> HttpResult<(String, String)> {
    let colon = memchr::memchr(b':', line)
        .ok_or_else(|| HttpError::Parse("header line missing colon".into()))?;
    let key = std::str::from_utf8(&line[..colon])
        .map_err(|_| HttpError::Parse("header key is not ascii".into()))?
        .trim();
    if key.is_empty() {
        return Err(HttpError::Parse("empty header key".into()));
    }
    if key.bytes().any(|b| matches!(b, b'%' | b'<' | b'>' | b'/' | b'\\')) {
        return Err(HttpError::Parse(format!("bad character in header key {key}")));
    }
    let value = std::str::from_utf8(&line[colon + 1..])
        .map_err(|_| HttpError::Parse("header value is not utf-8".into()))?
        .trim()
        .to_string();
    Ok((key.to_string(), value))
}

/// Parse `bytes=S-E,S-E,...`. Returns None on any malformed part.
fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (start_text, end_text) = part.split_once('-')?;
        let range = if start_text.is_empty() {
            // Suffix form "-N".
            let n = end_text.parse::<i64>().ok()?;
            RangeSpec { start: -1, end: n }
        } else {
            let start = start_text.parse::<i64>().ok()?;
            let end = if end_text.is_empty() {
                -1
            } else {
                end_text.parse::<i64>().ok()?
            };
            RangeSpec { start, end }
        };
        ranges.push(range);
    }
    if ranges.is_empty() { None } else { Some(ranges) }
}

/// Parse `bytes S-E/T` from an inbound Content-Range.
fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
        total.trim().parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Rx {
        let mut rx = Rx::new();
        rx.parse_headers(text.as_bytes(), true, &Limits::default()).unwrap();
        rx
    }

    #[test]
    fn request_line_and_headers() {
        let rx = parse("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n");
        assert_eq!(rx.method, Method::Get);
        assert_eq!(rx.path_info, "/a/b");
        assert_eq!(rx.param("x"), Some("1"));
        assert_eq!(rx.host_header.as_deref(), Some("example.com"));
        assert_eq!(rx.cookie.as_deref(), Some("a=1; b=2"));
        assert_eq!(rx.length, 0);
    }

    #[test]
    fn http10_implies_close() {
        let rx = parse("GET / HTTP/1.0\r\n\r\n");
        assert!(rx.must_close);
    }

    #[test]
    fn oversize_uri_maps_to_414() {
        let mut rx = Rx::new();
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "x".repeat(600));
        let err = rx.parse_headers(long.as_bytes(), true, &Limits::default()).unwrap_err();
        assert_eq!(err.status(), 414);
    }

    #[test]
    fn bad_header_key_rejected() {
        let mut rx = Rx::new();
        let err = rx
            .parse_headers(b"GET / HTTP/1.1\r\nBad/Key: 1\r\n\r\n", true, &Limits::default())
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn duplicate_headers_merge() {
        let rx = parse("GET / HTTP/1.1\r\nAccept: a\r\nAccept: b\r\n\r\n");
        assert_eq!(rx.header("accept"), Some("a, b"));
    }

    #[test]
    fn chunked_decode_round_trip() {
        let mut rx = Rx::new();
        rx.parse_headers(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            true,
            &Limits::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        let body = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let used = rx.decode_content(body, &mut out).unwrap();
        assert_eq!(used, body.len());
        assert_eq!(out, b"hello world");
        assert!(rx.content_complete());
    }

    #[test]
    fn chunked_decode_across_splits() {
        let mut rx = Rx::new();
        rx.parse_headers(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            true,
            &Limits::default(),
        )
        .unwrap();
        let body = b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";
        let mut out = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        for chunk in body.chunks(4) {
            pending.extend_from_slice(chunk);
            let used = rx.decode_content(&pending, &mut out).unwrap();
            pending.drain(..used);
        }
        assert_eq!(out, b"abcdef");
        assert!(rx.content_complete());
    }

    #[test]
    fn data_after_final_chunk_is_an_error() {
        let mut rx = Rx::new();
        rx.parse_headers(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            true,
            &Limits::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        rx.decode_content(b"0\r\n\r\n", &mut out).unwrap();
        assert!(rx.decode_content(b"junk", &mut out).is_err());
    }

    #[test]
    fn bad_chunk_size_rejected() {
        let mut rx = Rx::new();
        rx.parse_headers(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            true,
            &Limits::default(),
        )
        .unwrap();
        let mut out = Vec::new();
        assert!(rx.decode_content(b"zz\r\nhello\r\n", &mut out).is_err());
    }

    #[test]
    fn range_parsing_and_resolution() {
        let ranges = parse_range_header("bytes=0-9,50-59").unwrap();
        assert_eq!(ranges[0].resolve(100), Some((0, 10)));
        assert_eq!(ranges[1].resolve(100), Some((50, 10)));

        let suffix = parse_range_header("bytes=-10").unwrap();
        assert_eq!(suffix[0].resolve(100), Some((90, 10)));

        let open = parse_range_header("bytes=95-").unwrap();
        assert_eq!(open[0].resolve(100), Some((95, 5)));

        let zero_suffix = parse_range_header("bytes=-0").unwrap();
        assert_eq!(zero_suffix[0].resolve(100), None);

        let beyond = parse_range_header("bytes=200-300").unwrap();
        assert_eq!(beyond[0].resolve(100), None);

        assert!(parse_range_header("lines=1-2").is_none());
    }

    #[test]
    fn method_override_applies() {
        let rx = parse("POST / HTTP/1.1\r\nX-HTTP-Method-Override: DELETE\r\n\r\n");
        assert_eq!(rx.method, Method::Delete);
    }

    #[test]
    fn cookie_values_resolve_by_name() {
        let rx = parse("GET / HTTP/1.1\r\nCookie: a=1; b=2\r\nCookie: c=3\r\n\r\n");
        assert_eq!(rx.cookie_value("a"), Some("1"));
        assert_eq!(rx.cookie_value("c"), Some("3"));
        assert_eq!(rx.cookie_value("d"), None);
    }

    #[test]
    fn content_type_strips_parameters() {
        let rx = parse("POST / HTTP/1.1\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(rx.content_type(), Some("text/html"));
    }

    #[test]
    fn accept_languages_preserve_order() {
        let rx = parse("GET / HTTP/1.1\r\nAccept-Language: fr-FR, en;q=0.8, de;q=0.5\r\n\r\n");
        assert_eq!(rx.accept_languages(), vec!["fr-fr", "en", "de"]);
    }

    #[test]
    fn expect_continue_only_on_http11() {
        let rx = parse("POST / HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n");
        assert!(rx.needs_continue);
        let mut rx10 = Rx::new();
        rx10.parse_headers(
            b"POST / HTTP/1.0\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
            true,
            &Limits::default(),
        )
        .unwrap();
        assert!(!rx10.needs_continue);
    }
}
