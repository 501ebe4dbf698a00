#![allow(dead_code)]

use std::sync::Arc;

use mazurka_http::conn::Conn;
use mazurka_http::router::Route;
use mazurka_http::socket::{MemoryHandle, MemorySocket};
use mazurka_http::{Host, Http};

lazy_static::lazy_static! {
    // One diagnostic subscriber per test binary.
    static ref LOGGING: () = mazurka_http::init_logging_with_level("warn");
}

/// An in-process engine instance driven through memory sockets.
pub struct TestServer {
    pub http: Arc<Http>,
    pub host: Arc<Host>,
}

impl TestServer {
    pub fn new() -> TestServer {
        lazy_static::initialize(&LOGGING);
        let http = Http::new();
        let host = Host::new("*");
        http.add_host(host.clone());
        TestServer { http, host }
    }

    pub fn add_route(&self, route: Route) {
        self.host.add_route(route).expect("route finalization failed");
    }

    /// Open a connection with the given bytes queued as input.
    pub fn open(&self, raw: &[u8]) -> (Conn, MemoryHandle) {
        let socket = MemorySocket::with_input(raw.to_vec());
        let handle = socket.handle();
        let conn = Conn::accept(self.http.clone(), Box::new(socket));
        (conn, handle)
    }

    /// Run one complete request/response exchange.
    pub fn exchange(&self, raw: &[u8]) -> Response {
        let (mut conn, handle) = self.open(raw);
        handle.close_input();
        conn.io_event(true, false);
        parse_response(&handle.output())
    }

    pub fn exchange_raw(&self, raw: &[u8]) -> Vec<u8> {
        let (mut conn, handle) = self.open(raw);
        handle.close_input();
        conn.io_event(true, false);
        handle.output()
    }
}

/// A parsed response. `body` is de-chunked when the response used
/// chunked transfer encoding.
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }
}

pub fn parse_response(raw: &[u8]) -> Response {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .expect("response missing header terminator");
    let head = std::str::from_utf8(&raw[..header_end]).expect("headers are not utf-8");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("missing status line");
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("unparsable status");
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut body = raw[header_end..].to_vec();
    let chunked = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    if chunked {
        body = dechunk(&body);
    }
    Response { status, headers, body, raw: raw.to_vec() }
}

/// Decode a chunked body, panicking on malformed framing so tests
/// catch encoder regressions.
pub fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .expect("chunk size line missing terminator");
        let size_text = std::str::from_utf8(&data[..line_end]).expect("chunk size not utf-8");
        let size = usize::from_str_radix(size_text.trim(), 16).expect("bad chunk size");
        data = &data[line_end + 2..];
        if size == 0 {
            assert!(data.starts_with(b"\r\n"), "missing final CRLF");
            break;
        }
        out.extend_from_slice(&data[..size]);
        assert_eq!(&data[size..size + 2], b"\r\n", "chunk data missing terminator");
        data = &data[size + 2..];
    }
    out
}

/// Split a byte stream holding several sequential HTTP responses.
pub fn split_responses(raw: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let next = rest[8..]
            .windows(9)
            .position(|w| w == b"HTTP/1.1 " || w == b"HTTP/1.0 ")
            .map(|i| i + 8);
        match next {
            Some(at) => {
                parts.push(rest[..at].to_vec());
                rest = &rest[at..];
            }
            None => {
                parts.push(rest.to_vec());
                break;
            }
        }
    }
    parts
}
